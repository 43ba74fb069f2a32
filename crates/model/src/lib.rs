pub mod batch;
mod block;
pub mod config;
pub mod heads;
pub mod model;
pub mod params;
mod rotary;

pub use batch::{Batch, TaskLabels, TransformerBatch};
pub use config::{LabelerKind, RotaryMode, TaskDescriptor, TransformerConfig};
pub use heads::TaskOutput;
pub use model::{EhrTransformer, Init, ParameterSpec, Phase, Representations};
pub use params::{ParamPath, ParameterSet};
