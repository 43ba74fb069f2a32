pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluation;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod partition;
pub mod representations;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{BestRecord, FreezeSelection};
pub use config::{Precision, RunConfig, TrainingConfig, TrainingError};
pub use data::{
    BatchInfo, BatchStore, BatchStream, BatchTask, DirectoryBatchStore, InMemoryBatchStore, Split,
};
pub use evaluation::{EvaluationReport, Evaluator};
pub use loss::{LossMetrics, LossOutput, TaskLoss};
pub use optimizer::{
    GradientScaler, OptimizerState, TrainerOptimizer, TrainerOptimizerOptions,
};
pub use partition::ParameterPartition;
pub use representations::{
    align_representations, ExtractionOptions, RepresentationExtractor, RepresentationOutput,
};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{select_device, StopReason, Trainer, TrainingOutcome};
