use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Where rotary position encoding is applied, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotaryMode {
    None,
    /// Rotate the full hidden vector before it is split into heads.
    Global,
    /// Rotate each head independently.
    PerHead,
}

/// Hyperparameters of the sequence transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    /// Number of preceding tokens a position may attend to.
    pub attention_width: usize,
    pub rotary: RotaryMode,
    pub is_hierarchical: bool,
    #[serde(default)]
    pub internal_dropout: f32,
}

impl TransformerConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.intermediate_size == 0 {
            return Err(Error::Msg(
                "intermediate_size must be greater than zero".into(),
            ));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.hidden_size % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "hidden_size ({}) must be divisible by n_heads ({})",
                self.hidden_size, self.n_heads
            )));
        }
        if self.attention_width == 0 {
            return Err(Error::Msg("attention_width must be greater than zero".into()));
        }
        match self.rotary {
            RotaryMode::Global if self.hidden_size % 2 != 0 => {
                return Err(Error::Msg(
                    "global rotary encoding requires an even hidden_size".into(),
                ));
            }
            RotaryMode::PerHead if self.head_dim() % 2 != 0 => {
                return Err(Error::Msg(
                    "per-head rotary encoding requires an even head dimension".into(),
                ));
            }
            _ => {}
        }
        if !(0.0..1.0).contains(&self.internal_dropout) {
            return Err(Error::Msg("internal_dropout must be in [0, 1)".into()));
        }
        Ok(())
    }
}

/// The objective a model is trained for. Each variant fixes the shape of its task head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDescriptor {
    /// Next-code prediction over the vocabulary.
    Clmbr { vocab_size: usize },
    /// Time-to-next-occurrence for a fixed code set over piecewise-constant hazard bins.
    SurvivalClmbr {
        time_bins: Vec<f32>,
        num_codes: usize,
        dim: usize,
    },
    /// Downstream task over externally supplied labels.
    LabeledPatients { labeler: LabelerKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "labeler_type", rename_all = "snake_case")]
pub enum LabelerKind {
    Boolean,
    Survival { time_bins: Vec<f32>, dim: usize },
}

impl TaskDescriptor {
    pub fn name(&self) -> &'static str {
        match self {
            TaskDescriptor::Clmbr { .. } => "clmbr",
            TaskDescriptor::SurvivalClmbr { .. } => "survival_clmbr",
            TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Boolean,
            } => "labeled_patients/boolean",
            TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Survival { .. },
            } => "labeled_patients/survival",
        }
    }

    /// Time-bin start boundaries for survival objectives.
    pub fn time_bins(&self) -> Option<&[f32]> {
        match self {
            TaskDescriptor::SurvivalClmbr { time_bins, .. }
            | TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Survival { time_bins, .. },
            } => Some(time_bins),
            _ => None,
        }
    }

    pub fn is_labeled(&self) -> bool {
        matches!(self, TaskDescriptor::LabeledPatients { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            TaskDescriptor::Clmbr { vocab_size } => {
                if *vocab_size == 0 {
                    return Err(Error::Msg("clmbr vocab_size must be greater than zero".into()));
                }
            }
            TaskDescriptor::SurvivalClmbr {
                time_bins,
                num_codes,
                dim,
            } => {
                validate_time_bins(time_bins)?;
                if *num_codes == 0 || *dim == 0 {
                    return Err(Error::Msg(
                        "survival_clmbr requires a non-empty code set and dim".into(),
                    ));
                }
            }
            TaskDescriptor::LabeledPatients { labeler } => {
                if let LabelerKind::Survival { time_bins, dim } = labeler {
                    validate_time_bins(time_bins)?;
                    if *dim == 0 {
                        return Err(Error::Msg("survival labeler dim must be positive".into()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_time_bins(time_bins: &[f32]) -> Result<()> {
    if time_bins.is_empty() {
        return Err(Error::Msg("time_bins must not be empty".into()));
    }
    if time_bins[0] != 0.0 {
        return Err(Error::Msg("time_bins must start at zero".into()));
    }
    if time_bins.windows(2).any(|pair| pair[1] <= pair[0]) {
        return Err(Error::Msg("time_bins must be strictly increasing".into()));
    }
    Ok(())
}
