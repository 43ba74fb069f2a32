use candle_core::{Result, Tensor};

use crate::{
    block::linear,
    config::{LabelerKind, TaskDescriptor},
    params::ParameterSet,
};

pub const CLMBR_HEAD: &str = "clmbr_task/linear";
pub const SURVIVAL_CLMBR_HEAD: &str = "survival_clmbr_task/linear";
pub const SURVIVAL_CLMBR_CODES: &str = "survival_clmbr_task";
pub const BOOLEAN_HEAD: &str = "boolean_classifier/linear";
pub const SURVIVAL_HEAD: &str = "survival_task/linear";
pub const SURVIVAL_CODES: &str = "survival_task";

/// Raw task-head outputs, one row per label slot (padding slots included).
#[derive(Debug, Clone)]
pub enum TaskOutput {
    /// `[slots, vocab]`
    Clmbr { logits: Tensor },
    /// `[slots, bins, codes]`
    SurvivalClmbr { log_hazards: Tensor },
    /// `[slots]`
    Boolean { logits: Tensor },
    /// `[slots, bins]`
    Survival { log_hazards: Tensor },
}

pub(crate) fn apply_head(
    task: &TaskDescriptor,
    features: &Tensor,
    params: &ParameterSet,
) -> Result<TaskOutput> {
    match task {
        TaskDescriptor::Clmbr { .. } => Ok(TaskOutput::Clmbr {
            logits: linear(features, params, CLMBR_HEAD)?,
        }),
        TaskDescriptor::SurvivalClmbr { time_bins, dim, .. } => {
            let log_hazards = piecewise_log_hazards(
                features,
                params,
                SURVIVAL_CLMBR_HEAD,
                SURVIVAL_CLMBR_CODES,
                time_bins.len(),
                *dim,
            )?;
            Ok(TaskOutput::SurvivalClmbr { log_hazards })
        }
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Boolean,
        } => Ok(TaskOutput::Boolean {
            logits: linear(features, params, BOOLEAN_HEAD)?.squeeze(1)?,
        }),
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Survival { time_bins, dim },
        } => {
            let log_hazards = piecewise_log_hazards(
                features,
                params,
                SURVIVAL_HEAD,
                SURVIVAL_CODES,
                time_bins.len(),
                *dim,
            )?;
            Ok(TaskOutput::Survival {
                log_hazards: log_hazards.squeeze(2)?,
            })
        }
    }
}

/// Projects features to a per-bin embedding and scores it against every code embedding.
fn piecewise_log_hazards(
    features: &Tensor,
    params: &ParameterSet,
    projection: &str,
    codes: &str,
    bins: usize,
    dim: usize,
) -> Result<Tensor> {
    let slots = features.dim(0)?;
    let binned = linear(features, params, projection)?.reshape((slots, bins, dim))?;
    let code_weight = params.require(codes, "code_weight")?.t()?.contiguous()?;
    let code_bias = params.require(codes, "code_weight_bias")?;
    binned.broadcast_matmul(&code_weight)?.broadcast_add(code_bias)
}
