use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use clmbr_model::{Batch, LabelerKind, TaskDescriptor, TaskLabels, TaskOutput};

use crate::TrainingError;

/// Task objective evaluated over the valid label slots of a batch (`slot < num_indices`).
#[derive(Debug, Clone)]
pub struct TaskLoss {
    task: TaskDescriptor,
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// f32 scalar, differentiable.
    pub loss: Tensor,
    pub metrics: LossMetrics,
    /// Host copies of the head outputs, filled when requested for evaluation.
    pub predictions: Option<Predictions>,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    num_indices: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn num_indices(&self) -> usize {
        self.num_indices
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predictions {
    Boolean {
        logits: Vec<f32>,
        labels: Vec<bool>,
    },
    Survival {
        /// `[slot][bin]`
        log_hazards: Vec<Vec<f32>>,
        event_times: Vec<f32>,
        is_censor: Vec<bool>,
    },
}

impl TaskLoss {
    pub fn new(task: TaskDescriptor) -> Self {
        Self { task }
    }

    pub fn compute(
        &self,
        output: &TaskOutput,
        batch: &Batch,
        requires_logits: bool,
    ) -> Result<LossOutput, TrainingError> {
        let n = batch.num_indices;
        if n == 0 {
            return Err(TrainingError::runtime(
                "no valid label slots available for loss computation",
            ));
        }

        let (loss, predictions) = match (&self.task, output, &batch.task) {
            (TaskDescriptor::Clmbr { .. }, TaskOutput::Clmbr { logits }, TaskLabels::Clmbr { labels }) => {
                (cross_entropy(logits, &labels[..n])?, None)
            }
            (
                TaskDescriptor::SurvivalClmbr {
                    time_bins,
                    num_codes,
                    ..
                },
                TaskOutput::SurvivalClmbr { log_hazards },
                TaskLabels::SurvivalClmbr {
                    event_times,
                    is_censor,
                },
            ) => {
                let count = n * num_codes;
                if event_times.len() < count || is_censor.len() < count {
                    return Err(TrainingError::runtime(
                        "survival labels do not cover every code of every valid slot",
                    ));
                }
                let log_hazards = slots(log_hazards, n)?;
                let loss = piecewise_exponential(
                    &log_hazards,
                    time_bins,
                    &event_times[..count],
                    &is_censor[..count],
                    *num_codes,
                )?;
                (loss, None)
            }
            (
                TaskDescriptor::LabeledPatients {
                    labeler: LabelerKind::Boolean,
                },
                TaskOutput::Boolean { logits },
                TaskLabels::Boolean { labels, .. },
            ) => {
                let logits = slots(logits, n)?;
                let loss = binary_cross_entropy(&logits, &labels[..n])?;
                let predictions = if requires_logits {
                    Some(Predictions::Boolean {
                        logits: logits.to_vec1::<f32>().map_err(to_runtime_error)?,
                        labels: labels[..n].to_vec(),
                    })
                } else {
                    None
                };
                (loss, predictions)
            }
            (
                TaskDescriptor::LabeledPatients {
                    labeler: LabelerKind::Survival { time_bins, .. },
                },
                TaskOutput::Survival { log_hazards },
                TaskLabels::Survival {
                    event_times,
                    is_censor,
                    ..
                },
            ) => {
                let log_hazards = slots(log_hazards, n)?;
                let loss = piecewise_exponential(
                    &log_hazards.unsqueeze(2).map_err(to_runtime_error)?,
                    time_bins,
                    &event_times[..n],
                    &is_censor[..n],
                    1,
                )?;
                let predictions = if requires_logits {
                    Some(Predictions::Survival {
                        log_hazards: log_hazards.to_vec2::<f32>().map_err(to_runtime_error)?,
                        event_times: event_times[..n].to_vec(),
                        is_censor: is_censor[..n].to_vec(),
                    })
                } else {
                    None
                };
                (loss, predictions)
            }
            _ => {
                return Err(TrainingError::runtime(format!(
                    "batch labels do not match the {} task",
                    self.task.name()
                )))
            }
        };

        let average_loss = loss.to_vec0::<f32>().map_err(to_runtime_error)?;
        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                num_indices: n,
            },
            predictions,
        })
    }
}

/// First `n` slots of a head output, promoted to f32.
fn slots(tensor: &Tensor, n: usize) -> Result<Tensor, TrainingError> {
    tensor
        .narrow(0, 0, n)
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)
}

fn cross_entropy(logits: &Tensor, labels: &[u32]) -> Result<Tensor, TrainingError> {
    let n = labels.len();
    let logits = slots(logits, n)?;
    let vocab = logits.dim(1).map_err(to_runtime_error)?;
    if let Some(bad) = labels.iter().find(|&&label| label as usize >= vocab) {
        return Err(TrainingError::runtime(format!(
            "label {} outside vocabulary of {}",
            bad, vocab
        )));
    }
    let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
    let targets = Tensor::from_slice(labels, (n, 1), logits.device()).map_err(to_runtime_error)?;
    log_probs
        .gather(&targets, 1)
        .map_err(to_runtime_error)?
        .mean_all()
        .map_err(to_runtime_error)?
        .neg()
        .map_err(to_runtime_error)
}

/// `relu(z) - z * y + log(1 + exp(-|z|))`, averaged.
fn binary_cross_entropy(logits: &Tensor, labels: &[bool]) -> Result<Tensor, TrainingError> {
    let targets: Vec<f32> = labels.iter().map(|&label| if label { 1.0 } else { 0.0 }).collect();
    let targets =
        Tensor::from_vec(targets, labels.len(), logits.device()).map_err(to_runtime_error)?;
    let softplus = logits
        .abs()
        .map_err(to_runtime_error)?
        .neg()
        .map_err(to_runtime_error)?
        .exp()
        .map_err(to_runtime_error)?
        .affine(1.0, 1.0)
        .map_err(to_runtime_error)?
        .log()
        .map_err(to_runtime_error)?;
    let per_example = logits
        .relu()
        .map_err(to_runtime_error)?
        .sub(&logits.mul(&targets).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?
        .add(&softplus)
        .map_err(to_runtime_error)?;
    per_example.mean_all().map_err(to_runtime_error)
}

/// Piecewise-exponential negative log-likelihood.
///
/// `log_hazards` is `[n, bins, codes]`; `event_times`/`is_censor` are row-major `[n][codes]`.
/// Each bin contributes `exp(log h) * exposure - event * log h`, normalized by `n * codes`.
pub(crate) fn piecewise_exponential(
    log_hazards: &Tensor,
    time_bins: &[f32],
    event_times: &[f32],
    is_censor: &[bool],
    codes: usize,
) -> Result<Tensor, TrainingError> {
    let (n, bins, width) = log_hazards.dims3().map_err(to_runtime_error)?;
    if bins != time_bins.len() || width != codes {
        return Err(TrainingError::runtime(format!(
            "hazards of shape [{}, {}, {}] do not match {} time bins and {} codes",
            n,
            bins,
            width,
            time_bins.len(),
            codes
        )));
    }

    let (exposure, events) = survival_targets(time_bins, event_times, is_censor, n, codes);
    let device = log_hazards.device();
    let exposure = Tensor::from_vec(exposure, (n, bins, codes), device).map_err(to_runtime_error)?;
    let events = Tensor::from_vec(events, (n, bins, codes), device).map_err(to_runtime_error)?;

    let expected = log_hazards
        .exp()
        .map_err(to_runtime_error)?
        .mul(&exposure)
        .map_err(to_runtime_error)?;
    let observed = log_hazards.mul(&events).map_err(to_runtime_error)?;
    expected
        .sub(&observed)
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .affine(1.0 / (n * codes) as f64, 0.0)
        .map_err(to_runtime_error)
}

/// Per-bin exposure and event indicators, laid out `[slot][bin][code]`.
fn survival_targets(
    time_bins: &[f32],
    event_times: &[f32],
    is_censor: &[bool],
    n: usize,
    codes: usize,
) -> (Vec<f32>, Vec<f32>) {
    let bins = time_bins.len();
    let mut exposure = vec![0.0f32; n * bins * codes];
    let mut events = vec![0.0f32; n * bins * codes];
    for slot in 0..n {
        for code in 0..codes {
            let time = event_times[slot * codes + code];
            let censored = is_censor[slot * codes + code];
            for (bin, &start) in time_bins.iter().enumerate() {
                let end = time_bins.get(bin + 1).copied().unwrap_or(f32::INFINITY);
                let offset = (slot * bins + bin) * codes + code;
                exposure[offset] = (time.min(end) - start).max(0.0);
                if !censored && start <= time && time < end {
                    events[offset] = 1.0;
                }
            }
        }
    }
    (exposure, events)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use clmbr_model::TransformerBatch;

    fn batch(num_indices: usize, task: TaskLabels) -> Batch {
        Batch {
            num_indices,
            patient_ids: vec![1],
            offsets: vec![0],
            transformer: TransformerBatch {
                length: 3,
                tokens: vec![1, 2, 3],
                ages: vec![0.0, 1.0, 2.0],
                integer_ages: vec![0, 1440, 2880],
                valid_tokens: vec![true, true, true],
                label_indices: vec![0, 1, 2],
                hierarchical_tokens: vec![],
                hierarchical_weights: vec![],
                token_offsets: vec![],
            },
            task,
        }
    }

    #[test]
    fn cross_entropy_ignores_padding_slots() {
        let loss = TaskLoss::new(TaskDescriptor::Clmbr { vocab_size: 2 });
        let logits = Tensor::new(&[[0.0f32, 0.0], [0.0, 0.0], [100.0, -100.0]], &Device::Cpu).unwrap();
        let out = loss
            .compute(
                &TaskOutput::Clmbr { logits },
                &batch(2, TaskLabels::Clmbr { labels: vec![0, 1, 1] }),
                false,
            )
            .unwrap();
        assert!((out.metrics.average_loss() - std::f32::consts::LN_2).abs() < 1e-6);
        assert_eq!(out.metrics.num_indices(), 2);
        assert!(out.predictions.is_none());
    }

    #[test]
    fn binary_cross_entropy_is_stable_for_large_logits() {
        let loss = TaskLoss::new(TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Boolean,
        });
        let logits = Tensor::new(&[200.0f32, -200.0, 0.0], &Device::Cpu).unwrap();
        let out = loss
            .compute(
                &TaskOutput::Boolean { logits },
                &batch(
                    3,
                    TaskLabels::Boolean {
                        labels: vec![true, false, true],
                        label_ages: vec![0, 0, 0],
                    },
                ),
                true,
            )
            .unwrap();
        let expected = std::f32::consts::LN_2 / 3.0;
        assert!((out.metrics.average_loss() - expected).abs() < 1e-6);
        match out.predictions {
            Some(Predictions::Boolean { logits, labels }) => {
                assert_eq!(logits, vec![200.0, -200.0, 0.0]);
                assert_eq!(labels, vec![true, false, true]);
            }
            other => panic!("unexpected predictions {other:?}"),
        }
    }

    #[test]
    fn survival_targets_split_exposure_across_bins() {
        let (exposure, events) = survival_targets(&[0.0, 10.0, 20.0], &[15.0, 25.0], &[false, true], 2, 1);
        assert_eq!(exposure, vec![10.0, 5.0, 0.0, 10.0, 10.0, 5.0]);
        assert_eq!(events, vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn piecewise_exponential_matches_closed_form() {
        // Code 0 has its event at 2 (exposure 2 in bin 0). Code 1 is censored at 6
        // (exposure 4 in bin 0, 2 in bin 1). Total exposure 8, one event.
        let loss_at = |log_hazard: f32| {
            let hazards = Tensor::full(log_hazard, (1, 2, 2), &Device::Cpu).unwrap();
            piecewise_exponential(&hazards, &[0.0, 4.0], &[2.0, 6.0], &[false, true], 2)
                .unwrap()
                .to_vec0::<f32>()
                .unwrap()
        };

        // log h = 0: only the exposure term remains.
        assert!((loss_at(0.0) - 8.0 / 2.0).abs() < 1e-6);

        // log h = ln 2: exposure doubles and the event subtracts ln 2.
        let ln2 = std::f32::consts::LN_2;
        assert!((loss_at(ln2) - (2.0 * 8.0 - ln2) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let loss = TaskLoss::new(TaskDescriptor::Clmbr { vocab_size: 2 });
        let logits = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let result = loss.compute(
            &TaskOutput::Boolean { logits },
            &batch(1, TaskLabels::Clmbr { labels: vec![0] }),
            false,
        );
        assert!(result.is_err());
    }
}
