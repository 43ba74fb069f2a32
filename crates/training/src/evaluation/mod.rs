pub mod statistics;

use clmbr_model::{EhrTransformer, LabelerKind, ParameterSet, Phase, TaskDescriptor};
use serde::{Deserialize, Serialize};

use crate::{
    data::{BatchStore, Split},
    loss::{Predictions, TaskLoss},
    metrics::EvaluationMetrics,
    TrainingError,
};

/// Quantile of observed event times above which survival evaluation right-censors.
pub const CENSORING_QUANTILE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Loss weighted by each batch's valid label-slot count.
    pub loss: f64,
    /// Unweighted mean over batches.
    pub loss2: f64,
    /// Higher is better. Equals `-loss` for tasks without a ranking statistic.
    pub c_statistic: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auroc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_precision: Option<f64>,
    pub num_indices: u64,
    pub batches: usize,
}

impl EvaluationReport {
    /// Single lower-is-better criterion used for best tracking and early stopping.
    pub fn metric(&self) -> f64 {
        -self.c_statistic
    }
}

/// Deterministic held-out evaluation over a bounded prefix of a split.
pub struct Evaluator<'a> {
    model: &'a EhrTransformer,
    loss: TaskLoss,
}

impl<'a> Evaluator<'a> {
    pub fn new(model: &'a EhrTransformer) -> Self {
        Self {
            model,
            loss: TaskLoss::new(model.task().clone()),
        }
    }

    pub fn evaluate(
        &self,
        params: &ParameterSet,
        store: &dyn BatchStore,
        split: Split,
        max_batches: usize,
    ) -> Result<EvaluationReport, TrainingError> {
        let task = self.model.task();
        let requires_logits = task.is_labeled();
        let count = store.batch_count(split).min(max_batches);

        let mut metrics = EvaluationMetrics::default();
        let mut logits = Vec::new();
        let mut labels = Vec::new();
        let mut log_hazards = Vec::new();
        let mut event_times = Vec::new();
        let mut is_censor = Vec::new();

        for index in 0..count {
            let batch = store.batch(split, index)?;
            if batch.is_empty() {
                continue;
            }
            let output = self
                .model
                .forward(params, &batch, &mut Phase::Eval)
                .map_err(|err| {
                    TrainingError::runtime(format!("{split} batch {index} forward failed: {err}"))
                })?;
            let result = self.loss.compute(&output, &batch, requires_logits)?;
            metrics.update(
                result.metrics.average_loss() as f64,
                result.metrics.num_indices(),
            );
            match result.predictions {
                Some(Predictions::Boolean {
                    logits: batch_logits,
                    labels: batch_labels,
                }) => {
                    logits.extend(batch_logits);
                    labels.extend(batch_labels);
                }
                Some(Predictions::Survival {
                    log_hazards: batch_hazards,
                    event_times: batch_times,
                    is_censor: batch_censor,
                }) => {
                    log_hazards.extend(batch_hazards);
                    event_times.extend(batch_times);
                    is_censor.extend(batch_censor);
                }
                None => {}
            }
        }

        let summary = metrics.finalize().ok_or_else(|| {
            TrainingError::runtime(format!(
                "{split} split has no valid label slots in its first {count} batches"
            ))
        })?;

        let mut report = EvaluationReport {
            loss: summary.loss,
            loss2: summary.loss2,
            c_statistic: -summary.loss,
            auroc: None,
            average_precision: None,
            num_indices: summary.num_indices,
            batches: summary.batches,
        };
        match task {
            TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Boolean,
            } => {
                let auroc = statistics::roc_auc(&labels, &logits);
                report.c_statistic = auroc;
                report.auroc = Some(auroc);
                report.average_precision = Some(statistics::average_precision(&labels, &logits));
            }
            TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Survival { time_bins, .. },
            } => {
                let truncated =
                    statistics::truncate_censoring(&event_times, &is_censor, CENSORING_QUANTILE);
                report.c_statistic = statistics::concordance_statistic(
                    &log_hazards,
                    time_bins,
                    &truncated.times,
                    &truncated.is_censor,
                );
            }
            TaskDescriptor::Clmbr { .. } | TaskDescriptor::SurvivalClmbr { .. } => {}
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        BatchInfo, BatchTask, BatchTransformerInfo, InMemoryBatchStore, LabelerType,
    };
    use candle_core::Device;
    use clmbr_model::{Batch, RotaryMode, TaskLabels, TransformerBatch, TransformerConfig};

    fn config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 6,
            hidden_size: 8,
            intermediate_size: 16,
            n_heads: 2,
            n_layers: 1,
            attention_width: 4,
            rotary: RotaryMode::PerHead,
            is_hierarchical: false,
            internal_dropout: 0.0,
        }
    }

    fn batch(num_indices: usize, task: TaskLabels) -> Batch {
        Batch {
            num_indices,
            patient_ids: vec![1],
            offsets: vec![0],
            transformer: TransformerBatch {
                length: 4,
                tokens: vec![1, 2, 3, 4],
                ages: vec![0.0, 1.0, 2.0, 3.0],
                integer_ages: vec![0, 1440, 2880, 4320],
                valid_tokens: vec![true; 4],
                label_indices: vec![1, 2, 3],
                hierarchical_tokens: vec![],
                hierarchical_weights: vec![],
                token_offsets: vec![],
            },
            task,
        }
    }

    fn store(task: BatchTask, batches: Vec<Batch>) -> InMemoryBatchStore {
        let info = BatchInfo {
            seed: 0,
            task,
            transformer: BatchTransformerInfo {
                vocab_size: 6,
                is_hierarchical: false,
                note_embedding_data: None,
            },
        };
        InMemoryBatchStore::new(info).with_split(Split::Dev, batches)
    }

    #[test]
    fn clmbr_metric_is_negative_loss_and_repeatable() {
        let model = EhrTransformer::new(config(), TaskDescriptor::Clmbr { vocab_size: 6 }).unwrap();
        let params = model.init(3, &Device::Cpu).unwrap();
        let store = store(
            BatchTask::Clmbr { vocab_size: 6 },
            vec![
                batch(3, TaskLabels::Clmbr { labels: vec![2, 3, 4] }),
                batch(0, TaskLabels::Clmbr { labels: vec![0, 0, 0] }),
                batch(1, TaskLabels::Clmbr { labels: vec![5, 0, 0] }),
            ],
        );
        let evaluator = Evaluator::new(&model);
        let first = evaluator.evaluate(&params, &store, Split::Dev, 500).unwrap();
        let second = evaluator.evaluate(&params, &store, Split::Dev, 500).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.batches, 2);
        assert_eq!(first.num_indices, 4);
        assert_eq!(first.c_statistic, -first.loss);
        assert!(first.auroc.is_none());
    }

    #[test]
    fn boolean_task_reports_auroc() {
        let task = TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Boolean,
        };
        let model = EhrTransformer::new(config(), task).unwrap();
        let params = model.init(5, &Device::Cpu).unwrap();
        let labels = TaskLabels::Boolean {
            labels: vec![true, false, true],
            label_ages: vec![1440, 2880, 4320],
        };
        let store = store(
            BatchTask::LabeledPatients {
                labeler_type: LabelerType::Boolean,
                labels: vec![],
                lambda: None,
            },
            vec![batch(3, labels)],
        );
        let report = Evaluator::new(&model)
            .evaluate(&params, &store, Split::Dev, 500)
            .unwrap();
        let auroc = report.auroc.unwrap();
        assert!((0.0..=1.0).contains(&auroc));
        assert_eq!(report.c_statistic, auroc);
        assert!(report.average_precision.is_some());
    }

    #[test]
    fn split_without_label_slots_is_an_error() {
        let model = EhrTransformer::new(config(), TaskDescriptor::Clmbr { vocab_size: 6 }).unwrap();
        let params = model.init(3, &Device::Cpu).unwrap();
        let store = store(
            BatchTask::Clmbr { vocab_size: 6 },
            vec![batch(0, TaskLabels::Clmbr { labels: vec![0, 0, 0] })],
        );
        assert!(Evaluator::new(&model)
            .evaluate(&params, &store, Split::Dev, 500)
            .is_err());
    }
}
