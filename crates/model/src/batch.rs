use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// One padded batch of patient-timeline windows plus task supervision.
///
/// Tokens are stored row-major: row `r` covers `tokens[r * length..(r + 1) * length]`.
/// `label_indices` address the flattened token sequence; only the first `num_indices`
/// slots carry real labels, the rest are padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub num_indices: usize,
    pub patient_ids: Vec<i64>,
    /// Offset of each row's window within its patient's timeline.
    pub offsets: Vec<u32>,
    pub transformer: TransformerBatch,
    pub task: TaskLabels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerBatch {
    /// Context-window length of every row.
    pub length: usize,
    pub tokens: Vec<u32>,
    /// Age of each token in days, used for rotary encoding.
    pub ages: Vec<f32>,
    /// Age of each token in minutes.
    pub integer_ages: Vec<u32>,
    pub valid_tokens: Vec<bool>,
    pub label_indices: Vec<u32>,
    /// Hierarchical mode: flattened code lists per token (CSR layout addressed by `token_offsets`).
    #[serde(default)]
    pub hierarchical_tokens: Vec<u32>,
    #[serde(default)]
    pub hierarchical_weights: Vec<f32>,
    #[serde(default)]
    pub token_offsets: Vec<u32>,
}

/// Task-specific supervision, indexed by label slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskLabels {
    /// Next code per slot.
    Clmbr { labels: Vec<u32> },
    /// Per slot and code (row-major `[slot][code]`): time to next occurrence and censoring.
    SurvivalClmbr {
        event_times: Vec<f32>,
        is_censor: Vec<bool>,
    },
    Boolean {
        labels: Vec<bool>,
        label_ages: Vec<u32>,
    },
    Survival {
        event_times: Vec<f32>,
        is_censor: Vec<bool>,
        label_ages: Vec<u32>,
    },
    /// Batches built only for representation extraction.
    None,
}

impl Batch {
    pub fn rows(&self) -> usize {
        if self.transformer.length == 0 {
            0
        } else {
            self.transformer.tokens.len() / self.transformer.length
        }
    }

    /// Number of label slots including padding.
    pub fn slots(&self) -> usize {
        self.transformer.label_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_indices == 0
    }

    /// Row that label slot `slot` points into.
    pub fn slot_row(&self, slot: usize) -> usize {
        self.transformer.label_indices[slot] as usize / self.transformer.length.max(1)
    }

    /// Checks that every array agrees with the declared shape.
    pub fn validate(&self, is_hierarchical: bool) -> Result<()> {
        let t = &self.transformer;
        if t.length == 0 {
            return Err(Error::Msg("batch context length must be positive".into()));
        }
        let tokens = t.tokens.len();
        if tokens % t.length != 0 {
            return Err(Error::Msg(format!(
                "batch has {tokens} tokens which is not a multiple of length {}",
                t.length
            )));
        }
        for (name, len) in [
            ("ages", t.ages.len()),
            ("integer_ages", t.integer_ages.len()),
            ("valid_tokens", t.valid_tokens.len()),
        ] {
            if len != tokens {
                return Err(Error::Msg(format!(
                    "batch {name} has {len} entries, expected {tokens}"
                )));
            }
        }
        let rows = self.rows();
        if self.patient_ids.len() != rows || self.offsets.len() != rows {
            return Err(Error::Msg(format!(
                "batch has {rows} rows but {} patient ids and {} offsets",
                self.patient_ids.len(),
                self.offsets.len()
            )));
        }
        if self.num_indices > t.label_indices.len() {
            return Err(Error::Msg(format!(
                "num_indices {} exceeds {} label slots",
                self.num_indices,
                t.label_indices.len()
            )));
        }
        if let Some(bad) = t.label_indices.iter().find(|&&idx| idx as usize >= tokens) {
            return Err(Error::Msg(format!(
                "label index {bad} out of range for {tokens} tokens"
            )));
        }
        if is_hierarchical {
            if t.token_offsets.len() != tokens + 1 {
                return Err(Error::Msg(
                    "hierarchical batch requires token_offsets of length tokens + 1".into(),
                ));
            }
            if t.hierarchical_tokens.len() != t.hierarchical_weights.len() {
                return Err(Error::Msg(
                    "hierarchical tokens and weights differ in length".into(),
                ));
            }
            let end = t.token_offsets.last().copied().unwrap_or(0) as usize;
            if end != t.hierarchical_tokens.len()
                || t.token_offsets.windows(2).any(|pair| pair[1] < pair[0])
            {
                return Err(Error::Msg("hierarchical token_offsets are inconsistent".into()));
            }
        }
        let slots = self.num_indices;
        let short = match &self.task {
            TaskLabels::Clmbr { labels } => labels.len() < slots,
            TaskLabels::SurvivalClmbr {
                event_times,
                is_censor,
            } => event_times.len() != is_censor.len() || event_times.len() < slots,
            TaskLabels::Boolean { labels, .. } => labels.len() < slots,
            TaskLabels::Survival {
                event_times,
                is_censor,
                ..
            } => event_times.len() < slots || is_censor.len() < slots,
            TaskLabels::None => false,
        };
        if short {
            return Err(Error::Msg(
                "task labels do not cover every valid label slot".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Batch {
        Batch {
            num_indices: 2,
            patient_ids: vec![7, 9],
            offsets: vec![0, 0],
            transformer: TransformerBatch {
                length: 3,
                tokens: vec![1, 2, 3, 4, 5, 0],
                ages: vec![0.0, 1.0, 2.0, 0.0, 3.0, 3.0],
                integer_ages: vec![0, 1440, 2880, 0, 4320, 4320],
                valid_tokens: vec![true, true, true, true, true, false],
                label_indices: vec![2, 4, 0],
                hierarchical_tokens: vec![],
                hierarchical_weights: vec![],
                token_offsets: vec![],
            },
            task: TaskLabels::Clmbr {
                labels: vec![4, 1, 0],
            },
        }
    }

    #[test]
    fn slot_rows_follow_window_length() {
        let batch = batch();
        assert!(batch.validate(false).is_ok());
        assert_eq!(batch.rows(), 2);
        assert_eq!(batch.slot_row(0), 0);
        assert_eq!(batch.slot_row(1), 1);
    }

    #[test]
    fn rejects_mismatched_rows() {
        let mut batch = batch();
        batch.patient_ids.pop();
        assert!(batch.validate(false).is_err());
    }

    #[test]
    fn hierarchical_requires_offsets() {
        let batch = batch();
        assert!(batch.validate(true).is_err());
    }
}
