use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Smoothed per-step training statistics. Throughput is counted in label slots.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    indices_processed: u64,
    skipped_updates: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            indices_processed: 0,
            skipped_updates: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    /// Records a step whose gradients overflowed and whose update was discarded.
    pub fn record_skipped(&mut self) {
        self.skipped_updates = self.skipped_updates.saturating_add(1);
        self.step_timer = Instant::now();
    }

    pub fn record_step(&mut self, indices: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.indices_processed = self.indices_processed.saturating_add(indices);
        let step_indices_per_sec = if step_duration > Duration::ZERO {
            indices as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss_avg = self.loss_ema.update(loss);
        let throughput_avg = self.throughput_ema.update(step_indices_per_sec);
        let grad_norm_avg = self.grad_norm_ema.update(grad_norm);

        StepSnapshot {
            loss: loss_avg,
            step_loss: loss,
            indices,
            indices_per_sec: throughput_avg,
            grad_norm: grad_norm_avg,
            raw_grad_norm: grad_norm,
            total_indices: self.indices_processed,
            skipped_updates: self.skipped_updates,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub indices: u64,
    pub indices_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_indices: u64,
    pub skipped_updates: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

/// Accumulates per-batch losses over an evaluation pass.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    weighted_loss: f64,
    unweighted_loss: f64,
    num_indices: u64,
    batches: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, num_indices: usize) {
        self.weighted_loss += loss * num_indices as f64;
        self.unweighted_loss += loss;
        self.num_indices += num_indices as u64;
        self.batches += 1;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.batches == 0 || self.num_indices == 0 {
            None
        } else {
            Some(EvaluationSummary {
                loss: self.weighted_loss / self.num_indices as f64,
                loss2: self.unweighted_loss / self.batches as f64,
                num_indices: self.num_indices,
                batches: self.batches,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    /// Mean loss weighted by each batch's label-slot count.
    pub loss: f64,
    /// Plain mean of batch losses.
    pub loss2: f64,
    pub num_indices: u64,
    pub batches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moving_average_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }

    #[test]
    fn evaluation_weights_by_label_slots() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(1.0, 3);
        metrics.update(3.0, 1);
        let summary = metrics.finalize().unwrap();
        assert!((summary.loss - 1.5).abs() < 1e-12);
        assert!((summary.loss2 - 2.0).abs() < 1e-12);
        assert_eq!(summary.num_indices, 4);
        assert_eq!(summary.batches, 2);
    }

    #[test]
    fn empty_evaluation_has_no_summary() {
        assert!(EvaluationMetrics::default().finalize().is_none());
    }

    #[test]
    fn skipped_updates_are_counted() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_skipped();
        let snapshot = metrics.record_step(8, 0.5, 1.0);
        assert_eq!(snapshot.skipped_updates, 1);
        assert_eq!(snapshot.total_indices, 8);
    }
}
