use crate::TrainingError;

pub trait LRScheduler: Send {
    /// Returns the rate for the current update and advances the schedule.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub base_lr: f64,
    pub total_steps: usize,
    pub warmup_steps: usize,
}

impl SchedulerConfig {
    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        Ok(Box::new(WarmupLinearDecay::new(
            self.base_lr,
            self.total_steps,
            self.warmup_steps,
        )?))
    }
}

/// `base_lr * (p <= w ? p / w : 1) * (1 - p)` where `p` is the fraction of `total_steps`
/// already taken and `w` the warmup fraction. The first update therefore runs at rate zero.
pub struct WarmupLinearDecay {
    base_lr: f64,
    total_steps: usize,
    warmup_fraction: f64,
    step: usize,
    current_lr: f64,
}

impl WarmupLinearDecay {
    pub fn new(
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        Ok(Self {
            base_lr,
            total_steps,
            warmup_fraction: warmup_steps as f64 / total_steps as f64,
            step: 0,
            current_lr: 0.0,
        })
    }

    fn compute_lr(&self, step: usize) -> f64 {
        let progress = step as f64 / self.total_steps as f64;
        let warmup = if self.warmup_fraction > 0.0 && progress <= self.warmup_fraction {
            progress / self.warmup_fraction
        } else {
            1.0
        };
        self.base_lr * warmup * (1.0 - progress).max(0.0)
    }
}

impl LRScheduler for WarmupLinearDecay {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warms_up_then_decays_linearly() {
        let mut scheduler = WarmupLinearDecay::new(1.0, 100, 10).unwrap();
        let rates: Vec<f64> = (0..100).map(|_| scheduler.step()).collect();

        assert_eq!(rates[0], 0.0);
        assert!((rates[5] - 0.5 * 0.95).abs() < 1e-12);
        assert!((rates[10] - 0.9).abs() < 1e-12);
        assert!((rates[11] - 0.89).abs() < 1e-12);
        assert!((rates[99] - 0.01).abs() < 1e-12);
        assert_eq!(scheduler.learning_rate(), rates[99]);
    }

    #[test]
    fn warmup_longer_than_schedule_never_plateaus() {
        let mut scheduler = WarmupLinearDecay::new(2.0, 10, 1000).unwrap();
        scheduler.step();
        let second = scheduler.step();
        // p = 0.1, w = 100
        assert!((second - 2.0 * (0.1 / 100.0) * 0.9).abs() < 1e-12);
    }

    #[test]
    fn rejects_empty_schedule() {
        assert!(WarmupLinearDecay::new(1.0, 0, 10).is_err());
        assert!(SchedulerConfig {
            base_lr: 0.0,
            total_steps: 10,
            warmup_steps: 0
        }
        .build()
        .is_err());
    }
}
