use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::LossScaleConfig, TrainingError};

/// Dynamic loss scale. Enabled at every precision so the collapse signal stays meaningful.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    loss_scale: f64,
    stable_steps: usize,
    config: LossScaleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub loss_scale: f64,
    pub stable_steps: usize,
}

impl GradientScaler {
    pub fn new(config: LossScaleConfig) -> Self {
        let config = sanitize_config(config);
        Self {
            loss_scale: config.initial_scale,
            stable_steps: 0,
            config,
        }
    }

    pub fn loss_scale(&self) -> f64 {
        self.loss_scale
    }

    pub fn stable_steps(&self) -> usize {
        self.stable_steps
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
        }
    }

    /// Scale pinned at its floor right after an overflow: the divergence signal.
    pub fn is_collapsed(&self) -> bool {
        self.loss_scale <= self.config.min_scale && self.stable_steps == 0
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        tensor
            .affine(self.loss_scale, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        tensor
            .affine(1.0 / self.loss_scale, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.loss_scale = (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.loss_scale = (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .abs()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn holds_until_interval_then_grows() {
        let mut scaler = GradientScaler::new(LossScaleConfig {
            initial_scale: 512.0,
            growth_interval: 3,
            ..LossScaleConfig::default()
        });

        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        assert_eq!(scaler.stable_steps(), 2);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
        assert_eq!(scaler.stable_steps(), 0);
    }

    #[test]
    fn overflow_halves_and_resets_dwell() {
        let mut scaler = GradientScaler::new(LossScaleConfig {
            initial_scale: 1024.0,
            ..LossScaleConfig::default()
        });
        scaler.update(false);
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 512.0);
        assert_eq!(scaler.stable_steps(), 0);
    }

    #[test]
    fn floor_at_min_scale_signals_collapse() {
        let mut scaler = GradientScaler::new(LossScaleConfig {
            initial_scale: 4.0,
            ..LossScaleConfig::default()
        });
        assert!(!scaler.is_collapsed());
        for _ in 0..5 {
            scaler.update(true);
        }
        assert_eq!(scaler.loss_scale(), 1.0);
        assert!(scaler.is_collapsed());

        scaler.update(false);
        assert!(!scaler.is_collapsed());
    }

    #[test]
    fn detects_non_finite_gradients() {
        let scaler = GradientScaler::new(LossScaleConfig::default());
        let finite = tensor_from(&[1.0, -3.0]);
        let overflow = tensor_from(&[f32::INFINITY]);
        let nan = tensor_from(&[0.0, f32::NAN]);
        assert!(!scaler.has_overflow([&finite]).unwrap());
        assert!(scaler.has_overflow([&overflow]).unwrap());
        assert!(scaler.has_overflow([&nan]).unwrap());
    }

    #[test]
    fn scale_and_unscale_are_inverse() {
        let scaler = GradientScaler::new(LossScaleConfig {
            initial_scale: 8.0,
            ..LossScaleConfig::default()
        });
        let tensor = tensor_from(&[2.0, 4.0]);
        let scaled = scaler.scale(&tensor).unwrap();
        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![16.0, 32.0]);
        let unscaled = scaler.unscale(&scaled).unwrap();
        assert_eq!(unscaled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }
}
