pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use clmbr_model::ParamPath;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

const EPS: f64 = 1e-12;

/// Weight names never subject to decoupled weight decay.
pub const DECAY_EXCLUDED_WEIGHTS: [&str; 4] = ["b", "scale", "embeddings", "code_weight_bias"];

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            clip_global_norm: None,
            weight_decay_exclude: DECAY_EXCLUDED_WEIGHTS
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

/// Outcome of unscaling one step's gradients.
#[derive(Debug, Clone, Copy)]
pub struct GradientCheck {
    pub found_inf: bool,
    pub norm: f64,
}

/// Global-norm clipping followed by AdamW with decoupled, masked weight decay.
/// Parameters are f32 master copies; the learning rate is set by the caller every step.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    path: ParamPath,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(ParamPath, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (path, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 master weights, '{}' is {:?}",
                    path,
                    tensor.dtype()
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let apply_weight_decay = !options
                .weight_decay_exclude
                .iter()
                .any(|name| *name == path.weight);

            params.push(ParameterSlot {
                path,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of committed updates.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn decays(&self, path: &ParamPath) -> bool {
        self.params
            .iter()
            .any(|slot| slot.path == *path && slot.apply_weight_decay)
    }

    /// Divides every gradient by the loss scale in place and reports finiteness and global norm.
    pub fn unscale_gradients(
        &self,
        grads: &mut GradStore,
        scaler: &GradientScaler,
    ) -> Result<GradientCheck, TrainingError> {
        let mut found_inf = false;
        let mut sum_squares = 0.0f64;
        for slot in &self.params {
            let tensor = slot.param.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                let unscaled = scaler
                    .unscale(&grad.to_dtype(DType::F32).map_err(to_runtime_error)?)?;
                let sq = squared_norm(&unscaled)?;
                if !sq.is_finite() {
                    found_inf = true;
                }
                sum_squares += sq;
                grads.insert(tensor, unscaled);
            }
        }
        let norm = if sum_squares > 0.0 {
            sum_squares.sqrt()
        } else {
            0.0
        };
        Ok(GradientCheck { found_inf, norm })
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm_sq = squared_norm(&grad)?;
            processed.push(ProcessedGradient {
                index,
                grad,
                norm_sq,
            });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.clip_global_norm {
            let total_norm = processed.iter().map(|g| g.norm_sq).sum::<f64>().sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let scale_m = 1.0 / (1.0 - cfg.beta1.powi(self.step as i32)).max(EPS);
        let scale_v = 1.0 / (1.0 - cfg.beta2.powi(self.step as i32)).max(EPS);

        for item in processed {
            let slot = &mut self.params[item.index];

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&item.grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &item
                        .grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = new_m
                .affine(scale_m, 0.0)
                .map_err(to_runtime_error)?
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            parameters.push(ParameterState {
                name: slot.path.to_string(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: flatten_to_vec(&slot.first_moment)?,
                second_moment: flatten_to_vec(&slot.second_moment)?,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm_sq: f64,
}

fn squared_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

fn flatten_to_vec(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
