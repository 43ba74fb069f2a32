use candle_core::DType;
use clmbr_model::{LabelerKind, RotaryMode, TaskDescriptor, TransformerConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::data::{BatchInfo, BatchTask, LabelerType};

/// Tiling margin subtracted from the configured attention width before it is frozen into the run.
pub const ATTENTION_TILE_MARGIN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.batches_path.as_os_str().is_empty() {
            errors.push("data.batches_path must not be empty".to_string());
        }
        if self.data.num_batch_threads == 0 {
            errors.push("data.num_batch_threads must be greater than 0".to_string());
        }
        if self.data.prefetch_depth == 0 {
            errors.push("data.prefetch_depth must be greater than 0".to_string());
        }

        let model = &self.model;
        if model.hidden_size == 0 || model.intermediate_size == 0 || model.n_layers == 0 {
            errors.push("model sizes must be greater than 0".to_string());
        }
        if model.n_heads == 0 || model.hidden_size % model.n_heads != 0 {
            errors.push("model.hidden_size must be divisible by model.n_heads".to_string());
        }
        if model.attention_width <= ATTENTION_TILE_MARGIN {
            errors.push(format!(
                "model.attention_width must exceed the tiling margin of {}",
                ATTENTION_TILE_MARGIN
            ));
        }
        if !(0.0..1.0).contains(&model.internal_dropout) {
            errors.push("model.internal_dropout must be in [0, 1)".to_string());
        }
        if let Some(0) = model.clmbr_survival_dim {
            errors.push("model.clmbr_survival_dim must be greater than 0".to_string());
        }

        let opt = &self.optimizer;
        if opt.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if opt.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if opt.max_grad_norm <= 0.0 {
            errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
        }
        if !(0.0 < opt.beta1 && opt.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < opt.beta2 && opt.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if opt.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if opt.n_epochs == 0 {
            errors.push("optimizer.n_epochs must be greater than 0".to_string());
        }

        if self.transfer.freeze_weights && self.transfer.start_from_checkpoint.is_none() {
            errors.push(
                "transfer.freeze_weights requires transfer.start_from_checkpoint".to_string(),
            );
        }

        let eval = &self.evaluation;
        if eval.every_n_steps == 0 {
            errors.push("evaluation.every_n_steps must be greater than 0".to_string());
        }
        if eval.max_batches == 0 {
            errors.push("evaluation.max_batches must be greater than 0".to_string());
        }
        if let Some(0) = eval.early_stopping_window_steps {
            errors.push(
                "evaluation.early_stopping_window_steps must be greater than 0".to_string(),
            );
        }

        if self.runtime.directory.as_os_str().is_empty() {
            errors.push("runtime.directory must not be empty".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        let scale = &self.runtime.loss_scale;
        if scale.min_scale < 1.0 {
            errors.push("runtime.loss_scale.min_scale must be >= 1".to_string());
        }
        if scale.initial_scale < scale.min_scale || scale.initial_scale > scale.max_scale {
            errors.push(
                "runtime.loss_scale.initial_scale must lie within [min_scale, max_scale]"
                    .to_string(),
            );
        }
        if scale.growth_factor <= 1.0 {
            errors.push("runtime.loss_scale.growth_factor must be greater than 1".to_string());
        }
        if !(0.0 < scale.backoff_factor && scale.backoff_factor < 1.0) {
            errors.push("runtime.loss_scale.backoff_factor must be in (0, 1)".to_string());
        }
        if scale.growth_interval == 0 {
            errors.push("runtime.loss_scale.growth_interval must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.transfer.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub batches_path: PathBuf,
    /// Evaluate early stopping on a separate batch set (its `train` split) instead of `dev`.
    #[serde(default)]
    pub dev_batches_path: Option<PathBuf>,
    #[serde(default = "default_num_batch_threads")]
    pub num_batch_threads: usize,
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.batches_path, base);
        if let Some(path) = self.dev_batches_path.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    #[serde(default = "default_attention_width")]
    pub attention_width: usize,
    #[serde(default = "default_rotary")]
    pub rotary: RotaryMode,
    #[serde(default)]
    pub internal_dropout: f32,
    #[serde(default)]
    pub clmbr_survival_dim: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            intermediate_size: default_intermediate_size(),
            n_heads: default_n_heads(),
            n_layers: default_n_layers(),
            attention_width: default_attention_width(),
            rotary: default_rotary(),
            internal_dropout: 0.0,
            clmbr_survival_dim: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Run directory of a previously trained model whose weights seed this one.
    #[serde(default)]
    pub start_from_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub freeze_weights: bool,
    /// JSON `[[f64]]` whose last row is the bias and remaining rows the weights.
    #[serde(default)]
    pub linear_probe: Option<PathBuf>,
    #[serde(default = "default_unfreeze_max_step")]
    pub unfreeze_max_step: usize,
    #[serde(default = "default_unfreeze_epochs")]
    pub unfreeze_epochs: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            start_from_checkpoint: None,
            freeze_weights: false,
            linear_probe: None,
            unfreeze_max_step: default_unfreeze_max_step(),
            unfreeze_epochs: default_unfreeze_epochs(),
        }
    }
}

impl TransferConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.start_from_checkpoint.as_mut(),
            self.linear_probe.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_eval_every_n_steps")]
    pub every_n_steps: usize,
    /// Extra evaluation steps that catch early divergence.
    #[serde(default = "default_early_steps")]
    pub early_steps: Vec<usize>,
    #[serde(default = "default_max_eval_batches")]
    pub max_batches: usize,
    #[serde(default)]
    pub early_stopping_window_steps: Option<usize>,
    #[serde(default)]
    pub max_iter: Option<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            every_n_steps: default_eval_every_n_steps(),
            early_steps: default_early_steps(),
            max_batches: default_max_eval_batches(),
            early_stopping_window_steps: None,
            max_iter: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Run directory. Created by the trainer and must not exist beforehand.
    pub directory: PathBuf,
    /// Overrides the seed recorded in the batch info.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default)]
    pub loss_scale: LossScaleConfig,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.directory, base);
        if let Some(dir) = self.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossScaleConfig {
    #[serde(default = "default_initial_scale")]
    pub initial_scale: f64,
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
    #[serde(default = "default_max_scale")]
    pub max_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: default_initial_scale(),
            growth_interval: default_growth_interval(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    #[default]
    Fp16,
    Bf16,
}

impl Precision {
    /// Dtype the forward and backward passes run in.
    pub fn compute_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// Frozen record of one training run, written once to `<directory>/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub batches_path: PathBuf,
    pub seed: u64,
    pub task: TaskDescriptor,
    pub transformer: TransformerConfig,
    pub learning_rate: f64,
    pub max_grad_norm: f64,
    pub weight_decay: f64,
    pub n_epochs: usize,
    #[serde(default)]
    pub note_embedding_data: Option<serde_json::Value>,
}

impl RunConfig {
    /// Combines user settings with the batch info. A labeled survival task inherits its
    /// time bins and head width from `source`, the run being transferred from.
    pub fn resolve(
        config: &TrainingConfig,
        info: &BatchInfo,
        source: Option<&RunConfig>,
    ) -> Result<Self, TrainingError> {
        let task = match &info.task {
            BatchTask::Clmbr { vocab_size } => TaskDescriptor::Clmbr {
                vocab_size: *vocab_size,
            },
            BatchTask::SurvivalClmbr { survival_dict } => {
                let dim = config.model.clmbr_survival_dim.ok_or_else(|| {
                    TrainingError::initialization(
                        "model.clmbr_survival_dim is required for survival_clmbr batches",
                    )
                })?;
                TaskDescriptor::SurvivalClmbr {
                    time_bins: survival_dict.time_bins.clone(),
                    num_codes: survival_dict.codes.len(),
                    dim,
                }
            }
            BatchTask::LabeledPatients {
                labeler_type: LabelerType::Boolean,
                ..
            } => TaskDescriptor::LabeledPatients {
                labeler: LabelerKind::Boolean,
            },
            BatchTask::LabeledPatients {
                labeler_type: LabelerType::Survival,
                ..
            } => {
                let source = source.ok_or_else(|| {
                    TrainingError::initialization(
                        "survival labels require transfer.start_from_checkpoint",
                    )
                })?;
                match &source.task {
                    TaskDescriptor::SurvivalClmbr { time_bins, dim, .. } => {
                        TaskDescriptor::LabeledPatients {
                            labeler: LabelerKind::Survival {
                                time_bins: time_bins.clone(),
                                dim: *dim,
                            },
                        }
                    }
                    other => {
                        return Err(TrainingError::initialization(format!(
                            "survival labels require a survival_clmbr source checkpoint, found {}",
                            other.name()
                        )))
                    }
                }
            }
        };

        let attention_width = config
            .model
            .attention_width
            .checked_sub(ATTENTION_TILE_MARGIN)
            .filter(|width| *width > 0)
            .ok_or_else(|| {
                TrainingError::validation(vec![format!(
                    "model.attention_width must exceed the tiling margin of {}",
                    ATTENTION_TILE_MARGIN
                )])
            })?;

        let transformer = TransformerConfig {
            vocab_size: info.transformer.vocab_size,
            hidden_size: config.model.hidden_size,
            intermediate_size: config.model.intermediate_size,
            n_heads: config.model.n_heads,
            n_layers: config.model.n_layers,
            attention_width,
            rotary: config.model.rotary,
            is_hierarchical: info.transformer.is_hierarchical,
            internal_dropout: config.model.internal_dropout,
        };
        transformer
            .validate()
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        task.validate()
            .map_err(|err| TrainingError::initialization(err.to_string()))?;

        Ok(Self {
            batches_path: config.data.batches_path.clone(),
            seed: config.runtime.seed.unwrap_or(info.seed),
            task,
            transformer,
            learning_rate: config.optimizer.learning_rate,
            max_grad_norm: config.optimizer.max_grad_norm,
            weight_decay: config.optimizer.weight_decay,
            n_epochs: config.optimizer.n_epochs,
            note_embedding_data: info.transformer.note_embedding_data.clone(),
        })
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_num_batch_threads() -> usize {
    4
}

fn default_prefetch_depth() -> usize {
    8
}

fn default_hidden_size() -> usize {
    768
}

fn default_intermediate_size() -> usize {
    3072
}

fn default_n_heads() -> usize {
    12
}

fn default_n_layers() -> usize {
    6
}

fn default_attention_width() -> usize {
    512
}

fn default_rotary() -> RotaryMode {
    RotaryMode::PerHead
}

fn default_max_grad_norm() -> f64 {
    1.0
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_n_epochs() -> usize {
    100
}

fn default_warmup_steps() -> usize {
    1000
}

fn default_unfreeze_max_step() -> usize {
    10_000
}

fn default_unfreeze_epochs() -> usize {
    15
}

fn default_eval_every_n_steps() -> usize {
    5000
}

fn default_early_steps() -> Vec<usize> {
    vec![500, 1500, 2500]
}

fn default_max_eval_batches() -> usize {
    500
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_initial_scale() -> f64 {
    32_768.0
}

fn default_growth_interval() -> usize {
    2000
}

fn default_growth_factor() -> f64 {
    2.0
}

fn default_backoff_factor() -> f64 {
    0.5
}

fn default_min_scale() -> f64 {
    1.0
}

fn default_max_scale() -> f64 {
    16_777_216.0
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Transplant {
        source: String,
        target: String,
        detail: String,
    },
    Alignment {
        patient_id: i64,
        age: u32,
    },
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn transplant(
        source: impl Into<String>,
        target: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::Transplant {
            source: source.into(),
            target: target.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Transplant {
                source,
                target,
                detail,
            } => write!(
                f,
                "cannot transplant {} onto {}: {}",
                source, target, detail
            ),
            TrainingError::Alignment { patient_id, age } => write!(
                f,
                "no representation at or before age {} minutes for patient {}",
                age, patient_id
            ),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BatchTransformerInfo, SurvivalDictionary};

    fn parse(toml_text: &str) -> TrainingConfig {
        toml::from_str(toml_text).unwrap()
    }

    fn minimal() -> TrainingConfig {
        parse(
            r#"
            [data]
            batches_path = "batches"

            [optimizer]
            learning_rate = 0.0001

            [runtime]
            directory = "run"
            "#,
        )
    }

    fn info(task: BatchTask) -> BatchInfo {
        BatchInfo {
            seed: 97,
            task,
            transformer: BatchTransformerInfo {
                vocab_size: 50,
                is_hierarchical: false,
                note_embedding_data: None,
            },
        }
    }

    #[test]
    fn defaults_follow_the_training_recipe() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.hidden_size, 768);
        assert_eq!(config.optimizer.n_epochs, 100);
        assert_eq!(config.evaluation.early_steps, vec![500, 1500, 2500]);
        assert_eq!(config.runtime.precision, Precision::Fp16);
        assert_eq!(config.runtime.loss_scale.initial_scale, 32_768.0);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = minimal();
        config.optimizer.learning_rate = 0.0;
        config.model.n_heads = 5;
        config.transfer.freeze_weights = true;
        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn resolve_subtracts_tiling_margin_and_prefers_runtime_seed() {
        let mut config = minimal();
        config.model.hidden_size = 16;
        config.model.n_heads = 2;
        config.model.intermediate_size = 32;
        config.model.n_layers = 1;
        config.model.attention_width = 48;

        let run = RunConfig::resolve(&config, &info(BatchTask::Clmbr { vocab_size: 50 }), None)
            .unwrap();
        assert_eq!(run.transformer.attention_width, 32);
        assert_eq!(run.seed, 97);

        config.runtime.seed = Some(5);
        let run = RunConfig::resolve(&config, &info(BatchTask::Clmbr { vocab_size: 50 }), None)
            .unwrap();
        assert_eq!(run.seed, 5);
    }

    #[test]
    fn survival_clmbr_requires_dimension() {
        let mut config = minimal();
        config.model.hidden_size = 16;
        config.model.n_heads = 2;
        let task = BatchTask::SurvivalClmbr {
            survival_dict: SurvivalDictionary {
                time_bins: vec![0.0, 10.0],
                codes: vec![3, 4, 5],
                lambdas: vec![0.1, 0.2, 0.3],
            },
        };
        assert!(matches!(
            RunConfig::resolve(&config, &info(task.clone()), None),
            Err(TrainingError::Initialization(_))
        ));

        config.model.clmbr_survival_dim = Some(4);
        let run = RunConfig::resolve(&config, &info(task), None).unwrap();
        assert_eq!(
            run.task,
            TaskDescriptor::SurvivalClmbr {
                time_bins: vec![0.0, 10.0],
                num_codes: 3,
                dim: 4
            }
        );
    }

    #[test]
    fn labeled_survival_inherits_bins_from_source() {
        let mut config = minimal();
        config.model.hidden_size = 16;
        config.model.n_heads = 2;
        config.model.clmbr_survival_dim = Some(4);
        let source = RunConfig::resolve(
            &config,
            &info(BatchTask::SurvivalClmbr {
                survival_dict: SurvivalDictionary {
                    time_bins: vec![0.0, 10.0, 20.0],
                    codes: vec![1],
                    lambdas: vec![0.5],
                },
            }),
            None,
        )
        .unwrap();

        let labeled = info(BatchTask::LabeledPatients {
            labeler_type: LabelerType::Survival,
            labels: Vec::new(),
            lambda: Some(0.01),
        });
        assert!(RunConfig::resolve(&config, &labeled, None).is_err());

        let run = RunConfig::resolve(&config, &labeled, Some(&source)).unwrap();
        assert_eq!(run.task.time_bins(), Some(&[0.0, 10.0, 20.0][..]));
    }
}
