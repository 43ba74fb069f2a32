use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use clmbr_model::{heads, LabelerKind, ParamPath, ParameterSet, TaskDescriptor};
use hex::encode as hex_encode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::RunConfig, evaluation::EvaluationReport, optimizer::OptimizerState, TrainingError,
};

pub const MANIFEST_VERSION: u32 = 1;
pub const CONFIG_FILE: &str = "config.json";
pub const BEST_PARAMS_FILE: &str = "best.safetensors";
pub const BEST_OPTIMIZER_FILE: &str = "best_opt_state.json";
pub const BEST_INFO_FILE: &str = "best_info";
pub const BEST_TEST_LOSS_FILE: &str = "best_test_loss.json";
pub const MANIFEST_FILE: &str = "best_manifest.json";

/// Older runs stored the labeled survival projection under the survival-CLMBR module name.
const LEGACY_ALIASES: [(&str, &str); 1] = [(heads::SURVIVAL_HEAD, heads::SURVIVAL_CLMBR_HEAD)];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestManifest {
    pub version: u32,
    pub created: DateTime<Utc>,
    pub step: usize,
    pub metric: f64,
    pub config_sha256: String,
    pub files: Vec<FileRecord>,
}

/// The best-so-far evaluation point of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    pub step: usize,
    /// Lower is better.
    pub metric: f64,
    pub test: EvaluationReport,
}

pub struct BestArtifacts<'a> {
    pub step: usize,
    pub metric: f64,
    /// Trainable and frozen parameters merged, in master precision.
    pub params: &'a ParameterSet,
    pub optimizer: &'a OptimizerState,
    pub test: &'a EvaluationReport,
}

/// Which transplanted modules start out frozen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FreezeSelection {
    #[default]
    None,
    /// Every module that was copied from the source.
    Transplanted,
    Modules(BTreeSet<String>),
}

#[derive(Debug)]
pub struct Transplanted {
    pub trainable: ParameterSet,
    pub frozen: ParameterSet,
    /// Target modules whose values came from the source.
    pub copied: BTreeSet<String>,
    /// Target modules left at their fresh initialization.
    pub fresh: BTreeSet<String>,
}

pub fn save_config(directory: &Path, config: &RunConfig) -> Result<PathBuf, TrainingError> {
    let path = directory.join(CONFIG_FILE);
    write_atomic(&path, &to_json_bytes(config)?)?;
    Ok(path)
}

/// Reads a run record from `config.json`, or from the given file when `path` is not a directory.
pub fn load_config(path: &Path) -> Result<RunConfig, TrainingError> {
    let path = if path.is_dir() {
        path.join(CONFIG_FILE)
    } else {
        path.to_path_buf()
    };
    read_json(&path)
}

/// Loads the run record and best parameters of a finished run, verifying the manifest when
/// one is present.
pub fn load_checkpoint(
    directory: &Path,
    device: &Device,
) -> Result<(RunConfig, ParameterSet), TrainingError> {
    let config = load_config(directory)?;
    let params_path = directory.join(BEST_PARAMS_FILE);
    if !params_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "no best parameters found at {}",
            params_path.display()
        )));
    }

    let manifest_path = directory.join(MANIFEST_FILE);
    if manifest_path.is_file() {
        let manifest: BestManifest = read_json(&manifest_path)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(TrainingError::runtime(format!(
                "unsupported manifest version {} (expected {})",
                manifest.version, MANIFEST_VERSION
            )));
        }
        for record in &manifest.files {
            validate_file(&directory.join(&record.filename), &record.sha256)?;
        }
    } else {
        log::warn!(
            "{} has no {}, loading parameters unverified",
            directory.display(),
            MANIFEST_FILE
        );
    }

    let params = ParameterSet::load_safetensors(&params_path, device).map_err(|err| {
        TrainingError::runtime(format!("failed to load {}: {err}", params_path.display()))
    })?;
    Ok((config, params))
}

/// Writes the best-so-far artifacts, each through a temporary sibling, manifest last.
pub fn write_best_artifacts(
    directory: &Path,
    config: &RunConfig,
    artifacts: &BestArtifacts<'_>,
) -> Result<BestRecord, TrainingError> {
    let params_path = directory.join(BEST_PARAMS_FILE);
    let staging = temporary_sibling(&params_path);
    artifacts.params.save_safetensors(&staging).map_err(|err| {
        TrainingError::runtime(format!("failed to save {}: {err}", staging.display()))
    })?;
    fs::rename(&staging, &params_path)?;

    let optimizer_path = directory.join(BEST_OPTIMIZER_FILE);
    write_atomic(&optimizer_path, &to_json_bytes(artifacts.optimizer)?)?;

    let info_path = directory.join(BEST_INFO_FILE);
    let info = format!("Step {}, Loss {}\n", artifacts.step, artifacts.metric);
    write_atomic(&info_path, info.as_bytes())?;

    let test_path = directory.join(BEST_TEST_LOSS_FILE);
    write_atomic(&test_path, &to_json_bytes(artifacts.test)?)?;

    let manifest = BestManifest {
        version: MANIFEST_VERSION,
        created: Utc::now(),
        step: artifacts.step,
        metric: artifacts.metric,
        config_sha256: hex_encode(Sha256::digest(to_json_bytes(config)?)),
        files: vec![
            file_record(&params_path)?,
            file_record(&optimizer_path)?,
            file_record(&info_path)?,
            file_record(&test_path)?,
        ],
    };
    write_atomic(&directory.join(MANIFEST_FILE), &to_json_bytes(&manifest)?)?;

    Ok(BestRecord {
        step: artifacts.step,
        metric: artifacts.metric,
        test: artifacts.test.clone(),
    })
}

/// Copies every source module that the target also has onto the freshly initialized `target`.
///
/// A copied module must supply every target weight with the same shape; otherwise nothing is
/// applied. Values are cast to the target dtype.
pub fn transplant(
    source: &ParameterSet,
    target: ParameterSet,
    freeze: &FreezeSelection,
) -> Result<Transplanted, TrainingError> {
    let source_modules = source.modules();
    let mut trainable = ParameterSet::new();
    let mut copied = BTreeSet::new();
    let mut fresh = BTreeSet::new();

    for module in target.modules() {
        let target_weights = target.module(&module);
        let source_module = if source_modules.contains(&module) {
            Some(module.clone())
        } else {
            legacy_source(source, &module, &target_weights)
        };

        match source_module {
            Some(source_module) => {
                for (path, current) in target_weights {
                    let source_path = ParamPath::new(source_module.clone(), path.weight.clone());
                    let value = source.get(&source_path).ok_or_else(|| {
                        TrainingError::transplant(
                            source_path.to_string(),
                            path.to_string(),
                            "weight missing from source",
                        )
                    })?;
                    if value.dims() != current.dims() {
                        return Err(TrainingError::transplant(
                            source_path.to_string(),
                            path.to_string(),
                            format!("shape {:?} does not match {:?}", value.dims(), current.dims()),
                        ));
                    }
                    let value = value
                        .to_dtype(current.dtype())
                        .and_then(|value| value.to_device(current.device()))
                        .map_err(|err| {
                            TrainingError::transplant(
                                source_path.to_string(),
                                path.to_string(),
                                err.to_string(),
                            )
                        })?;
                    trainable.insert(path.clone(), value);
                }
                if source_module != module {
                    log::info!("Transplanting {source_module} onto {module}");
                }
                copied.insert(module);
            }
            None => {
                log::info!("Training {module} from scratch");
                for (path, current) in target_weights {
                    trainable.insert(path.clone(), current.clone());
                }
                fresh.insert(module);
            }
        }
    }

    let frozen_modules: BTreeSet<String> = match freeze {
        FreezeSelection::None => BTreeSet::new(),
        FreezeSelection::Transplanted => copied.clone(),
        FreezeSelection::Modules(modules) => {
            if let Some(unknown) = modules.iter().find(|module| !trainable.has_module(module)) {
                return Err(TrainingError::initialization(format!(
                    "cannot freeze unknown module {unknown}"
                )));
            }
            modules.clone()
        }
    };
    let mut frozen = ParameterSet::new();
    for module in &frozen_modules {
        frozen
            .merge(trainable.take_module(module))
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
    }

    Ok(Transplanted {
        trainable,
        frozen,
        copied,
        fresh,
    })
}

fn legacy_source(
    source: &ParameterSet,
    module: &str,
    target_weights: &[(&ParamPath, &Tensor)],
) -> Option<String> {
    let (_, legacy) = LEGACY_ALIASES.iter().find(|(current, _)| *current == module)?;
    let matches = target_weights.iter().all(|(path, current)| {
        source
            .get(&ParamPath::new(*legacy, path.weight.clone()))
            .is_some_and(|value| value.dims() == current.dims())
    });
    matches.then(|| legacy.to_string())
}

/// Overwrites `module:weight` with `value`, reshaped and cast to the existing slot.
pub fn replace_task_head(
    params: &mut ParameterSet,
    module: &str,
    weight: &str,
    value: &Tensor,
) -> Result<(), TrainingError> {
    let path = ParamPath::new(module, weight);
    let current = params
        .get(&path)
        .ok_or_else(|| TrainingError::initialization(format!("no parameter {path} to replace")))?;
    if current.elem_count() != value.elem_count() {
        return Err(TrainingError::initialization(format!(
            "replacement for {path} has {} elements, slot has shape {:?}",
            value.elem_count(),
            current.dims()
        )));
    }
    let replacement = value
        .reshape(current.dims())
        .and_then(|value| value.to_dtype(current.dtype()))
        .and_then(|value| value.to_device(current.device()))
        .map_err(|err| TrainingError::initialization(format!("cannot replace {path}: {err}")))?;
    params.insert(path, replacement);
    Ok(())
}

/// Seeds the hazard bias of a survival head with `ln(lambda)` per code.
pub fn seed_hazard_bias(
    params: &mut ParameterSet,
    task: &TaskDescriptor,
    lambdas: &[f64],
) -> Result<(), TrainingError> {
    let module = match task {
        TaskDescriptor::SurvivalClmbr { .. } => heads::SURVIVAL_CLMBR_CODES,
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Survival { .. },
        } => heads::SURVIVAL_CODES,
        other => {
            return Err(TrainingError::initialization(format!(
                "{} has no hazard bias to seed",
                other.name()
            )))
        }
    };
    if let Some(bad) = lambdas.iter().find(|lambda| !(**lambda > 0.0)) {
        return Err(TrainingError::initialization(format!(
            "hazard rate {bad} must be positive"
        )));
    }
    let biases: Vec<f32> = lambdas.iter().map(|lambda| lambda.ln() as f32).collect();
    let value = Tensor::from_vec(biases, lambdas.len(), &Device::Cpu)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    replace_task_head(params, module, "code_weight_bias", &value)
}

/// Reads a linear probe stored as a JSON matrix: the last row is the bias, the rest the weights.
pub fn load_linear_probe(path: &Path) -> Result<Vec<Vec<f64>>, TrainingError> {
    read_json(path)
}

pub fn apply_linear_probe(
    params: &mut ParameterSet,
    task: &TaskDescriptor,
    probe: &[Vec<f64>],
) -> Result<(), TrainingError> {
    match task {
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Boolean,
        } => {}
        TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Survival { .. },
        } => {
            return Err(TrainingError::initialization(
                "linear probes are not supported for survival labelers",
            ))
        }
        other => {
            return Err(TrainingError::initialization(format!(
                "linear probes require a labeled task, found {}",
                other.name()
            )))
        }
    }
    let Some((bias, weights)) = probe.split_last() else {
        return Err(TrainingError::initialization("linear probe is empty"));
    };
    let width = bias.len();
    if weights.iter().any(|row| row.len() != width) {
        return Err(TrainingError::initialization("linear probe rows differ in length"));
    }
    let flat: Vec<f32> = weights.iter().flatten().map(|&v| v as f32).collect();
    let w = Tensor::from_vec(flat, (weights.len(), width), &Device::Cpu)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    let b = Tensor::from_vec(
        bias.iter().map(|&v| v as f32).collect::<Vec<_>>(),
        width,
        &Device::Cpu,
    )
    .map_err(|err| TrainingError::initialization(err.to_string()))?;
    replace_task_head(params, heads::BOOLEAN_HEAD, "w", &w)?;
    replace_task_head(params, heads::BOOLEAN_HEAD, "b", &b)
}

fn to_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    Ok(data)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Writes through a temporary sibling and renames it into place.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), TrainingError> {
    let staging = temporary_sibling(path);
    let mut file = File::create(&staging).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", staging.display()))
    })?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", staging.display()))
        })?;
    fs::rename(&staging, path).map_err(|err| {
        TrainingError::runtime(format!("failed to move {} into place: {err}", path.display()))
    })
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let bytes = path.metadata()?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn tensor(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_slice(values, shape, &Device::Cpu).unwrap()
    }

    fn set(entries: &[(&str, &str, Tensor)]) -> ParameterSet {
        entries
            .iter()
            .map(|(module, weight, value)| (ParamPath::new(*module, *weight), value.clone()))
            .collect()
    }

    fn values(params: &ParameterSet, module: &str, weight: &str) -> Vec<f32> {
        params
            .require(module, weight)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn transplant_onto_itself_is_identity() {
        let source = set(&[
            ("transformer/embed", "embeddings", tensor(&[0.1, 0.2, 0.3, 0.4], &[2, 2])),
            ("clmbr_task/linear", "w", tensor(&[1.0, 2.0], &[2, 1])),
            ("clmbr_task/linear", "b", tensor(&[3.0], &[1])),
        ]);
        let result = transplant(&source, source.clone(), &FreezeSelection::None).unwrap();
        assert!(result.frozen.is_empty());
        assert!(result.fresh.is_empty());
        for (path, value) in source.iter() {
            let copied = result.trainable.get(path).unwrap();
            assert_eq!(
                copied.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                value.flatten_all().unwrap().to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn transplant_keeps_missing_modules_fresh_and_freezes_copied() {
        let source = set(&[("transformer/embed", "embeddings", tensor(&[9.0, 9.0], &[1, 2]))]);
        let target = set(&[
            ("transformer/embed", "embeddings", tensor(&[0.0, 0.0], &[1, 2])),
            ("boolean_classifier/linear", "w", tensor(&[0.5, 0.5], &[2, 1])),
        ]);
        let result = transplant(&source, target, &FreezeSelection::Transplanted).unwrap();
        assert_eq!(values(&result.frozen, "transformer/embed", "embeddings"), vec![9.0, 9.0]);
        assert_eq!(
            values(&result.trainable, "boolean_classifier/linear", "w"),
            vec![0.5, 0.5]
        );
        assert!(result.trainable.paths().is_disjoint(&result.frozen.paths()));
        assert_eq!(result.trainable.len() + result.frozen.len(), 2);
    }

    #[test]
    fn shape_mismatch_names_both_paths() {
        let source = set(&[("clmbr_task/linear", "w", tensor(&[1.0, 2.0, 3.0], &[3, 1]))]);
        let target = set(&[("clmbr_task/linear", "w", tensor(&[0.0, 0.0], &[2, 1]))]);
        match transplant(&source, target, &FreezeSelection::None) {
            Err(TrainingError::Transplant { source, target, .. }) => {
                assert_eq!(source, "clmbr_task/linear:w");
                assert_eq!(target, "clmbr_task/linear:w");
            }
            other => panic!("expected transplant error, got {other:?}"),
        }
    }

    #[test]
    fn legacy_survival_head_maps_when_shapes_match() {
        let source = set(&[
            (heads::SURVIVAL_CLMBR_HEAD, "w", tensor(&[1.0, 2.0], &[1, 2])),
            (heads::SURVIVAL_CLMBR_HEAD, "b", tensor(&[3.0, 4.0], &[2])),
        ]);
        let target = set(&[
            (heads::SURVIVAL_HEAD, "w", tensor(&[0.0, 0.0], &[1, 2])),
            (heads::SURVIVAL_HEAD, "b", tensor(&[0.0, 0.0], &[2])),
        ]);
        let result = transplant(&source, target.clone(), &FreezeSelection::None).unwrap();
        assert_eq!(values(&result.trainable, heads::SURVIVAL_HEAD, "b"), vec![3.0, 4.0]);
        assert!(result.copied.contains(heads::SURVIVAL_HEAD));

        let narrow = set(&[(heads::SURVIVAL_CLMBR_HEAD, "w", tensor(&[1.0], &[1, 1]))]);
        let result = transplant(&narrow, target, &FreezeSelection::None).unwrap();
        assert!(result.fresh.contains(heads::SURVIVAL_HEAD));
    }

    #[test]
    fn replace_task_head_reshapes_and_casts() {
        let mut params = set(&[(
            "boolean_classifier/linear",
            "w",
            Tensor::zeros((2, 1), DType::F16, &Device::Cpu).unwrap(),
        )]);
        replace_task_head(&mut params, "boolean_classifier/linear", "w", &tensor(&[1.0, 2.0], &[2]))
            .unwrap();
        let replaced = params.require("boolean_classifier/linear", "w").unwrap();
        assert_eq!(replaced.dims(), &[2, 1]);
        assert_eq!(replaced.dtype(), DType::F16);
        assert!(replace_task_head(&mut params, "boolean_classifier/linear", "w", &tensor(&[1.0], &[1])).is_err());
    }

    #[test]
    fn linear_probe_splits_bias_row() {
        let mut params = set(&[
            (heads::BOOLEAN_HEAD, "w", tensor(&[0.0, 0.0], &[2, 1])),
            (heads::BOOLEAN_HEAD, "b", tensor(&[0.0], &[1])),
        ]);
        let task = TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Boolean,
        };
        apply_linear_probe(&mut params, &task, &[vec![0.5], vec![-1.5], vec![2.0]]).unwrap();
        assert_eq!(values(&params, heads::BOOLEAN_HEAD, "w"), vec![0.5, -1.5]);
        assert_eq!(values(&params, heads::BOOLEAN_HEAD, "b"), vec![2.0]);

        let survival = TaskDescriptor::LabeledPatients {
            labeler: LabelerKind::Survival {
                time_bins: vec![0.0],
                dim: 1,
            },
        };
        assert!(matches!(
            apply_linear_probe(&mut params, &survival, &[vec![1.0]]),
            Err(TrainingError::Initialization(_))
        ));
    }

    #[test]
    fn hazard_bias_uses_natural_log() {
        let mut params = set(&[(heads::SURVIVAL_CLMBR_CODES, "code_weight_bias", tensor(&[0.0, 0.0], &[2]))]);
        let task = TaskDescriptor::SurvivalClmbr {
            time_bins: vec![0.0],
            num_codes: 2,
            dim: 1,
        };
        seed_hazard_bias(&mut params, &task, &[1.0, std::f64::consts::E]).unwrap();
        let bias = values(&params, heads::SURVIVAL_CLMBR_CODES, "code_weight_bias");
        assert!((bias[0] - 0.0).abs() < 1e-6 && (bias[1] - 1.0).abs() < 1e-6);
        assert!(seed_hazard_bias(&mut params, &task, &[0.0, 1.0]).is_err());
    }

    #[test]
    fn best_artifacts_round_trip_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            batches_path: PathBuf::from("batches"),
            seed: 1,
            task: TaskDescriptor::Clmbr { vocab_size: 2 },
            transformer: clmbr_model::TransformerConfig {
                vocab_size: 2,
                hidden_size: 2,
                intermediate_size: 4,
                n_heads: 1,
                n_layers: 1,
                attention_width: 4,
                rotary: clmbr_model::RotaryMode::None,
                is_hierarchical: false,
                internal_dropout: 0.0,
            },
            learning_rate: 1e-3,
            max_grad_norm: 1.0,
            weight_decay: 0.0,
            n_epochs: 1,
            note_embedding_data: None,
        };
        save_config(dir.path(), &config).unwrap();
        let params = set(&[("clmbr_task/linear", "b", tensor(&[1.0, 2.0], &[2]))]);
        let optimizer = OptimizerState {
            step: 3,
            parameters: vec![],
        };
        let test = EvaluationReport {
            loss: 0.5,
            loss2: 0.5,
            c_statistic: -0.5,
            auroc: None,
            average_precision: None,
            num_indices: 4,
            batches: 1,
        };
        let record = write_best_artifacts(
            dir.path(),
            &config,
            &BestArtifacts {
                step: 7,
                metric: 0.5,
                params: &params,
                optimizer: &optimizer,
                test: &test,
            },
        )
        .unwrap();
        assert_eq!(record.step, 7);
        assert_eq!(
            fs::read_to_string(dir.path().join(BEST_INFO_FILE)).unwrap().trim(),
            "Step 7, Loss 0.5"
        );

        let (loaded_config, loaded) = load_checkpoint(dir.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded_config, config);
        assert_eq!(values(&loaded, "clmbr_task/linear", "b"), vec![1.0, 2.0]);

        fs::write(dir.path().join(BEST_INFO_FILE), "tampered").unwrap();
        assert!(load_checkpoint(dir.path(), &Device::Cpu).is_err());
    }
}
