mod stream;

use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use clmbr_model::Batch;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

pub use stream::{BatchStream, StreamError, StreamItem, StreamOptions};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

pub const BATCH_INFO_FILE: &str = "batch_info.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Dev, Split::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Companion record describing how a batch set was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub seed: u64,
    pub task: BatchTask,
    pub transformer: BatchTransformerInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTransformerInfo {
    pub vocab_size: usize,
    #[serde(default)]
    pub is_hierarchical: bool,
    /// Carried through to the run record; not consumed by the model.
    #[serde(default)]
    pub note_embedding_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchTask {
    Clmbr {
        vocab_size: usize,
    },
    SurvivalClmbr {
        survival_dict: SurvivalDictionary,
    },
    LabeledPatients {
        labeler_type: LabelerType,
        labels: Vec<PredictionLabel>,
        /// Empirical event rate used to seed the survival head.
        #[serde(default)]
        lambda: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalDictionary {
    pub time_bins: Vec<f32>,
    pub codes: Vec<u32>,
    /// Per-code hazard priors, one per entry of `codes`.
    pub lambdas: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelerType {
    Boolean,
    Survival,
}

/// One externally supplied label. Accepts `{patient_id, age, value}` or `[patient_id, age, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLabel {
    pub patient_id: i64,
    /// Minutes since birth.
    pub age: u32,
    pub value: LabelValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Boolean(bool),
    Number(f64),
    Event { time: f64, is_censored: bool },
}

/// Read-only access to a pre-built batch set.
pub trait BatchStore: Send + Sync {
    fn info(&self) -> &BatchInfo;

    fn batch_count(&self, split: Split) -> usize;

    fn batch(&self, split: Split, index: usize) -> Result<Batch>;
}

/// Batch set on disk: `batch_info.json` plus `<split>/batch_<index:06>.json`.
#[derive(Debug)]
pub struct DirectoryBatchStore {
    root: PathBuf,
    info: BatchInfo,
    counts: HashMap<Split, usize>,
}

impl DirectoryBatchStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let info_path = root.join(BATCH_INFO_FILE);
        let contents = fs::read_to_string(&info_path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read batch info {}: {}",
                info_path.display(),
                err
            ))
        })?;
        let info: BatchInfo = serde_json::from_str(&contents)?;

        let mut counts = HashMap::new();
        for split in Split::ALL {
            counts.insert(split, count_batches(&root.join(split.as_str()))?);
        }

        Ok(Self { root, info, counts })
    }

    /// Creates an empty batch directory holding only `info`.
    pub fn create(root: impl AsRef<Path>, info: &BatchInfo) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        for split in Split::ALL {
            fs::create_dir_all(root.join(split.as_str()))?;
        }
        fs::write(
            root.join(BATCH_INFO_FILE),
            serde_json::to_vec_pretty(info)?,
        )?;
        Self::open(root)
    }

    /// Appends `batch` as the next index of `split`.
    pub fn append(&mut self, split: Split, batch: &Batch) -> Result<usize> {
        let index = self.batch_count(split);
        fs::write(self.batch_path(split, index), serde_json::to_vec(batch)?)?;
        self.counts.insert(split, index + 1);
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn batch_path(&self, split: Split, index: usize) -> PathBuf {
        self.root
            .join(split.as_str())
            .join(format!("batch_{:06}.json", index))
    }
}

impl BatchStore for DirectoryBatchStore {
    fn info(&self) -> &BatchInfo {
        &self.info
    }

    fn batch_count(&self, split: Split) -> usize {
        self.counts.get(&split).copied().unwrap_or(0)
    }

    fn batch(&self, split: Split, index: usize) -> Result<Batch> {
        if index >= self.batch_count(split) {
            return Err(TrainingError::runtime(format!(
                "{} batch {} out of range ({} batches)",
                split,
                index,
                self.batch_count(split)
            )));
        }
        let path = self.batch_path(split, index);
        let contents = fs::read(&path).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {}", path.display(), err))
        })?;
        serde_json::from_slice(&contents).map_err(|err| {
            TrainingError::runtime(format!("failed to decode {}: {}", path.display(), err))
        })
    }
}

/// Counts the contiguous run of `batch_000000.json`, `batch_000001.json`, ... in `dir`.
fn count_batches(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut count = 0;
    while dir.join(format!("batch_{:06}.json", count)).is_file() {
        count += 1;
    }
    Ok(count)
}

/// Batch set held in memory, used for fixtures and already-materialized data.
#[derive(Debug, Clone)]
pub struct InMemoryBatchStore {
    info: BatchInfo,
    splits: HashMap<Split, Vec<Batch>>,
}

impl InMemoryBatchStore {
    pub fn new(info: BatchInfo) -> Self {
        Self {
            info,
            splits: HashMap::new(),
        }
    }

    pub fn with_split(mut self, split: Split, batches: Vec<Batch>) -> Self {
        self.splits.insert(split, batches);
        self
    }
}

impl BatchStore for InMemoryBatchStore {
    fn info(&self) -> &BatchInfo {
        &self.info
    }

    fn batch_count(&self, split: Split) -> usize {
        self.splits.get(&split).map_or(0, Vec::len)
    }

    fn batch(&self, split: Split, index: usize) -> Result<Batch> {
        self.splits
            .get(&split)
            .and_then(|batches| batches.get(index))
            .cloned()
            .ok_or_else(|| {
                TrainingError::runtime(format!("{} batch {} out of range", split, index))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clmbr_model::{TaskLabels, TransformerBatch};

    fn info() -> BatchInfo {
        BatchInfo {
            seed: 3,
            task: BatchTask::Clmbr { vocab_size: 8 },
            transformer: BatchTransformerInfo {
                vocab_size: 8,
                is_hierarchical: false,
                note_embedding_data: None,
            },
        }
    }

    fn batch(pid: i64) -> Batch {
        Batch {
            num_indices: 1,
            patient_ids: vec![pid],
            offsets: vec![0],
            transformer: TransformerBatch {
                length: 2,
                tokens: vec![1, 2],
                ages: vec![0.0, 1.0],
                integer_ages: vec![0, 1440],
                valid_tokens: vec![true, true],
                label_indices: vec![0],
                hierarchical_tokens: vec![],
                hierarchical_weights: vec![],
                token_offsets: vec![],
            },
            task: TaskLabels::Clmbr { labels: vec![2] },
        }
    }

    #[test]
    fn directory_store_round_trips_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryBatchStore::create(dir.path().join("batches"), &info()).unwrap();
        store.append(Split::Train, &batch(10)).unwrap();
        store.append(Split::Train, &batch(11)).unwrap();
        store.append(Split::Dev, &batch(12)).unwrap();

        let reopened = DirectoryBatchStore::open(dir.path().join("batches")).unwrap();
        assert_eq!(reopened.batch_count(Split::Train), 2);
        assert_eq!(reopened.batch_count(Split::Dev), 1);
        assert_eq!(reopened.batch_count(Split::Test), 0);
        assert_eq!(reopened.batch(Split::Train, 1).unwrap().patient_ids, vec![11]);
        assert!(reopened.batch(Split::Test, 0).is_err());
        assert_eq!(reopened.info(), &info());
    }

    #[test]
    fn labels_accept_tuple_form() {
        let json = r#"{
            "type": "labeled_patients",
            "labeler_type": "boolean",
            "labels": [[4, 1440, true], {"patient_id": 5, "age": 60, "value": false}]
        }"#;
        let task: BatchTask = serde_json::from_str(json).unwrap();
        let BatchTask::LabeledPatients { labels, lambda, .. } = task else {
            panic!("expected labeled patients");
        };
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].patient_id, 4);
        assert_eq!(labels[0].value, LabelValue::Boolean(true));
        assert_eq!(lambda, None);
    }

    #[test]
    fn unknown_task_tag_is_a_format_error() {
        let json = r#"{"seed": 1, "task": {"type": "mystery"}, "transformer": {"vocab_size": 3}}"#;
        let err: TrainingError = serde_json::from_str::<BatchInfo>(json).unwrap_err().into();
        assert!(matches!(err, TrainingError::ConfigFormat(_)));
    }
}
