use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use crate::{data::DirectoryBatchStore, TrainingError};

/// Everything needed to build labeled-patient batches for an existing run.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub destination: PathBuf,
    pub data_path: PathBuf,
    pub labeled_patients_path: PathBuf,
    pub dictionary_path: PathBuf,
    pub is_hierarchical: bool,
    pub vocab_size: usize,
    pub batch_size: usize,
    /// Percentage of patients (by hashed id) before the dev split begins.
    pub val_start: u32,
}

impl BatchRequest {
    pub const DEFAULT_BATCH_SIZE: usize = 1 << 12;
    pub const DEFAULT_VAL_START: u32 = 70;
}

/// External service that materializes a batch directory.
pub trait BatchBuilder {
    fn build(&self, request: &BatchRequest) -> Result<(), TrainingError>;
}

/// Runs a batch-creation program directly, without a shell.
#[derive(Debug, Clone)]
pub struct CommandBatchBuilder {
    program: PathBuf,
}

impl CommandBatchBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self, request: &BatchRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            request.destination.clone().into(),
            "--data_path".into(),
            request.data_path.clone().into(),
            "--task".into(),
            "labeled_patients".into(),
            "--labeled_patients_path".into(),
            request.labeled_patients_path.clone().into(),
            "--val_start".into(),
            request.val_start.to_string().into(),
            "--dictionary_path".into(),
            request.dictionary_path.clone().into(),
        ];
        if request.is_hierarchical {
            args.push("--is_hierarchical".into());
        }
        args.extend([
            "--transformer_vocab_size".into(),
            request.vocab_size.to_string().into(),
            "--batch_size".into(),
            request.batch_size.to_string().into(),
        ]);
        args
    }
}

impl BatchBuilder for CommandBatchBuilder {
    fn build(&self, request: &BatchRequest) -> Result<(), TrainingError> {
        log::info!(
            "building batches in {} with {}",
            request.destination.display(),
            self.program.display()
        );
        let status = Command::new(&self.program)
            .args(self.arguments(request))
            .status()
            .map_err(|err| {
                TrainingError::runtime(format!(
                    "failed to launch {}: {err}",
                    self.program.display()
                ))
            })?;
        if !status.success() {
            return Err(TrainingError::runtime(format!(
                "{} exited with {status}",
                self.program.display()
            )));
        }
        Ok(())
    }
}

/// Opens the requested batch directory, building it first when it does not exist yet.
pub fn ensure_batches(
    builder: &dyn BatchBuilder,
    request: &BatchRequest,
) -> Result<DirectoryBatchStore, TrainingError> {
    if !request.destination.exists() {
        builder.build(request)?;
    }
    DirectoryBatchStore::open(&request.destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn request(destination: PathBuf) -> BatchRequest {
        BatchRequest {
            destination,
            data_path: PathBuf::from("/data/extract"),
            labeled_patients_path: PathBuf::from("/data/labels.json"),
            dictionary_path: PathBuf::from("/runs/clmbr/dictionary"),
            is_hierarchical: true,
            vocab_size: 65536,
            batch_size: BatchRequest::DEFAULT_BATCH_SIZE,
            val_start: BatchRequest::DEFAULT_VAL_START,
        }
    }

    #[test]
    fn arguments_are_passed_as_a_vector() {
        let builder = CommandBatchBuilder::new("clmbr_create_batches");
        let args = builder.arguments(&request(PathBuf::from("/tmp/task batches")));
        let args: Vec<String> = args
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect();
        assert_eq!(args[0], "/tmp/task batches");
        assert!(args.windows(2).any(|w| w == ["--task", "labeled_patients"]));
        assert!(args.windows(2).any(|w| w == ["--val_start", "70"]));
        assert!(args.windows(2).any(|w| w == ["--transformer_vocab_size", "65536"]));
        assert!(args.windows(2).any(|w| w == ["--batch_size", "4096"]));
        assert!(args.contains(&"--is_hierarchical".to_string()));
    }

    #[test]
    fn missing_program_is_a_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CommandBatchBuilder::new(dir.path().join("no_such_program"));
        assert!(builder.build(&request(dir.path().join("out"))).is_err());
    }

    struct CountingBuilder {
        calls: Cell<usize>,
    }

    impl BatchBuilder for CountingBuilder {
        fn build(&self, _request: &BatchRequest) -> Result<(), TrainingError> {
            self.calls.set(self.calls.get() + 1);
            Err(TrainingError::runtime("not available"))
        }
    }

    #[test]
    fn existing_destination_skips_the_builder() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CountingBuilder {
            calls: Cell::new(0),
        };

        // Existing but empty directory: builder is skipped, open fails on the missing info.
        assert!(ensure_batches(&builder, &request(dir.path().to_path_buf())).is_err());
        assert_eq!(builder.calls.get(), 0);

        assert!(ensure_batches(&builder, &request(dir.path().join("fresh"))).is_err());
        assert_eq!(builder.calls.get(), 1);
    }
}
