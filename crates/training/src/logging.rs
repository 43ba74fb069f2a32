use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use bytes::BytesMut;
use chrono::{Local, Utc};
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{evaluation::EvaluationReport, metrics::StepSnapshot, TrainingError};

/// Name of the append-only run log inside a run directory.
pub const RUN_LOG_FILE: &str = "log";

/// Run logger: timestamped lines appended to `<run>/log`, mirrored through the `log` facade,
/// plus optional TensorBoard scalars.
pub struct Logger {
    log_file: File,
    path: PathBuf,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn create(run_dir: &Path, tensorboard_dir: Option<&Path>) -> Result<Self, TrainingError> {
        let path = run_dir.join(RUN_LOG_FILE);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to open run log {}: {err}", path.display()))
            })?;
        let tensorboard = tensorboard_dir
            .map(|dir| TensorBoardWriter::create(dir, 20))
            .transpose()?;
        Ok(Self {
            log_file,
            path,
            tensorboard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::info!("{message}");
        self.append("INFO", message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::error!("{message}");
        self.append("ERROR", message);
    }

    fn append(&mut self, level: &str, message: &str) {
        let line = format!(
            "{} {} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            message
        );
        if let Err(err) = self.log_file.write_all(line.as_bytes()) {
            log::warn!("failed to append to {}: {err}", self.path.display());
        }
    }

    pub fn log_training_step(
        &mut self,
        step: usize,
        lr: f64,
        loss_scale: f64,
        snapshot: &StepSnapshot,
    ) {
        self.info(format!(
            "Step {} loss={:.4} ema={:.4} indices/s={:.1} grad_norm={:.3} lr={:.5e} loss_scale={} skipped={}",
            step,
            snapshot.step_loss,
            snapshot.loss,
            snapshot.indices_per_sec,
            snapshot.raw_grad_norm,
            lr,
            loss_scale,
            snapshot.skipped_updates
        ));

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            let _ = writer.write_scalar("train/loss", step, snapshot.step_loss);
            let _ = writer.write_scalar("train/loss_ema", step, snapshot.loss);
            let _ = writer.write_scalar("train/indices_per_sec", step, snapshot.indices_per_sec);
            let _ = writer.write_scalar("train/grad_norm", step, snapshot.raw_grad_norm);
            let _ = writer.write_scalar("train/learning_rate", step, lr);
            let _ = writer.write_scalar("train/loss_scale", step, loss_scale);
        }
    }

    pub fn log_evaluation(&mut self, step: usize, split: &str, report: &EvaluationReport) {
        let mut line = format!(
            "{} loss at step {}: loss={:.6} loss2={:.6} c_statistic={:.6}",
            split, step, report.loss, report.loss2, report.c_statistic
        );
        if let (Some(auroc), Some(ap)) = (report.auroc, report.average_precision) {
            line.push_str(&format!(" auroc={auroc:.6} ap={ap:.6}"));
        }
        self.info(line);

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = step as i64;
            let _ = writer.write_scalar(&format!("{split}/loss"), step, report.loss);
            let _ = writer.write_scalar(&format!("{split}/c_statistic"), step, report.c_statistic);
        }
    }

    pub fn flush(&mut self) {
        if let Err(err) = self.log_file.flush() {
            log::warn!("failed to flush {}: {err}", self.path.display());
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            Utc::now().timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: Utc::now().timestamp_micros() as f64 / 1e6,
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    /// TFRecord framing: length, masked CRC of length, payload, masked CRC of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
