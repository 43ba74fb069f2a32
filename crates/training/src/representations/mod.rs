//! Representation extraction for trained runs.
//!
//! A trained model is applied to every batch of a labeled-patient batch set. Each valid label
//! slot yields one tagged vector, and external labels are joined to those vectors causally.

pub mod alignment;
pub mod builder;
pub mod patients;

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

use candle_core::{DType, Device};
use chrono::NaiveDateTime;
use clmbr_model::{Batch, EhrTransformer, ParameterSet, Phase, TaskLabels};
use serde::{Deserialize, Serialize};

pub use alignment::align_representations;
pub use builder::{ensure_batches, BatchBuilder, BatchRequest, CommandBatchBuilder};
pub use patients::{prediction_time, JsonPatientDatabase, PatientDatabase, PatientRecord};

use crate::{
    checkpoint,
    config::{Precision, RunConfig},
    data::{BatchStore, BatchTask, LabelValue, Split},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// Precision the parameters are cast to before the forward pass.
    pub precision: Precision,
    /// Append a constant 1.0 column to every vector.
    pub append_bias_column: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Fp16,
            append_bias_column: true,
        }
    }
}

/// Label attached to a slot by the batch builder.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotLabel {
    pub age: u32,
    pub value: LabelValue,
}

/// One representation drawn from a valid label slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RepresentationRow {
    pub patient_id: i64,
    /// Age in minutes of the token the slot points at.
    pub age: u32,
    /// Offset of the slot's window within the patient timeline.
    pub offset: u32,
    pub vector: Vec<f32>,
    pub label: Option<SlotLabel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentationOutput {
    pub representations: Vec<Vec<f32>>,
    pub patient_ids: Vec<i64>,
    pub prediction_times: Vec<NaiveDateTime>,
    pub label_values: Vec<LabelValue>,
}

impl RepresentationOutput {
    pub fn len(&self) -> usize {
        self.patient_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patient_ids.is_empty()
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), TrainingError> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_json(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub struct RepresentationExtractor {
    run: RunConfig,
    model: EhrTransformer,
    params: ParameterSet,
    options: ExtractionOptions,
}

impl RepresentationExtractor {
    /// Loads the best parameters of a finished run.
    pub fn load(
        run_dir: &Path,
        device: &Device,
        options: ExtractionOptions,
    ) -> Result<Self, TrainingError> {
        let (run, params) = checkpoint::load_checkpoint(run_dir, device)?;
        Self::new(run, params, options)
    }

    pub fn new(
        run: RunConfig,
        params: ParameterSet,
        options: ExtractionOptions,
    ) -> Result<Self, TrainingError> {
        let model = EhrTransformer::new(run.transformer.clone(), run.task.clone())
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        let params = params
            .cast(options.precision.compute_dtype())
            .map_err(to_runtime_error)?;
        Ok(Self {
            run,
            model,
            params,
            options,
        })
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run
    }

    /// Representations for every valid slot of every split, in train, dev, test order.
    pub fn collect(&self, store: &dyn BatchStore) -> Result<Vec<RepresentationRow>, TrainingError> {
        let transformer = &store.info().transformer;
        if transformer.vocab_size != self.run.transformer.vocab_size
            || transformer.is_hierarchical != self.run.transformer.is_hierarchical
        {
            return Err(TrainingError::initialization(format!(
                "batches were built for vocab {} (hierarchical {}), model expects vocab {} (hierarchical {})",
                transformer.vocab_size,
                transformer.is_hierarchical,
                self.run.transformer.vocab_size,
                self.run.transformer.is_hierarchical
            )));
        }

        let mut rows = Vec::new();
        for split in Split::ALL {
            let count = store.batch_count(split);
            log::info!("computing representations for {count} {split} batches");
            for index in 0..count {
                let batch = store.batch(split, index)?;
                if batch.is_empty() {
                    continue;
                }
                self.collect_batch(&batch, &mut rows).map_err(|err| {
                    TrainingError::runtime(format!("{split} batch {index}: {err}"))
                })?;
            }
        }
        Ok(rows)
    }

    fn collect_batch(
        &self,
        batch: &Batch,
        rows: &mut Vec<RepresentationRow>,
    ) -> Result<(), TrainingError> {
        let representations = self
            .model
            .represent(&self.params, batch, &mut Phase::Eval)
            .map_err(to_runtime_error)?;
        let vectors = representations
            .features
            .to_dtype(DType::F32)
            .and_then(|features| features.to_vec2::<f32>())
            .map_err(to_runtime_error)?;

        for (slot, mut vector) in vectors.into_iter().enumerate() {
            if !representations.mask[slot] {
                continue;
            }
            if self.options.append_bias_column {
                vector.push(1.0);
            }
            let row = batch.slot_row(slot);
            let token = batch.transformer.label_indices[slot] as usize;
            rows.push(RepresentationRow {
                patient_id: batch.patient_ids[row],
                age: batch.transformer.integer_ages[token],
                offset: batch.offsets[row],
                vector,
                label: slot_label(&batch.task, slot),
            });
        }
        Ok(())
    }

    /// Joins the labels recorded in the batch info to their causal representations. Rows come
    /// out in label order.
    pub fn extract(
        &self,
        store: &dyn BatchStore,
        patients: &dyn PatientDatabase,
    ) -> Result<RepresentationOutput, TrainingError> {
        let BatchTask::LabeledPatients { labels, .. } = &store.info().task else {
            return Err(TrainingError::initialization(
                "representation extraction requires labeled_patients batches",
            ));
        };
        let rows = self.collect(store)?;

        let repr_pids: Vec<i64> = rows.iter().map(|row| row.patient_id).collect();
        let repr_ages: Vec<u32> = rows.iter().map(|row| row.age).collect();
        let repr_offsets: Vec<u32> = rows.iter().map(|row| row.offset).collect();
        let label_pids: Vec<i64> = labels.iter().map(|label| label.patient_id).collect();
        let label_ages: Vec<u32> = labels.iter().map(|label| label.age).collect();

        let matches = align_representations(
            &label_pids,
            &label_ages,
            &repr_pids,
            &repr_ages,
            &repr_offsets,
        )?;
        log::info!("aligned {} labels to {} representations", labels.len(), rows.len());

        let mut output = empty_output(labels.len());
        for (label, index) in labels.iter().zip(matches) {
            output.representations.push(rows[index].vector.clone());
            output.patient_ids.push(label.patient_id);
            output.prediction_times.push(prediction_time(
                patients.birth_date(label.patient_id)?,
                label.age,
            ));
            output.label_values.push(label.value.clone());
        }
        Ok(output)
    }

    /// Takes one representation per labeled slot straight from the batches. Duplicate
    /// (patient, label age) pairs keep the slot with the smallest offset.
    pub fn extract_direct(
        &self,
        store: &dyn BatchStore,
        patients: &dyn PatientDatabase,
    ) -> Result<RepresentationOutput, TrainingError> {
        let mut labeled: Vec<(i64, SlotLabel, u32, Vec<f32>)> = self
            .collect(store)?
            .into_iter()
            .filter_map(|row| {
                row.label
                    .map(|label| (row.patient_id, label, row.offset, row.vector))
            })
            .collect();
        if labeled.is_empty() {
            return Err(TrainingError::runtime(
                "batches carry no labeled slots for direct extraction",
            ));
        }
        labeled.sort_by_key(|(pid, label, offset, _)| (*pid, label.age, *offset));
        labeled.dedup_by_key(|(pid, label, _, _)| (*pid, label.age));

        let mut output = empty_output(labeled.len());
        for (pid, label, _, vector) in labeled {
            output.representations.push(vector);
            output.patient_ids.push(pid);
            output
                .prediction_times
                .push(prediction_time(patients.birth_date(pid)?, label.age));
            output.label_values.push(label.value);
        }
        Ok(output)
    }
}

fn slot_label(task: &TaskLabels, slot: usize) -> Option<SlotLabel> {
    match task {
        TaskLabels::Boolean { labels, label_ages } => Some(SlotLabel {
            age: *label_ages.get(slot)?,
            value: LabelValue::Boolean(*labels.get(slot)?),
        }),
        TaskLabels::Survival {
            event_times,
            is_censor,
            label_ages,
        } => Some(SlotLabel {
            age: *label_ages.get(slot)?,
            value: LabelValue::Event {
                time: f64::from(*event_times.get(slot)?),
                is_censored: *is_censor.get(slot)?,
            },
        }),
        TaskLabels::Clmbr { .. } | TaskLabels::SurvivalClmbr { .. } | TaskLabels::None => None,
    }
}

fn empty_output(capacity: usize) -> RepresentationOutput {
    RepresentationOutput {
        representations: Vec::with_capacity(capacity),
        patient_ids: Vec::with_capacity(capacity),
        prediction_times: Vec::with_capacity(capacity),
        label_values: Vec::with_capacity(capacity),
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
