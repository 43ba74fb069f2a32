use std::{collections::HashMap, fs, path::Path};

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Birth-date lookup used to turn label ages back into timestamps.
pub trait PatientDatabase {
    fn birth_date(&self, patient_id: i64) -> Result<NaiveDate, TrainingError>;
}

impl PatientDatabase for HashMap<i64, NaiveDate> {
    fn birth_date(&self, patient_id: i64) -> Result<NaiveDate, TrainingError> {
        self.get(&patient_id)
            .copied()
            .ok_or_else(|| unknown_patient(patient_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: i64,
    pub birth_date: NaiveDate,
}

/// Patient table read from a JSON array of `{patient_id, birth_date}` records.
#[derive(Debug, Clone, Default)]
pub struct JsonPatientDatabase {
    births: HashMap<i64, NaiveDate>,
}

impl JsonPatientDatabase {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to read patient database {}: {err}",
                path.display()
            ))
        })?;
        let records: Vec<PatientRecord> = serde_json::from_str(&text)?;
        Ok(Self::from_records(records))
    }

    pub fn from_records(records: impl IntoIterator<Item = PatientRecord>) -> Self {
        Self {
            births: records
                .into_iter()
                .map(|record| (record.patient_id, record.birth_date))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.births.len()
    }

    pub fn is_empty(&self) -> bool {
        self.births.is_empty()
    }
}

impl PatientDatabase for JsonPatientDatabase {
    fn birth_date(&self, patient_id: i64) -> Result<NaiveDate, TrainingError> {
        self.births.birth_date(patient_id)
    }
}

/// Midnight of the birth date plus `age_minutes`.
pub fn prediction_time(birth_date: NaiveDate, age_minutes: u32) -> NaiveDateTime {
    birth_date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(age_minutes))
}

fn unknown_patient(patient_id: i64) -> TrainingError {
    TrainingError::runtime(format!("patient {patient_id} is not in the patient database"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_time_counts_minutes_from_midnight() {
        let birth = NaiveDate::from_ymd_opt(2000, 2, 28).unwrap();
        let time = prediction_time(birth, 24 * 60 + 90);
        assert_eq!(
            time,
            NaiveDate::from_ymd_opt(2000, 2, 29)
                .unwrap()
                .and_hms_opt(1, 30, 0)
                .unwrap()
        );
    }

    #[test]
    fn json_database_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patients.json");
        fs::write(
            &path,
            r#"[{"patient_id": 3, "birth_date": "1980-05-01"}, {"patient_id": 4, "birth_date": "1990-01-31"}]"#,
        )
        .unwrap();

        let database = JsonPatientDatabase::open(&path).unwrap();
        assert_eq!(database.len(), 2);
        assert_eq!(
            database.birth_date(4).unwrap(),
            NaiveDate::from_ymd_opt(1990, 1, 31).unwrap()
        );
        assert!(database.birth_date(5).is_err());
    }
}
