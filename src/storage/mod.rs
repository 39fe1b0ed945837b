//! Persistent Store
//!
//! `PersistentStore` abstracts the document store the backfill reads sensor
//! readings from and writes stage predictions to:
//! - `SledStore`: embedded sled database, one tree per collection
//! - `InMemoryStore`: `RwLock`-guarded maps for tests and `--in-memory` runs
//!
//! Both enforce the same invariant: at most one `StagePrediction` per
//! `(stage, sensor_record_id)`. A second insert reports
//! `InsertOutcome::AlreadyExists` rather than an error. Manual predictions
//! from the API are plain appends with no uniqueness constraint.

mod memory;
mod sled_store;

pub use memory::InMemoryStore;
pub use sled_store::SledStore;

use chrono::{DateTime, Utc};
use std::ops::Bound;
use std::time::Duration;

use crate::types::{HistoryQuery, ManualKind, ManualPrediction, SensorRecord, Stage, StagePrediction};

/// Result of a unique insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already stored a prediction for this key.
    AlreadyExists,
}

/// Trait for pluggable persistence backends
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across the backfill workers and HTTP handlers. All methods block.
pub trait PersistentStore: Send + Sync {
    /// Store a raw sensor reading. Re-inserting the same reading overwrites it.
    fn insert_sensor_record(&self, record: &SensorRecord) -> Result<(), StoreError>;

    /// Up to `limit` readings, newest `created_at` first.
    ///
    /// With `newer_than` set, only readings strictly newer are returned.
    fn recent_sensor_records(
        &self,
        limit: usize,
        newer_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<SensorRecord>, StoreError>;

    fn prediction_exists(&self, stage: Stage, sensor_record_id: &str) -> Result<bool, StoreError>;

    /// Insert guarded by the per-stage uniqueness constraint.
    fn insert_prediction(&self, prediction: &StagePrediction) -> Result<InsertOutcome, StoreError>;

    fn get_prediction(
        &self,
        stage: Stage,
        sensor_record_id: &str,
    ) -> Result<Option<StagePrediction>, StoreError>;

    /// Predictions filtered on `predicted_at`, newest first, at most `query.limit`.
    fn prediction_history(
        &self,
        stage: Stage,
        query: &HistoryQuery,
    ) -> Result<Vec<StagePrediction>, StoreError>;

    /// Append a manual prediction under its own `record_id`.
    fn insert_manual_prediction(&self, prediction: &ManualPrediction) -> Result<(), StoreError>;

    /// Manual predictions filtered on `created_at`, newest first, at most `query.limit`.
    fn manual_history(
        &self,
        kind: ManualKind,
        query: &HistoryQuery,
    ) -> Result<Vec<ManualPrediction>, StoreError>;

    fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    fn save_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError>;

    /// Flush pending writes, if the backend buffers any.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store task failed: {0}")]
    Task(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Ordering key for sensor readings: big-endian `created_at` nanoseconds
/// (sign bit flipped so pre-epoch times sort first) followed by the id.
pub(crate) fn sensor_key(record: &SensorRecord) -> Vec<u8> {
    time_key(record.created_at, &record.id)
}

/// Timestamp prefix then id: byte order is time order, ids break ties.
pub(crate) fn time_key(ts: DateTime<Utc>, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&timestamp_key(ts));
    key.extend_from_slice(id.as_bytes());
    key
}

pub(crate) fn timestamp_key(ts: DateTime<Utc>) -> [u8; 8] {
    let nanos = ts
        .timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp().saturating_mul(1_000_000_000));
    ((nanos as u64) ^ (1 << 63)).to_be_bytes()
}

/// Key range covering `time_key`s whose timestamp lies within the query
/// bounds, both inclusive.
pub(crate) fn time_range(query: &HistoryQuery) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lower = query
        .start
        .map_or(Bound::Unbounded, |s| Bound::Included(timestamp_key(s).to_vec()));
    let upper = query
        .end
        .and_then(|e| u64::from_be_bytes(timestamp_key(e)).checked_add(1))
        .map_or(Bound::Unbounded, |next| Bound::Excluded(next.to_be_bytes().to_vec()));
    (lower, upper)
}

/// Shared history post-processing: filter, newest first, truncate.
pub(crate) fn finish_history(
    mut rows: Vec<StagePrediction>,
    query: &HistoryQuery,
) -> Vec<StagePrediction> {
    rows.retain(|p| query.matches(p.predicted_at));
    rows.sort_by(|a, b| b.predicted_at.cmp(&a.predicted_at));
    rows.truncate(query.limit);
    rows
}

/// Fixtures shared by the backend test suites.
#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Duration, Utc};
    use std::collections::BTreeMap;

    use crate::types::{
        Attribution, ConfidenceInterval, DecisionResult, ManualPrediction, ManualResult,
        NextAction, Recommendation, SensorRecord, StagePrediction, StageResult,
        ClassificationDecision, WaterStatus,
    };

    pub fn reading(id: &str, minutes_ago: i64) -> SensorRecord {
        SensorRecord::new(id, Utc::now() - Duration::minutes(minutes_ago), 7.0, 12.0, 450.0)
    }

    pub fn classification(id: &str, predicted_at: DateTime<Utc>) -> StagePrediction {
        StagePrediction {
            sensor_record_id: id.to_string(),
            sensor_created_at: predicted_at,
            raw_inputs: BTreeMap::from([("ph".to_string(), 7.0)]),
            result: StageResult::Classification(classification_decision()),
            predicted_at,
        }
    }

    /// Manual classification request made at `created_at`.
    pub fn manual_classification(created_at: DateTime<Utc>) -> ManualPrediction {
        ManualPrediction::new(
            BTreeMap::from([("ph".to_string(), 7.0)]),
            ManualResult::Classification(classification_decision()),
            created_at,
        )
    }

    fn classification_decision() -> ClassificationDecision {
        ClassificationDecision {
            decision: DecisionResult {
                recommended_value: Recommendation::Class {
                    label: WaterStatus::Normal,
                },
                predicted_value: 0.3,
                confidence_interval: ConfidenceInterval::around(0.3, 0.08),
                attribution: Attribution {
                    feature_names: vec!["Raw_Water_PH".into()],
                    feature_values: vec![7.0],
                    attribution_values: vec![0.1],
                    base_value: -1.0,
                },
                explanation_text: "test".to_string(),
            },
            status: WaterStatus::Normal,
            abnormal_probability: 0.3,
            threshold: 0.42,
            next_action: NextAction::NormalRegression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_key_orders_across_epoch() {
        let before = Utc.with_ymd_and_hms(1969, 12, 31, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(timestamp_key(before) < timestamp_key(after));
    }

    #[test]
    fn test_trait_object() {
        let store: Box<dyn PersistentStore> = Box::new(InMemoryStore::new());
        assert_eq!(store.backend_name(), "InMemory");
        assert!(store.flush().is_ok());
    }
}
