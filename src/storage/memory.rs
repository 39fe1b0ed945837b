//! In-memory store for tests and `--in-memory` runs.
//!
//! Thread-safe via `RwLock`. Not durable, data is lost on restart. The
//! uniqueness check and the insert happen under one write lock.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{finish_history, sensor_key, time_key, InsertOutcome, PersistentStore, StoreError};
use crate::types::{
    HistoryQuery, ManualKind, ManualPrediction, SensorRecord, Stage, StagePrediction,
};

#[derive(Default)]
pub struct InMemoryStore {
    sensors: RwLock<BTreeMap<Vec<u8>, SensorRecord>>,
    predictions: RwLock<HashMap<Stage, HashMap<String, StagePrediction>>>,
    manual: RwLock<HashMap<ManualKind, BTreeMap<Vec<u8>, ManualPrediction>>>,
    watermark: RwLock<Option<DateTime<Utc>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prediction_count(&self, stage: Stage) -> usize {
        self.predictions
            .read()
            .map(|p| p.get(&stage).map_or(0, HashMap::len))
            .unwrap_or(0)
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl PersistentStore for InMemoryStore {
    fn insert_sensor_record(&self, record: &SensorRecord) -> Result<(), StoreError> {
        let mut sensors = self.sensors.write().map_err(poisoned)?;
        sensors.insert(sensor_key(record), record.clone());
        Ok(())
    }

    fn recent_sensor_records(
        &self,
        limit: usize,
        newer_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<SensorRecord>, StoreError> {
        let sensors = self.sensors.read().map_err(poisoned)?;
        Ok(sensors
            .values()
            .rev()
            .take_while(|r| newer_than.map_or(true, |w| r.created_at > w))
            .take(limit)
            .cloned()
            .collect())
    }

    fn prediction_exists(&self, stage: Stage, sensor_record_id: &str) -> Result<bool, StoreError> {
        let predictions = self.predictions.read().map_err(poisoned)?;
        Ok(predictions
            .get(&stage)
            .is_some_and(|m| m.contains_key(sensor_record_id)))
    }

    fn insert_prediction(&self, prediction: &StagePrediction) -> Result<InsertOutcome, StoreError> {
        let mut predictions = self.predictions.write().map_err(poisoned)?;
        let collection = predictions.entry(prediction.stage()).or_default();
        if collection.contains_key(&prediction.sensor_record_id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        collection.insert(prediction.sensor_record_id.clone(), prediction.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn get_prediction(
        &self,
        stage: Stage,
        sensor_record_id: &str,
    ) -> Result<Option<StagePrediction>, StoreError> {
        let predictions = self.predictions.read().map_err(poisoned)?;
        Ok(predictions
            .get(&stage)
            .and_then(|m| m.get(sensor_record_id))
            .cloned())
    }

    fn prediction_history(
        &self,
        stage: Stage,
        query: &HistoryQuery,
    ) -> Result<Vec<StagePrediction>, StoreError> {
        let predictions = self.predictions.read().map_err(poisoned)?;
        let rows = predictions
            .get(&stage)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok(finish_history(rows, query))
    }

    fn insert_manual_prediction(&self, prediction: &ManualPrediction) -> Result<(), StoreError> {
        let mut manual = self.manual.write().map_err(poisoned)?;
        manual.entry(prediction.kind()).or_default().insert(
            time_key(prediction.created_at, &prediction.record_id),
            prediction.clone(),
        );
        Ok(())
    }

    fn manual_history(
        &self,
        kind: ManualKind,
        query: &HistoryQuery,
    ) -> Result<Vec<ManualPrediction>, StoreError> {
        let manual = self.manual.read().map_err(poisoned)?;
        Ok(manual
            .get(&kind)
            .map(|rows| {
                rows.values()
                    .rev()
                    .filter(|p| query.matches(p.created_at))
                    .take(query.limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.watermark.read().map_err(poisoned)?)
    }

    fn save_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        *self.watermark.write().map_err(poisoned)? = Some(watermark);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{classification, manual_classification, reading};
    use chrono::Duration;

    #[test]
    fn test_in_memory_list_order() {
        let store = InMemoryStore::new();
        store.insert_sensor_record(&reading("a", 20)).unwrap();
        store.insert_sensor_record(&reading("b", 10)).unwrap();
        store.insert_sensor_record(&reading("c", 0)).unwrap();

        let list = store.recent_sensor_records(2, None).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "c"); // most recent first
        assert_eq!(list[1].id, "b");
    }

    #[test]
    fn test_in_memory_unique_insert() {
        let store = InMemoryStore::new();
        let p = classification("r1", Utc::now());
        assert_eq!(store.insert_prediction(&p).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_prediction(&p).unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(store.prediction_count(Stage::Classification), 1);
        assert!(store.get_prediction(Stage::Classification, "r1").unwrap().is_some());
        assert!(store.get_prediction(Stage::Regression, "r1").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_inserts_store_once() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let p = classification("race", Utc::now());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let p = p.clone();
                std::thread::spawn(move || store.insert_prediction(&p).unwrap())
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == InsertOutcome::Inserted)
            .count();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn test_manual_history_newest_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for mins in [10, 0, 5] {
            store
                .insert_manual_prediction(&manual_classification(now - Duration::minutes(mins)))
                .unwrap();
        }
        let rows = store
            .manual_history(ManualKind::Classification, &HistoryQuery::latest(2))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].created_at, now);
        assert_eq!(rows[1].created_at, now - Duration::minutes(5));
    }

    #[test]
    fn test_watermark() {
        let store = InMemoryStore::new();
        assert_eq!(store.load_watermark().unwrap(), None);
        let mark = Utc::now();
        store.save_watermark(mark).unwrap();
        assert_eq!(store.load_watermark().unwrap(), Some(mark));
    }
}
