//! Sled-backed store.
//!
//! One named tree per collection. Sensor readings are keyed by
//! `sensor_key` so reverse iteration yields newest first; predictions are
//! keyed by sensor record id and written with `compare_and_swap` against an
//! empty slot, which makes the uniqueness check and the write one atomic step.
//!
//! Each prediction tree has a companion `<collection>_by_time` index keyed by
//! `time_key(predicted_at, id)`, so history walks newest first and stops at
//! the limit. Manual prediction trees are keyed by `time_key` directly.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    sensor_key, time_key, time_range, InsertOutcome, PersistentStore, StoreError,
};
use crate::types::{
    HistoryQuery, ManualKind, ManualPrediction, SensorRecord, Stage, StagePrediction,
};

const SENSOR_TREE: &str = "sensor_readings";
const META_TREE: &str = "pipeline_meta";
const WATERMARK_KEY: &[u8] = b"watermark";

#[derive(Clone)]
pub struct SledStore {
    db: Arc<sled::Db>,
    sensors: sled::Tree,
    meta: sled::Tree,
    predictions: [sled::Tree; 4],
    by_time: [sled::Tree; 4],
    manual: [sled::Tree; 5],
}

impl SledStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        let store = Self::from_db(db)?;
        info!(path = %path_ref.display(), "Sled store opened");
        Ok(store)
    }

    /// Temporary store removed on drop.
    #[cfg(test)]
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let sensors = db.open_tree(SENSOR_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        let [pre, post, class, reg] = Stage::ALL;
        let predictions = [
            db.open_tree(pre.collection())?,
            db.open_tree(post.collection())?,
            db.open_tree(class.collection())?,
            db.open_tree(reg.collection())?,
        ];
        let by_time = [
            db.open_tree(index_name(pre))?,
            db.open_tree(index_name(post))?,
            db.open_tree(index_name(class))?,
            db.open_tree(index_name(reg))?,
        ];
        let manual = [
            db.open_tree(ManualKind::PreLime.collection())?,
            db.open_tree(ManualKind::PostLime.collection())?,
            db.open_tree(ManualKind::Classification.collection())?,
            db.open_tree(ManualKind::NormalRegression.collection())?,
            db.open_tree(ManualKind::AdvanceRegression.collection())?,
        ];
        let store = Self {
            db: Arc::new(db),
            sensors,
            meta,
            predictions,
            by_time,
            manual,
        };
        for stage in Stage::ALL {
            store.repair_index(stage)?;
        }
        Ok(store)
    }

    const fn slot(stage: Stage) -> usize {
        match stage {
            Stage::PreLime => 0,
            Stage::PostLime => 1,
            Stage::Classification => 2,
            Stage::Regression => 3,
        }
    }

    fn tree(&self, stage: Stage) -> &sled::Tree {
        &self.predictions[Self::slot(stage)]
    }

    fn index(&self, stage: Stage) -> &sled::Tree {
        &self.by_time[Self::slot(stage)]
    }

    fn manual_tree(&self, kind: ManualKind) -> &sled::Tree {
        match kind {
            ManualKind::PreLime => &self.manual[0],
            ManualKind::PostLime => &self.manual[1],
            ManualKind::Classification => &self.manual[2],
            ManualKind::NormalRegression => &self.manual[3],
            ManualKind::AdvanceRegression => &self.manual[4],
        }
    }

    /// Rebuild a stage's time index when its size disagrees with the
    /// prediction tree (a crash between insert and index write, or a
    /// database written before the index existed). Runs at open only.
    fn repair_index(&self, stage: Stage) -> Result<(), StoreError> {
        let (tree, index) = (self.tree(stage), self.index(stage));
        if tree.len() == index.len() {
            return Ok(());
        }
        warn!(stage = %stage, predictions = tree.len(), indexed = index.len(), "Rebuilding prediction time index");
        index.clear()?;
        for item in tree.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<StagePrediction>(&value) {
                Ok(p) => {
                    index.insert(time_key(p.predicted_at, &p.sensor_record_id), key)?;
                }
                Err(e) => warn!(stage = %stage, "Skipping undecodable prediction: {}", e),
            }
        }
        Ok(())
    }

    /// Number of stored sensor readings.
    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn prediction_count(&self, stage: Stage) -> usize {
        self.tree(stage).len()
    }
}

impl PersistentStore for SledStore {
    fn insert_sensor_record(&self, record: &SensorRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record)?;
        self.sensors.insert(sensor_key(record), value)?;
        Ok(())
    }

    fn recent_sensor_records(
        &self,
        limit: usize,
        newer_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<SensorRecord>, StoreError> {
        let mut records = Vec::with_capacity(limit.min(1024));

        for item in self.sensors.iter().rev() {
            if records.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            match serde_json::from_slice::<SensorRecord>(&value) {
                Ok(record) => {
                    if newer_than.is_some_and(|w| record.created_at <= w) {
                        break;
                    }
                    records.push(record);
                }
                Err(e) => {
                    warn!("Skipping undecodable sensor reading: {}", e);
                    continue;
                }
            }
        }

        debug!(count = records.len(), "Fetched recent sensor readings");
        Ok(records)
    }

    fn prediction_exists(&self, stage: Stage, sensor_record_id: &str) -> Result<bool, StoreError> {
        Ok(self.tree(stage).contains_key(sensor_record_id.as_bytes())?)
    }

    fn insert_prediction(&self, prediction: &StagePrediction) -> Result<InsertOutcome, StoreError> {
        let stage = prediction.stage();
        let id = prediction.sensor_record_id.as_bytes();
        let value = serde_json::to_vec(prediction)?;
        let swapped = self
            .tree(stage)
            .compare_and_swap(id, None as Option<&[u8]>, Some(value))?;
        if swapped.is_err() {
            return Ok(InsertOutcome::AlreadyExists);
        }
        // Only the CAS winner indexes, so each prediction has one entry.
        self.index(stage)
            .insert(time_key(prediction.predicted_at, &prediction.sensor_record_id), id)?;
        Ok(InsertOutcome::Inserted)
    }

    fn get_prediction(
        &self,
        stage: Stage,
        sensor_record_id: &str,
    ) -> Result<Option<StagePrediction>, StoreError> {
        match self.tree(stage).get(sensor_record_id.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn prediction_history(
        &self,
        stage: Stage,
        query: &HistoryQuery,
    ) -> Result<Vec<StagePrediction>, StoreError> {
        if query.is_inverted() {
            return Ok(Vec::new());
        }
        let tree = self.tree(stage);
        let mut rows = Vec::with_capacity(query.limit.min(1024));

        for item in self.index(stage).range(time_range(query)).rev() {
            if rows.len() >= query.limit {
                break;
            }
            let (_key, id) = item?;
            let Some(value) = tree.get(&id)? else {
                continue;
            };
            match serde_json::from_slice::<StagePrediction>(&value) {
                Ok(p) if query.matches(p.predicted_at) => rows.push(p),
                Ok(_) => {}
                Err(e) => warn!(stage = %stage, "Skipping undecodable prediction: {}", e),
            }
        }
        Ok(rows)
    }

    fn insert_manual_prediction(&self, prediction: &ManualPrediction) -> Result<(), StoreError> {
        let key = time_key(prediction.created_at, &prediction.record_id);
        self.manual_tree(prediction.kind())
            .insert(key, serde_json::to_vec(prediction)?)?;
        Ok(())
    }

    fn manual_history(
        &self,
        kind: ManualKind,
        query: &HistoryQuery,
    ) -> Result<Vec<ManualPrediction>, StoreError> {
        if query.is_inverted() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::with_capacity(query.limit.min(1024));
        for item in self.manual_tree(kind).range(time_range(query)).rev() {
            if rows.len() >= query.limit {
                break;
            }
            let (_key, value) = item?;
            match serde_json::from_slice::<ManualPrediction>(&value) {
                Ok(p) => rows.push(p),
                Err(e) => warn!(%kind, "Skipping undecodable manual prediction: {}", e),
            }
        }
        Ok(rows)
    }

    fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.meta.get(WATERMARK_KEY)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn save_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError> {
        self.meta.insert(WATERMARK_KEY, serde_json::to_vec(&watermark)?)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Sled"
    }
}

fn index_name(stage: Stage) -> String {
    format!("{}_by_time", stage.collection())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{classification, manual_classification, reading};
    use chrono::Duration;

    #[test]
    fn test_recent_is_newest_first_and_bounded() {
        let store = SledStore::open_temp().unwrap();
        store.insert_sensor_record(&reading("old", 30)).unwrap();
        store.insert_sensor_record(&reading("new", 1)).unwrap();
        store.insert_sensor_record(&reading("mid", 10)).unwrap();

        let recent = store.recent_sensor_records(2, None).unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid"]);
        assert_eq!(store.sensor_count(), 3);
    }

    #[test]
    fn test_recent_respects_watermark() {
        let store = SledStore::open_temp().unwrap();
        let old = reading("old", 30);
        store.insert_sensor_record(&old).unwrap();
        store.insert_sensor_record(&reading("new", 1)).unwrap();

        let recent = store.recent_sensor_records(10, Some(old.created_at)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "new");
    }

    #[test]
    fn test_prediction_unique_per_stage() {
        let store = SledStore::open_temp().unwrap();
        let p = classification("r1", Utc::now());

        assert!(!store.prediction_exists(Stage::Classification, "r1").unwrap());
        assert_eq!(store.insert_prediction(&p).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_prediction(&p).unwrap(), InsertOutcome::AlreadyExists);
        assert!(store.prediction_exists(Stage::Classification, "r1").unwrap());
        assert!(!store.prediction_exists(Stage::PreLime, "r1").unwrap());
        assert_eq!(store.prediction_count(Stage::Classification), 1);

        let fetched = store.get_prediction(Stage::Classification, "r1").unwrap();
        assert_eq!(fetched, Some(p));
    }

    #[test]
    fn test_history_filters_and_sorts() {
        let store = SledStore::open_temp().unwrap();
        let now = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store
                .insert_prediction(&classification(id, now - Duration::hours(i as i64)))
                .unwrap();
        }

        let all = store
            .prediction_history(Stage::Classification, &HistoryQuery::latest(10))
            .unwrap();
        let ids: Vec<_> = all.iter().map(|p| p.sensor_record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let windowed = store
            .prediction_history(
                Stage::Classification,
                &HistoryQuery {
                    start: Some(now - Duration::hours(1)),
                    end: None,
                    limit: 1,
                },
            )
            .unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].sensor_record_id, "a");
    }

    #[test]
    fn test_watermark_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mark = Utc::now();
        {
            let store = SledStore::open(dir.path()).unwrap();
            assert_eq!(store.load_watermark().unwrap(), None);
            store.save_watermark(mark).unwrap();
            store.flush().unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.load_watermark().unwrap(), Some(mark));
    }

    #[test]
    fn test_concurrent_inserts_store_once() {
        let store = SledStore::open_temp().unwrap();
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
        assert_eq!(store.prediction_count(Stage::Classification), 1);
        assert_eq!(store.index(Stage::Classification).len(), 1);
    }

    #[test]
    fn test_history_stops_at_limit_with_inclusive_bounds() {
        let store = SledStore::open_temp().unwrap();
        let base = Utc::now();
        for i in 0..50 {
            store
                .insert_prediction(&classification(&format!("r{i:02}"), base + Duration::seconds(i)))
                .unwrap();
        }

        let query = HistoryQuery {
            start: Some(base + Duration::seconds(10)),
            end: Some(base + Duration::seconds(20)),
            limit: 100,
        };
        let rows = store.prediction_history(Stage::Classification, &query).unwrap();
        assert_eq!(rows.len(), 11);
        assert_eq!(rows[0].sensor_record_id, "r20");
        assert_eq!(rows[10].sensor_record_id, "r10");

        let latest = store
            .prediction_history(Stage::Classification, &HistoryQuery::latest(3))
            .unwrap();
        let ids: Vec<_> = latest.iter().map(|p| p.sensor_record_id.as_str()).collect();
        assert_eq!(ids, vec!["r49", "r48", "r47"]);
    }

    #[test]
    fn test_missing_index_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.insert_prediction(&classification("a", now - Duration::minutes(1))).unwrap();
            store.insert_prediction(&classification("b", now)).unwrap();
            store.index(Stage::Classification).clear().unwrap();
            store.flush().unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        let rows = store
            .prediction_history(Stage::Classification, &HistoryQuery::latest(10))
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|p| p.sensor_record_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_manual_predictions_append_newest_first() {
        let store = SledStore::open_temp().unwrap();
        let now = Utc::now();
        let older = manual_classification(now - Duration::minutes(5));
        let newer = manual_classification(now);
        let same_time = manual_classification(now);
        for p in [&older, &newer, &same_time] {
            store.insert_manual_prediction(p).unwrap();
        }

        let all = store
            .manual_history(ManualKind::Classification, &HistoryQuery::latest(10))
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], older);

        let recent = store
            .manual_history(
                ManualKind::Classification,
                &HistoryQuery {
                    start: Some(now - Duration::minutes(1)),
                    end: None,
                    limit: 10,
                },
            )
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert!(store
            .manual_history(ManualKind::PreLime, &HistoryQuery::latest(10))
            .unwrap()
            .is_empty());
    }
}
