//! Stage Orchestrator
//!
//! Runs the four stages for every record in a window. Each stage is
//! isolated: its failure is recorded and logged, and the remaining stages
//! and records carry on. Records are processed through a bounded worker
//! pool; stages within one record run in order so Post-Lime can reuse the
//! Pre-Lime decision computed moments earlier.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

use super::{IdempotencyGuard, PipelineContext, StageError};
use crate::config::PostLimeInput;
use crate::engines::{self, POST_LIME, PRE_LIME};
use crate::model_service::ModelService;
use crate::storage::InsertOutcome;
use crate::types::{
    Attribution, DoseDecision, RegressionDecision, SensorRecord, Stage, StagePrediction,
    StageResult,
};

// ============================================================================
// Outcomes & Reports
// ============================================================================

/// What happened to one stage of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Inserted,
    /// Lost the insert race to another writer.
    AlreadyExists,
    /// The guard found an existing prediction; nothing was computed.
    Skipped,
    Failed(String),
}

impl StageOutcome {
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<InsertOutcome> for StageOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted => Self::Inserted,
            InsertOutcome::AlreadyExists => Self::AlreadyExists,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordReport {
    pub sensor_record_id: String,
    pub outcomes: Vec<(Stage, StageOutcome)>,
}

impl RecordReport {
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|(s, _)| *s == stage).map(|(_, o)| o)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCounts {
    pub inserted: usize,
    pub already_exists: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl StageCounts {
    fn add(&mut self, outcome: &StageOutcome) {
        match outcome {
            StageOutcome::Inserted => self.inserted += 1,
            StageOutcome::AlreadyExists => self.already_exists += 1,
            StageOutcome::Skipped => self.skipped += 1,
            StageOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Aggregate of one backfill cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub records_scanned: usize,
    pub stages: BTreeMap<Stage, StageCounts>,
    /// Newest `created_at` in the window.
    pub newest_created_at: Option<DateTime<Utc>>,
    /// Set when this cycle advanced the watermark.
    pub watermark: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn new(records_scanned: usize) -> Self {
        Self {
            started_at: Utc::now(),
            records_scanned,
            stages: Stage::ALL.iter().map(|s| (*s, StageCounts::default())).collect(),
            newest_created_at: None,
            watermark: None,
            duration_ms: 0,
        }
    }

    fn absorb(&mut self, record: &RecordReport) {
        for (stage, outcome) in &record.outcomes {
            self.stages.entry(*stage).or_default().add(outcome);
        }
    }

    pub fn counts(&self, stage: Stage) -> StageCounts {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    fn total(&self, pick: impl Fn(&StageCounts) -> usize) -> usize {
        self.stages.values().map(pick).sum()
    }

    /// Predictions written by this cycle.
    pub fn inserted(&self) -> usize {
        self.total(|c| c.inserted)
    }

    pub fn already_exists(&self) -> usize {
        self.total(|c| c.already_exists)
    }

    pub fn skipped(&self) -> usize {
        self.total(|c| c.skipped)
    }

    pub fn failed(&self) -> usize {
        self.total(|c| c.failed)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Cheap to clone; each worker future owns its own handle.
#[derive(Clone)]
pub struct StageOrchestrator {
    ctx: PipelineContext,
    guard: IdempotencyGuard,
}

impl StageOrchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        let guard = IdempotencyGuard::new(ctx.store.clone(), ctx.settings.store_timeout);
        Self { ctx, guard }
    }

    fn models(&self) -> &dyn ModelService {
        self.ctx.models.as_ref()
    }

    /// Process every record through the worker pool.
    pub async fn run(&self, records: &[SensorRecord]) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(records.len());
        report.newest_created_at = records.iter().map(|r| r.created_at).max();

        // Owned record and handle per worker so the future is 'static and
        // the scheduler stays spawnable.
        let workers = self.ctx.settings.max_concurrent_records.max(1);
        let mut results = stream::iter(records.iter().cloned())
            .map(|record| {
                let worker = self.clone();
                async move { worker.process_record(&record).await }
            })
            .buffer_unordered(workers);

        while let Some(record_report) = results.next().await {
            report.absorb(&record_report);
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report
    }

    /// Run all four stages for one record. Never fails as a whole.
    pub async fn process_record(&self, record: &SensorRecord) -> RecordReport {
        let (pre_outcome, pre_decision) = self.pre_lime(record).await;
        let post_outcome = self.post_lime(record, &pre_outcome, pre_decision.as_ref()).await;
        let classification_outcome = self.classification(record).await;
        let regression_outcome = self.regression(record).await;

        RecordReport {
            sensor_record_id: record.id.clone(),
            outcomes: vec![
                (Stage::PreLime, pre_outcome),
                (Stage::PostLime, post_outcome),
                (Stage::Classification, classification_outcome),
                (Stage::Regression, regression_outcome),
            ],
        }
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    /// Returns the decision too when it was computed, for Post-Lime chaining.
    async fn pre_lime(&self, record: &SensorRecord) -> (StageOutcome, Option<DoseDecision>) {
        let stage = Stage::PreLime;
        match self.guard.is_processed(stage, &record.id).await {
            Ok(true) => return (StageOutcome::Skipped, None),
            Ok(false) => {}
            Err(e) => return (failed(record, stage, &e.into()), None),
        }

        let decision = match record
            .sample()
            .map_err(StageError::from)
            .and_then(|sample| Ok(PRE_LIME.recommend(self.models(), &sample)?))
        {
            Ok(d) => d,
            Err(e) => return (failed(record, stage, &e), None),
        };

        let outcome = self
            .persist(record, StageResult::PreLime(decision.clone()))
            .await;
        (outcome, Some(decision))
    }

    async fn post_lime(
        &self,
        record: &SensorRecord,
        pre_outcome: &StageOutcome,
        pre_decision: Option<&DoseDecision>,
    ) -> StageOutcome {
        let stage = Stage::PostLime;
        // A Pre-Lime that computed its decision but failed to store it
        // still feeds Post-Lime.
        if let (StageOutcome::Failed(reason), None) = (pre_outcome, pre_decision) {
            let err = StageError::Dependency {
                stage: Stage::PreLime,
                reason: reason.clone(),
            };
            return failed(record, stage, &err);
        }

        match self.guard.is_processed(stage, &record.id).await {
            Ok(true) => return StageOutcome::Skipped,
            Ok(false) => {}
            Err(e) => return failed(record, stage, &e.into()),
        }

        let decision = match self.post_lime_decision(record, pre_decision).await {
            Ok(d) => d,
            Err(e) => return failed(record, stage, &e),
        };
        self.persist(record, StageResult::PostLime(decision)).await
    }

    async fn post_lime_decision(
        &self,
        record: &SensorRecord,
        pre_decision: Option<&DoseDecision>,
    ) -> Result<DoseDecision, StageError> {
        let settled_ph = self.settled_ph(record, pre_decision).await?;
        let sample = record.sample()?.with_ph(settled_ph)?;
        Ok(POST_LIME.recommend(self.models(), &sample)?)
    }

    /// Pre-Lime settled pH for chaining: this cycle's decision, else the
    /// stored prediction (when configured), else an in-memory recompute.
    async fn settled_ph(
        &self,
        record: &SensorRecord,
        pre_decision: Option<&DoseDecision>,
    ) -> Result<f64, StageError> {
        if let Some(decision) = pre_decision {
            return Ok(decision.predicted_ph());
        }

        if self.ctx.settings.post_lime_input == PostLimeInput::Persisted {
            let id = record.id.clone();
            let stored = self
                .guard
                .call(move |store| store.get_prediction(Stage::PreLime, &id))
                .await?;
            if let Some(StagePrediction {
                result: StageResult::PreLime(decision),
                ..
            }) = stored
            {
                return Ok(decision.predicted_ph());
            }
            debug!(sensor_record_id = %record.id, "No stored Pre-Lime prediction, recomputing");
        }

        Ok(PRE_LIME.recommend(self.models(), &record.sample()?)?.predicted_ph())
    }

    async fn classification(&self, record: &SensorRecord) -> StageOutcome {
        let stage = Stage::Classification;
        match self.guard.is_processed(stage, &record.id).await {
            Ok(true) => return StageOutcome::Skipped,
            Ok(false) => {}
            Err(e) => return failed(record, stage, &e.into()),
        }

        let decision = match record
            .sample()
            .map_err(StageError::from)
            .and_then(|sample| Ok(engines::classify(self.models(), &sample)?))
        {
            Ok(d) => d,
            Err(e) => return failed(record, stage, &e),
        };
        self.persist(record, StageResult::Classification(decision)).await
    }

    async fn regression(&self, record: &SensorRecord) -> StageOutcome {
        let stage = Stage::Regression;
        match self.guard.is_processed(stage, &record.id).await {
            Ok(true) => return StageOutcome::Skipped,
            Ok(false) => {}
            Err(e) => return failed(record, stage, &e.into()),
        }

        let decision = match self.regression_decision(record) {
            Ok(d) => d,
            Err(e) => return failed(record, stage, &e),
        };
        self.persist(record, StageResult::Regression(decision)).await
    }

    fn regression_decision(&self, record: &SensorRecord) -> Result<RegressionDecision, StageError> {
        let sample = record.sample()?;
        let normal = engines::predict_normal(self.models(), &sample)?;
        let advance = match record.flows() {
            Some(flows) => Some(engines::predict_advance(self.models(), &sample, &flows)?),
            None => None,
        };
        Ok(RegressionDecision { normal, advance })
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    async fn persist(&self, record: &SensorRecord, result: StageResult) -> StageOutcome {
        let stage = result.stage();
        let prediction = StagePrediction {
            sensor_record_id: record.id.clone(),
            sensor_created_at: record.created_at,
            raw_inputs: raw_inputs(&result),
            result,
            predicted_at: Utc::now(),
        };

        match self.guard.commit(prediction).await {
            Ok(InsertOutcome::Inserted) => {
                debug!(sensor_record_id = %record.id, stage = %stage, "Stage prediction stored");
                StageOutcome::Inserted
            }
            Ok(InsertOutcome::AlreadyExists) => {
                debug!(sensor_record_id = %record.id, stage = %stage, "Concurrent writer stored first");
                StageOutcome::AlreadyExists
            }
            Err(e) => failed(record, stage, &e.into()),
        }
    }
}

fn failed(record: &SensorRecord, stage: Stage, err: &StageError) -> StageOutcome {
    warn!(sensor_record_id = %record.id, stage = %stage, error = %err, "Stage failed");
    StageOutcome::Failed(err.to_string())
}

/// Feature snapshot the engines were given, keyed by model feature name.
fn raw_inputs(result: &StageResult) -> BTreeMap<String, f64> {
    fn collect(into: &mut BTreeMap<String, f64>, attribution: &Attribution) {
        for (name, value) in attribution.feature_names.iter().zip(&attribution.feature_values) {
            into.insert(name.clone(), *value);
        }
    }

    let mut inputs = BTreeMap::new();
    match result {
        StageResult::PreLime(d) | StageResult::PostLime(d) => {
            collect(&mut inputs, &d.decision.attribution);
        }
        StageResult::Classification(d) => collect(&mut inputs, &d.decision.attribution),
        StageResult::Regression(d) => {
            collect(&mut inputs, &d.normal.decision.attribution);
            if let Some(advance) = &d.advance {
                collect(&mut inputs, &advance.attribution);
            }
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::ModelRegistry;
    use crate::pipeline::PipelineSettings;
    use crate::storage::{InMemoryStore, PersistentStore, StoreError};
    use crate::types::{HistoryQuery, ManualKind, ManualPrediction};
    use std::sync::Arc;

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(
            ModelRegistry::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("models"))
                .unwrap(),
        )
    }

    fn orchestrator(store: Arc<InMemoryStore>, settings: PipelineSettings) -> StageOrchestrator {
        StageOrchestrator::new(PipelineContext::new(store, registry(), settings))
    }

    /// Refuses every Pre-Lime insert; everything else goes to memory.
    struct PreLimeWritesFail(InMemoryStore);

    impl PersistentStore for PreLimeWritesFail {
        fn insert_sensor_record(&self, record: &SensorRecord) -> Result<(), StoreError> {
            self.0.insert_sensor_record(record)
        }
        fn recent_sensor_records(
            &self,
            limit: usize,
            newer_than: Option<DateTime<Utc>>,
        ) -> Result<Vec<SensorRecord>, StoreError> {
            self.0.recent_sensor_records(limit, newer_than)
        }
        fn prediction_exists(&self, stage: Stage, id: &str) -> Result<bool, StoreError> {
            self.0.prediction_exists(stage, id)
        }
        fn insert_prediction(&self, p: &StagePrediction) -> Result<InsertOutcome, StoreError> {
            if p.stage() == Stage::PreLime {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.0.insert_prediction(p)
        }
        fn get_prediction(&self, stage: Stage, id: &str) -> Result<Option<StagePrediction>, StoreError> {
            self.0.get_prediction(stage, id)
        }
        fn prediction_history(
            &self,
            stage: Stage,
            query: &HistoryQuery,
        ) -> Result<Vec<StagePrediction>, StoreError> {
            self.0.prediction_history(stage, query)
        }
        fn insert_manual_prediction(&self, p: &ManualPrediction) -> Result<(), StoreError> {
            self.0.insert_manual_prediction(p)
        }
        fn manual_history(
            &self,
            kind: ManualKind,
            query: &HistoryQuery,
        ) -> Result<Vec<ManualPrediction>, StoreError> {
            self.0.manual_history(kind, query)
        }
        fn load_watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.0.load_watermark()
        }
        fn save_watermark(&self, watermark: DateTime<Utc>) -> Result<(), StoreError> {
            self.0.save_watermark(watermark)
        }
        fn backend_name(&self) -> &'static str {
            "PreLimeWritesFail"
        }
    }

    fn reading(id: &str) -> SensorRecord {
        SensorRecord::new(id, Utc::now(), 7.0, 12.0, 450.0)
    }

    #[tokio::test]
    async fn test_single_record_produces_four_predictions() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), PipelineSettings::default());

        let report = orch.run(&[reading("r1")]).await;
        assert_eq!(report.inserted(), 4);
        assert_eq!(report.failed(), 0);
        for stage in Stage::ALL {
            assert_eq!(store.prediction_count(stage), 1, "{stage}");
        }

        let rerun = orch.run(&[reading("r1")]).await;
        assert_eq!(rerun.inserted(), 0);
        assert_eq!(rerun.skipped(), 4);
        assert_eq!(rerun.failed(), 0);
    }

    #[tokio::test]
    async fn test_post_lime_chains_settled_ph() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), PipelineSettings::default());
        orch.run(&[reading("r1")]).await;

        let pre = store.get_prediction(Stage::PreLime, "r1").unwrap().unwrap();
        let post = store.get_prediction(Stage::PostLime, "r1").unwrap().unwrap();
        let settled = match pre.result {
            StageResult::PreLime(d) => d.predicted_ph(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(post.raw_inputs["raw_water_ph"], settled);
        assert_eq!(pre.raw_inputs["raw_water_ph"], 7.0);
    }

    #[tokio::test]
    async fn test_post_lime_recomputes_when_pre_lime_skipped() {
        for mode in [PostLimeInput::Recompute, PostLimeInput::Persisted] {
            let store = Arc::new(InMemoryStore::new());
            let orch = orchestrator(store.clone(), PipelineSettings::default());
            let record = reading("r1");

            // Pre-Lime already stored by an earlier cycle, Post-Lime missing
            let (_, pre) = orch.pre_lime(&record).await;
            assert!(pre.is_some());

            let settings = PipelineSettings {
                post_lime_input: mode,
                ..PipelineSettings::default()
            };
            let orch = orchestrator(store.clone(), settings);
            let report = orch.process_record(&record).await;
            assert_eq!(report.outcome(Stage::PreLime), Some(&StageOutcome::Skipped));
            assert_eq!(report.outcome(Stage::PostLime), Some(&StageOutcome::Inserted));
        }
    }

    #[tokio::test]
    async fn test_invalid_reading_fails_every_stage_without_aborting_others() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), PipelineSettings::default());
        let bad = SensorRecord::new("bad", Utc::now(), 15.0, 12.0, 450.0);

        let report = orch.run(&[bad, reading("good")]).await;
        assert_eq!(report.failed(), 4);
        assert_eq!(report.inserted(), 4);
        assert!(store.get_prediction(Stage::Classification, "good").unwrap().is_some());
        assert!(store.get_prediction(Stage::Classification, "bad").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pre_lime_failure_is_dependency_failure_for_post_lime() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store, PipelineSettings::default());
        let bad = SensorRecord::new("bad", Utc::now(), -1.0, 12.0, 450.0);

        let report = orch.process_record(&bad).await;
        match report.outcome(Stage::PostLime) {
            Some(StageOutcome::Failed(reason)) => assert!(reason.contains("depends on PreLime")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pre_lime_store_failure_still_feeds_post_lime() {
        let store = Arc::new(PreLimeWritesFail(InMemoryStore::new()));
        let ctx = PipelineContext::new(store.clone(), registry(), PipelineSettings::default());
        let record = reading("r1");

        let report = StageOrchestrator::new(ctx).process_record(&record).await;
        match report.outcome(Stage::PreLime) {
            Some(StageOutcome::Failed(reason)) => assert!(reason.contains("disk full")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(report.outcome(Stage::PostLime), Some(&StageOutcome::Inserted));

        let expected = PRE_LIME
            .recommend(registry().as_ref(), &record.sample().unwrap())
            .unwrap()
            .predicted_ph();
        let post = store.get_prediction(Stage::PostLime, "r1").unwrap().unwrap();
        assert_eq!(post.raw_inputs["raw_water_ph"], expected);
    }

    #[tokio::test]
    async fn test_run_future_is_spawnable() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), PipelineSettings::default());
        let records: Vec<_> = (0..3).map(|i| reading(&format!("r{i}"))).collect();

        let report = tokio::spawn(async move { orch.run(&records).await }).await.unwrap();
        assert_eq!(report.inserted(), 12);
    }

    #[tokio::test]
    async fn test_advance_regression_runs_only_with_flows() {
        let store = Arc::new(InMemoryStore::new());
        let orch = orchestrator(store.clone(), PipelineSettings::default());
        let mut with_flows = reading("flows");
        with_flows.raw_water_flow = Some(1200.0);
        with_flows.d_chamber_flow = Some(600.0);
        with_flows.aerator_flow = Some(300.0);

        orch.run(&[with_flows, reading("plain")]).await;

        let get = |id: &str| match store.get_prediction(Stage::Regression, id).unwrap() {
            Some(StagePrediction {
                result: StageResult::Regression(d),
                ..
            }) => d,
            other => panic!("unexpected {other:?}"),
        };
        assert!(get("flows").advance.is_some());
        assert!(get("plain").advance.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_runs_store_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let records: Vec<_> = (0..10).map(|i| reading(&format!("r{i}"))).collect();
        let a = orchestrator(store.clone(), PipelineSettings::default());
        let b = orchestrator(store.clone(), PipelineSettings::default());

        let (ra, rb) = tokio::join!(a.run(&records), b.run(&records));
        assert_eq!(ra.inserted() + rb.inserted(), 40);
        assert_eq!(ra.failed() + rb.failed(), 0);
        for stage in Stage::ALL {
            assert_eq!(store.prediction_count(stage), 10);
        }
    }

    #[test]
    fn test_report_counts() {
        let mut report = CycleReport::new(1);
        report.absorb(&RecordReport {
            sensor_record_id: "r".into(),
            outcomes: vec![
                (Stage::PreLime, StageOutcome::Inserted),
                (Stage::PostLime, StageOutcome::AlreadyExists),
                (Stage::Classification, StageOutcome::Skipped),
                (Stage::Regression, StageOutcome::Failed("x".into())),
            ],
        });
        assert_eq!(report.inserted(), 1);
        assert_eq!(report.already_exists(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.counts(Stage::Regression).failed, 1);
    }
}
