//! Backfill Scheduler
//!
//! Runs scan → orchestrate → watermark on a fixed delay. The sleep starts
//! only after a cycle has finished, so a slow cycle pushes the next one
//! back instead of overlapping it. Errors and panics escaping a cycle are
//! logged and the loop continues; only the cancellation token stops it.

use anyhow::{Context, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CycleReport, PipelineContext, StageOrchestrator, WindowScanner};

pub struct BackfillScheduler {
    name: &'static str,
    interval: Duration,
    scanner: WindowScanner,
    orchestrator: StageOrchestrator,
}

impl BackfillScheduler {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            name: "sensor-backfill",
            interval: ctx.settings.interval,
            scanner: WindowScanner::new(&ctx),
            orchestrator: StageOrchestrator::new(ctx),
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// One full backfill cycle.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let records = self
            .scanner
            .fetch_recent()
            .await
            .context("Failed to scan sensor window")?;

        let mut report = self.orchestrator.run(&records).await;

        if self.scanner.uses_watermark() {
            match report.newest_created_at {
                Some(newest) if report.failed() == 0 => {
                    self.scanner
                        .advance_watermark(newest)
                        .await
                        .context("Failed to persist watermark")?;
                    report.watermark = Some(newest);
                }
                Some(_) => {
                    debug!(failed = report.failed(), "Watermark held back by stage failures");
                }
                None => {}
            }
        }

        Ok(report)
    }

    /// Loop until `cancel_token` is tripped.
    pub async fn run(self, cancel_token: CancellationToken) {
        info!(
            task = self.name,
            interval_secs = self.interval.as_secs_f64(),
            "[BackfillScheduler] Task starting"
        );
        let mut cycles = 0u64;

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            cycles += 1;
            match AssertUnwindSafe(self.run_once()).catch_unwind().await {
                Ok(Ok(report)) => log_report(cycles, &report),
                Ok(Err(e)) => {
                    error!(task = self.name, cycle = cycles, error = %format!("{e:#}"), "[BackfillScheduler] Cycle failed");
                }
                Err(panic) => {
                    error!(task = self.name, cycle = cycles, panic = %panic_message(panic.as_ref()), "[BackfillScheduler] Cycle panicked");
                }
            }

            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(task = self.name, "[BackfillScheduler] Received shutdown signal after {} cycles", cycles);
    }
}

fn log_report(cycle: u64, report: &CycleReport) {
    if report.failed() > 0 {
        warn!(
            cycle,
            scanned = report.records_scanned,
            inserted = report.inserted(),
            skipped = report.skipped(),
            already_exists = report.already_exists(),
            failed = report.failed(),
            duration_ms = report.duration_ms,
            "[BackfillScheduler] Cycle finished with failures"
        );
    } else if report.inserted() > 0 {
        info!(
            cycle,
            scanned = report.records_scanned,
            inserted = report.inserted(),
            skipped = report.skipped(),
            duration_ms = report.duration_ms,
            "[BackfillScheduler] Cycle complete"
        );
    } else {
        debug!(cycle, scanned = report.records_scanned, "[BackfillScheduler] Nothing new");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::{Calibration, ModelError, ModelId, ModelOutput, ModelRegistry, ModelService};
    use crate::pipeline::PipelineSettings;
    use crate::storage::{InMemoryStore, PersistentStore};
    use crate::types::{SensorRecord, Stage};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> ModelRegistry {
        ModelRegistry::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("models"))
            .unwrap()
    }

    fn settings(use_watermark: bool) -> PipelineSettings {
        PipelineSettings {
            interval: Duration::from_millis(10),
            use_watermark,
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_watermark_advances_on_clean_cycle() {
        let store = Arc::new(InMemoryStore::new());
        let record = SensorRecord::new("r1", Utc::now() - ChronoDuration::minutes(1), 7.0, 12.0, 450.0);
        store.insert_sensor_record(&record).unwrap();

        let scheduler = BackfillScheduler::new(PipelineContext::new(
            store.clone(),
            Arc::new(registry()),
            settings(true),
        ));
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.inserted(), 4);
        assert_eq!(report.watermark, Some(record.created_at));
        assert_eq!(store.load_watermark().unwrap(), Some(record.created_at));

        // Next cycle sees nothing new
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.records_scanned, 0);
    }

    #[tokio::test]
    async fn test_watermark_held_back_by_failures() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_sensor_record(&SensorRecord::new("bad", Utc::now(), 20.0, 1.0, 1.0))
            .unwrap();

        let scheduler = BackfillScheduler::new(PipelineContext::new(
            store.clone(),
            Arc::new(registry()),
            settings(true),
        ));
        let report = scheduler.run_once().await.unwrap();
        assert!(report.failed() > 0);
        assert_eq!(report.watermark, None);
        assert_eq!(store.load_watermark().unwrap(), None);
    }

    /// Panics on its first predict call, then delegates.
    struct PanicOnce {
        inner: ModelRegistry,
        calls: AtomicUsize,
    }

    impl ModelService for PanicOnce {
        fn feature_order(&self, model: ModelId) -> Result<Vec<String>, ModelError> {
            self.inner.feature_order(model)
        }

        fn predict(&self, model: ModelId, features: &[f64]) -> Result<ModelOutput, ModelError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("model blew up");
            }
            self.inner.predict(model, features)
        }

        fn calibration(&self, model: ModelId) -> Result<Calibration, ModelError> {
            self.inner.calibration(model)
        }

        fn threshold(&self, model: ModelId) -> Result<f64, ModelError> {
            self.inner.threshold(model)
        }
    }

    #[tokio::test]
    async fn test_loop_survives_panic_and_stops_on_cancel() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_sensor_record(&SensorRecord::new("r1", Utc::now(), 7.0, 12.0, 450.0))
            .unwrap();
        let models = PanicOnce {
            inner: registry(),
            calls: AtomicUsize::new(0),
        };
        let scheduler = BackfillScheduler::new(PipelineContext::new(
            store.clone(),
            Arc::new(models),
            settings(false),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(cancel.clone()));

        // Later cycles complete the work the panicking one abandoned
        let mut done = false;
        for _ in 0..200 {
            if Stage::ALL.iter().all(|s| store.prediction_count(*s) == 1) {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(done, "scheduler did not recover after a panicking cycle");
    }
}
