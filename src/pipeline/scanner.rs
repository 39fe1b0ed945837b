//! Ingestion window scanner: a full re-scan of the newest readings each cycle.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{IdempotencyGuard, PipelineContext};
use crate::storage::StoreError;
use crate::types::SensorRecord;

pub struct WindowScanner {
    guard: IdempotencyGuard,
    limit: usize,
    use_watermark: bool,
}

impl WindowScanner {
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            guard: IdempotencyGuard::new(ctx.store.clone(), ctx.settings.store_timeout),
            limit: ctx.settings.window_limit,
            use_watermark: ctx.settings.use_watermark,
        }
    }

    /// Newest `limit` readings, `created_at` descending.
    ///
    /// With the watermark enabled, only readings newer than the stored
    /// watermark are returned.
    pub async fn fetch_recent(&self) -> Result<Vec<SensorRecord>, StoreError> {
        let newer_than = self.watermark().await?;
        let limit = self.limit;
        let records = self
            .guard
            .call(move |store| store.recent_sensor_records(limit, newer_than))
            .await?;
        debug!(count = records.len(), limit, watermark = ?newer_than, "Scanned sensor window");
        Ok(records)
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        if !self.use_watermark {
            return Ok(None);
        }
        self.guard.call(|store| store.load_watermark()).await
    }

    /// Persist the newest `created_at` of a failure-free cycle.
    pub async fn advance_watermark(&self, newest: DateTime<Utc>) -> Result<(), StoreError> {
        self.guard.call(move |store| store.save_watermark(newest)).await
    }

    pub const fn uses_watermark(&self) -> bool {
        self.use_watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_service::ModelRegistry;
    use crate::pipeline::PipelineSettings;
    use crate::storage::test_support::reading;
    use crate::storage::{InMemoryStore, PersistentStore};
    use std::sync::Arc;

    fn context(store: Arc<InMemoryStore>, limit: usize, use_watermark: bool) -> PipelineContext {
        let models =
            ModelRegistry::load(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("models"))
                .unwrap();
        PipelineContext::new(
            store,
            Arc::new(models),
            PipelineSettings {
                window_limit: limit,
                use_watermark,
                ..PipelineSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_descending() {
        let store = Arc::new(InMemoryStore::new());
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            store.insert_sensor_record(&reading(id, 10 - i as i64)).unwrap();
        }
        let scanner = WindowScanner::new(&context(store, 3, false));
        let ids: Vec<_> = scanner
            .fetch_recent()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["d", "c", "b"]);
    }

    #[tokio::test]
    async fn test_watermark_ignored_unless_enabled() {
        let store = Arc::new(InMemoryStore::new());
        let old = reading("old", 30);
        store.insert_sensor_record(&old).unwrap();
        store.save_watermark(Utc::now()).unwrap();

        let scanner = WindowScanner::new(&context(store.clone(), 10, false));
        assert_eq!(scanner.fetch_recent().await.unwrap().len(), 1);

        let scanner = WindowScanner::new(&context(store, 10, true));
        assert!(scanner.fetch_recent().await.unwrap().is_empty());
    }
}
