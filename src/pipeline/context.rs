//! Explicitly constructed pipeline dependencies.

use std::sync::Arc;
use std::time::Duration;

use super::IdempotencyGuard;
use crate::config::{ClearwellConfig, PostLimeInput};
use crate::model_service::ModelService;
use crate::storage::PersistentStore;

/// Runtime knobs the pipeline reads, resolved from `ClearwellConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub interval: Duration,
    pub window_limit: usize,
    pub max_concurrent_records: usize,
    pub store_timeout: Duration,
    pub post_lime_input: PostLimeInput,
    pub use_watermark: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&ClearwellConfig::default())
    }
}

impl From<&ClearwellConfig> for PipelineSettings {
    fn from(config: &ClearwellConfig) -> Self {
        Self {
            interval: config.scheduler.interval(),
            window_limit: config.scanner.window_limit,
            max_concurrent_records: config.pipeline.max_concurrent_records.max(1),
            store_timeout: config.pipeline.store_timeout(),
            post_lime_input: config.pipeline.post_lime_input,
            use_watermark: config.pipeline.use_watermark,
        }
    }
}

/// Store, models and settings shared by the scheduler, orchestrator and API.
///
/// Cheap to clone: both handles are `Arc`s.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn PersistentStore>,
    pub models: Arc<dyn ModelService>,
    pub settings: PipelineSettings,
}

impl PipelineContext {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        models: Arc<dyn ModelService>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            models,
            settings,
        }
    }

    /// Store access bounded by `settings.store_timeout`.
    pub fn guard(&self) -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::clone(&self.store), self.settings.store_timeout)
    }
}
