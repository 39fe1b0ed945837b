//! Sensor Backfill Pipeline
//!
//! ```text
//! BackfillScheduler (one cycle at a time, sleep after each)
//!   └─ WindowScanner        newest N sensor readings (optionally > watermark)
//!   └─ StageOrchestrator    per record, bounded worker pool
//!        ├─ Pre-Lime  ──►  Post-Lime   (settled pH chained in-process)
//!        ├─ Classification
//!        └─ Regression (Normal, + Advance when flows exist)
//!   each stage: guard check → engine → unique insert
//! ```
//!
//! The uniqueness constraint in the store is the only idempotency
//! mechanism. The pre-insert existence check just avoids recomputing
//! stages that are already done.

mod context;
mod guard;
mod orchestrator;
mod scanner;
mod scheduler;

pub use context::{PipelineContext, PipelineSettings};
pub use guard::IdempotencyGuard;
pub use orchestrator::{CycleReport, RecordReport, StageCounts, StageOrchestrator, StageOutcome};
pub use scanner::WindowScanner;
pub use scheduler::BackfillScheduler;

use crate::engines::EngineError;
use crate::storage::StoreError;
use crate::types::{Stage, ValidationError};

/// Why a single stage failed for a single record.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("invalid sensor reading: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("depends on {stage}, which failed: {reason}")]
    Dependency { stage: Stage, reason: String },
}
