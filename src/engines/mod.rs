//! Decision Engines
//!
//! Pure functions over a validated `WaterSample` plus the model service:
//! - `dose_optimizer`: Pre-Lime / Post-Lime safe-band dose search
//! - `classification`: NORMAL / ABNORMAL water safety with routing hint
//! - `regression`: coagulant dose search (Normal) and alum dosage (Advance)
//! - `explain`: interval and attribution rendering shared by all engines

pub mod classification;
pub mod dose_optimizer;
pub mod explain;
pub mod regression;

pub use classification::{classify, decide_status};
pub use dose_optimizer::{select_dose, DoseOptimizer, DoseResponse, POST_LIME, PRE_LIME};
pub use regression::{predict_advance, predict_normal, select_lowest_turbidity};

use crate::model_service::ModelError;
use crate::types::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("no candidate doses configured")]
    NoCandidates,
}
