//! Shared data structures for the water-treatment decision pipeline
//!
//! - `sensor`: SensorRecord (raw readings) and the validated WaterSample
//! - `decision`: engine outputs (DecisionResult, DoseDecision, ...)
//! - `prediction`: Stage, StagePrediction and history queries
//! - `manual`: API-requested predictions, one document per request

mod sensor;
mod decision;
mod prediction;
mod manual;

pub use sensor::*;
pub use decision::*;
pub use prediction::*;
pub use manual::*;
