//! Clearwell: Water Treatment Decision Support
//!
//! Sensor backfill pipeline that turns raw-water readings into persisted
//! dosing and classification decisions.
//!
//! ## Architecture
//!
//! - **Model Service**: JSON model artifacts loaded once at startup
//! - **Decision Engines**: Pre-Lime / Post-Lime dose optimizers, water
//!   classification, coagulant regression
//! - **Storage**: sled-backed sensor readings and per-stage predictions
//! - **Pipeline**: window scanner, stage orchestrator and fixed-delay scheduler
//! - **API**: prediction history and manual prediction endpoints
//! - **Ingest**: JSON-lines loader standing in for the plant's sensor feed

pub mod api;
pub mod config;
pub mod engines;
pub mod ingest;
pub mod model_service;
pub mod pipeline;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::ClearwellConfig;

// Re-export commonly used types
pub use types::{
    DecisionResult, SensorRecord, Stage, StagePrediction, StageResult, ValidationError,
    WaterSample, WaterStatus,
};

// Re-export pipeline entry points
pub use pipeline::{BackfillScheduler, CycleReport, PipelineContext, PipelineSettings};

// Re-export storage
pub use storage::{InMemoryStore, PersistentStore, SledStore, StoreError};

// Re-export model service
pub use model_service::{ModelRegistry, ModelService};
