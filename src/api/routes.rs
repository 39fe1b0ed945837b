//! API route definitions
//!
//! - /health - liveness and store backend
//! - /api/v1/sensor/:stage - persisted backfill predictions per stage
//! - /api/v1/history/:kind - stored manual predictions per endpoint
//! - /api/v1/{pre-lime,post-lime,classify,normal-regression,advance-regression}/predict

use axum::{routing::{get, post}, Router};

use super::handlers;
use crate::pipeline::PipelineContext;

/// Versioned API routes, nested under `/api/v1`.
pub fn api_routes(ctx: PipelineContext) -> Router {
    Router::new()
        .route("/sensor/:stage", get(handlers::get_stage_history))
        .route("/history/:kind", get(handlers::get_manual_history))
        .route("/pre-lime/predict", post(handlers::predict_pre_lime))
        .route("/post-lime/predict", post(handlers::predict_post_lime))
        .route("/classify/predict", post(handlers::predict_classification))
        .route("/normal-regression/predict", post(handlers::predict_normal_regression))
        .route("/advance-regression/predict", post(handlers::predict_advance_regression))
        .with_state(ctx)
}

/// Health endpoint at root level
pub fn health_routes(ctx: PipelineContext) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .with_state(ctx)
}
