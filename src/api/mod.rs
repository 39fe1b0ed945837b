//! REST API module using Axum
//!
//! Read-only access to the persisted backfill predictions plus manual
//! prediction endpoints that run the decision engines on request payloads.
//! All responses use the `{data, meta}` / `{error, meta}` envelope.

pub mod envelope;
pub mod handlers;
mod routes;

use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pipeline::PipelineContext;

/// Comma-separated list of allowed cross-origin callers.
pub const CORS_ENV_VAR: &str = "CLEARWELL_CORS_ORIGINS";

/// Build a CORS layer that is restrictive by default (same-origin only).
///
/// Set `CLEARWELL_CORS_ORIGINS` to a comma-separated list of allowed origins
/// for a dashboard served from another host.
fn build_cors_layer() -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    match std::env::var(CORS_ENV_VAR) {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            base.allow_origin(allowed)
        }
        Err(_) => base,
    }
}

/// Create the complete application router.
pub fn create_app(ctx: PipelineContext) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes(ctx.clone()))
        .merge(routes::health_routes(ctx))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
