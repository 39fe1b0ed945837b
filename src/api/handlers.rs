//! HTTP handlers: health, backfill and manual history, manual predictions.
//!
//! Manual predictions run the same engines as the backfill on a request
//! payload. Each call is stored as its own document in the manual
//! collection for its endpoint; the new id is returned as `meta.recordId`.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::envelope::{ApiError, ApiResponse, ResponseMeta};
use crate::config::defaults;
use crate::engines::{self, POST_LIME, PRE_LIME};
use crate::pipeline::PipelineContext;
use crate::types::{
    ClassificationDecision, DecisionResult, DoseDecision, HistoryQuery, ManualKind,
    ManualPrediction, ManualResult, NormalRegressionDecision, PlantFlows, Stage, StagePrediction,
    ValidationError, WaterSample,
};

type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub version: &'static str,
}

/// GET /health
pub async fn get_health(State(ctx): State<PipelineContext>) -> ApiResponse<HealthResponse> {
    ApiResponse::ok(HealthResponse {
        status: "ok",
        store: ctx.store.backend_name(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// History
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<String>,
}

/// GET /api/v1/sensor/:stage
pub async fn get_stage_history(
    State(ctx): State<PipelineContext>,
    Path(slug): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<StagePrediction>> {
    let stage = Stage::from_slug(&slug)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown stage '{slug}'")))?;
    let query = history_query(&params, defaults::HISTORY_DEFAULT_LIMIT)?;

    let rows = ctx
        .guard()
        .call(move |store| store.prediction_history(stage, &query))
        .await?;
    debug!(%stage, count = rows.len(), "History served");
    Ok(ApiResponse::listing(stage.collection(), rows))
}

/// GET /api/v1/history/:kind
pub async fn get_manual_history(
    State(ctx): State<PipelineContext>,
    Path(slug): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<ManualPrediction>> {
    let kind = ManualKind::from_slug(&slug)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown prediction type '{slug}'")))?;
    let query = history_query(&params, defaults::MANUAL_HISTORY_DEFAULT_LIMIT)?;

    let rows = ctx
        .guard()
        .call(move |store| store.manual_history(kind, &query))
        .await?;
    debug!(%kind, count = rows.len(), "Manual history served");
    Ok(ApiResponse::listing(kind.collection(), rows))
}

fn history_query(params: &HistoryParams, default_limit: usize) -> Result<HistoryQuery, ApiError> {
    let limit = match params.limit.as_deref() {
        None => default_limit,
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| ApiError::BadQuery("limit must be a non-negative integer".to_string()))?
            .min(defaults::HISTORY_MAX_LIMIT),
    };
    let start = params
        .start_date
        .as_deref()
        .map(|s| parse_date(s, DayBound::Start))
        .transpose()?;
    let end = params
        .end_date
        .as_deref()
        .map(|s| parse_date(s, DayBound::End))
        .transpose()?;
    let query = HistoryQuery { start, end, limit };
    if query.is_inverted() {
        return Err(ApiError::BadQuery(
            "start_date must not be after end_date".to_string(),
        ));
    }
    Ok(query)
}

#[derive(Clone, Copy)]
enum DayBound {
    Start,
    End,
}

/// RFC 3339 timestamp, or `YYYY-MM-DD` covering the whole day.
fn parse_date(raw: &str, bound: DayBound) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ApiError::BadQuery("Date must be in YYYY-MM-DD format".to_string()))?;
    let time = match bound {
        DayBound::Start => NaiveTime::MIN,
        DayBound::End => NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
            .ok_or_else(|| ApiError::BadQuery("Invalid end of day".to_string()))?,
    };
    Ok(date.and_time(time).and_utc())
}

// ============================================================================
// Manual predictions
// ============================================================================

/// POST /api/v1/pre-lime/predict
pub async fn predict_pre_lime(
    State(ctx): State<PipelineContext>,
    Json(body): Json<Value>,
) -> ApiResult<DoseDecision> {
    let payload = raw_payload(&body)?;
    let decision = PRE_LIME.recommend(ctx.models.as_ref(), &payload.sample)?;
    let record_id = save(&ctx, payload.inputs, ManualResult::PreLime(decision.clone())).await?;
    Ok(ApiResponse::with_meta(decision, ResponseMeta::stored(record_id)))
}

/// POST /api/v1/post-lime/predict
///
/// The request's `raw_ph` is used as the post-lime input pH.
pub async fn predict_post_lime(
    State(ctx): State<PipelineContext>,
    Json(body): Json<Value>,
) -> ApiResult<DoseDecision> {
    let payload = raw_payload(&body)?;
    let decision = POST_LIME.recommend(ctx.models.as_ref(), &payload.sample)?;
    let record_id = save(&ctx, payload.inputs, ManualResult::PostLime(decision.clone())).await?;
    Ok(ApiResponse::with_meta(decision, ResponseMeta::stored(record_id)))
}

/// POST /api/v1/classify/predict
pub async fn predict_classification(
    State(ctx): State<PipelineContext>,
    Json(body): Json<Value>,
) -> ApiResult<ClassificationDecision> {
    let payload = quality_payload(&body)?;
    let decision = engines::classify(ctx.models.as_ref(), &payload.sample)?;
    let record_id = save(
        &ctx,
        payload.inputs,
        ManualResult::Classification(decision.clone()),
    )
    .await?;
    Ok(ApiResponse::with_meta(decision, ResponseMeta::stored(record_id)))
}

/// POST /api/v1/normal-regression/predict
pub async fn predict_normal_regression(
    State(ctx): State<PipelineContext>,
    Json(body): Json<Value>,
) -> ApiResult<NormalRegressionDecision> {
    let payload = quality_payload(&body)?;
    let decision = engines::predict_normal(ctx.models.as_ref(), &payload.sample)?;
    let record_id = save(
        &ctx,
        payload.inputs,
        ManualResult::NormalRegression(decision.clone()),
    )
    .await?;
    Ok(ApiResponse::with_meta(decision, ResponseMeta::stored(record_id)))
}

/// POST /api/v1/advance-regression/predict
pub async fn predict_advance_regression(
    State(ctx): State<PipelineContext>,
    Json(body): Json<Value>,
) -> ApiResult<DecisionResult> {
    let mut payload = quality_payload(&body)?;
    require(&body, &FLOW_FIELDS)?;
    let [raw_water, d_chamber, aerator] = FLOW_FIELDS.map(|name| numeric(&body, name));
    let flows = PlantFlows {
        raw_water_flow: raw_water?,
        d_chamber_flow: d_chamber?,
        aerator_flow: aerator?,
    };
    payload.inputs.extend([
        (FLOW_FIELDS[0].to_string(), flows.raw_water_flow),
        (FLOW_FIELDS[1].to_string(), flows.d_chamber_flow),
        (FLOW_FIELDS[2].to_string(), flows.aerator_flow),
    ]);

    let decision = engines::predict_advance(ctx.models.as_ref(), &payload.sample, &flows)?;
    let record_id = save(
        &ctx,
        payload.inputs,
        ManualResult::AdvanceRegression(decision.clone()),
    )
    .await?;
    Ok(ApiResponse::with_meta(decision, ResponseMeta::stored(record_id)))
}

/// Append the request to its manual collection; returns the new record id.
async fn save(
    ctx: &PipelineContext,
    inputs: BTreeMap<String, f64>,
    result: ManualResult,
) -> Result<String, ApiError> {
    let prediction = ManualPrediction::new(inputs, result, Utc::now());
    let record_id = prediction.record_id.clone();
    let kind = prediction.kind();
    ctx.guard()
        .call(move |store| store.insert_manual_prediction(&prediction))
        .await?;
    debug!(%kind, record_id = %record_id, "Manual prediction stored");
    Ok(record_id)
}

// ============================================================================
// Payload validation
// ============================================================================

const FLOW_FIELDS: [&str; 3] = ["raw_water_flow", "d_chamber_flow", "aerator_flow"];

/// Validated sample plus the request fields it came from.
#[derive(Debug)]
struct Payload {
    sample: WaterSample,
    inputs: BTreeMap<String, f64>,
}

/// `raw_ph`, `raw_turbidity`, `raw_conductivity` (lime dosing forms).
fn raw_payload(body: &Value) -> Result<Payload, ValidationError> {
    payload_from(body, ["raw_ph", "raw_turbidity", "raw_conductivity"])
}

/// `ph`, `turbidity`, `conductivity` (classification and regression forms).
fn quality_payload(body: &Value) -> Result<Payload, ValidationError> {
    payload_from(body, ["ph", "turbidity", "conductivity"])
}

fn payload_from(body: &Value, names: [&str; 3]) -> Result<Payload, ValidationError> {
    require(body, &names)?;
    let [ph, turbidity, conductivity] = names.map(|name| numeric(body, name));
    let values = [ph?, turbidity?, conductivity?];
    let sample = WaterSample::new(values[0], values[1], values[2])?;
    let inputs = names
        .iter()
        .zip(values)
        .map(|(name, value)| ((*name).to_string(), value))
        .collect();
    Ok(Payload { sample, inputs })
}

/// A non-object body is missing every field.
fn require(body: &Value, names: &[&str]) -> Result<(), ValidationError> {
    let missing: Vec<&str> = names
        .iter()
        .copied()
        .filter(|n| body.get(n).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingFields(missing.join(", ")))
    }
}

/// JSON number or numeric string.
fn numeric(body: &Value, name: &str) -> Result<f64, ValidationError> {
    let value = match body.get(name) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.ok_or_else(|| ValidationError::NotNumeric(name.to_string()))
}
