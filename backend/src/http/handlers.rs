//! HTTP handlers for the REST API.
//!
//! Handlers parse the request, pick the tenant and hand off to the
//! repository, which runs each operation in its own transaction.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::dto::{HealthResponse, SyncMeta, SyncRequest, SyncResponse};
use super::error::AppError;
use super::state::{AppState, Tenant};
use crate::models::{AnalysisId, Parameter, ParameterId, RangeId, RawRange, UnifiedRange};

/// Result type for handlers.
pub type HandlerResult<T> = Result<Json<T>, AppError>;

fn raw_range(body: Result<Json<Value>, JsonRejection>) -> Result<RawRange, AppError> {
    let Json(value) = body?;
    if !value.is_object() {
        return Err(AppError::BadRequest(
            "reference range body must be a JSON object".to_string(),
        ));
    }
    Ok(RawRange(value))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> HandlerResult<HealthResponse> {
    let started = Instant::now();
    let probe = state.repository.health_check().await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let database = match probe {
        Ok(true) => "connected".to_string(),
        Ok(false) => "disconnected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        latency_ms,
        pool: state.repository.pool_stats(),
    }))
}

/// GET /api/analysis/{id}/parameters
pub async fn list_parameters(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(analysis_id): Path<i64>,
) -> HandlerResult<Vec<Parameter>> {
    let parameters = state
        .repository
        .list_parameters(&tenant, AnalysisId::new(analysis_id))
        .await?;
    Ok(Json(parameters))
}

/// POST /api/analysis/{id}/parameters-sync
pub async fn sync_parameters(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(analysis_id): Path<i64>,
    body: Result<Json<SyncRequest>, JsonRejection>,
) -> HandlerResult<SyncResponse> {
    let Json(request) = body?;
    let request_id = Uuid::new_v4().to_string();
    let specs = request
        .parameters
        .into_iter()
        .enumerate()
        .map(|(index, input)| input.into_spec(index))
        .collect::<Vec<_>>();

    debug!(
        request_id = %request_id,
        tenant = %tenant,
        analysis_id,
        parameters = specs.len(),
        "parameter sync requested"
    );

    let outcome = state
        .repository
        .sync_parameters(&tenant, AnalysisId::new(analysis_id), specs)
        .await?;

    info!(
        request_id = %request_id,
        analysis_id,
        inserted_ranges = outcome.inserted_ranges,
        "parameter sync committed"
    );

    Ok(Json(SyncResponse {
        parameters: outcome.parameters,
        meta: SyncMeta {
            request_id,
            inserted_ranges: outcome.inserted_ranges,
        },
    }))
}

/// GET /api/analysis/parameters/{param_id}/reference-ranges
pub async fn list_reference_ranges(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(param_id): Path<i64>,
) -> HandlerResult<Vec<UnifiedRange>> {
    let ranges = state
        .repository
        .list_reference_ranges(&tenant, ParameterId::new(param_id))
        .await?;
    Ok(Json(ranges))
}

/// POST /api/analysis/parameters/{param_id}/reference-ranges
pub async fn create_reference_range(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(param_id): Path<i64>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<UnifiedRange>), AppError> {
    let raw = raw_range(body)?;
    let range = state
        .repository
        .insert_reference_range(&tenant, ParameterId::new(param_id), raw)
        .await?;
    Ok((StatusCode::CREATED, Json(range)))
}

/// PUT /api/analysis/reference-ranges/{range_id}
pub async fn update_reference_range(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(range_id): Path<i64>,
    body: Result<Json<Value>, JsonRejection>,
) -> HandlerResult<UnifiedRange> {
    let raw = raw_range(body)?;
    let range = state
        .repository
        .update_reference_range(&tenant, RangeId::new(range_id), raw)
        .await?;
    Ok(Json(range))
}

/// DELETE /api/analysis/reference-ranges/{range_id}
pub async fn delete_reference_range(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(range_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state
        .repository
        .delete_reference_range(&tenant, RangeId::new(range_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
