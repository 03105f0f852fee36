//! # Downtime API Handlers
//!
//! Report, resolve and inspect webhook downtime, and register health-monitor
//! targets.

use axum::{
    extract::{Path, Query, State, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserId};
use crate::downtime::{DetectRequest, DowntimeCause, DowntimeFilter, DowntimeRecord, WatchTarget};
use crate::error::{ApiError, validation_error};
use crate::handlers::{api_error, parse_limit, parse_timestamp, require_identifier};
use crate::server::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 100;

/// Request body for reporting a downtime
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DetectDowntimeRequest {
    #[schema(example = "wf-123")]
    pub workflow_id: String,
    #[schema(example = "github")]
    pub connector_id: String,
    pub cause: DowntimeCause,
    /// When the outage began; defaults to now
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Override of the configured auto-backfill flag
    #[serde(default)]
    pub auto_backfill: Option<bool>,
}

/// Request body for registering a health-monitor target
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WatchRequest {
    pub workflow_id: String,
    pub connector_id: String,
    /// Absolute URL probed by the monitor
    #[schema(example = "https://hooks.example.com/health")]
    pub health_url: String,
}

/// Query parameters for listing downtime records
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListDowntimeQuery {
    pub workflow_id: Option<String>,
    pub connector_id: Option<String>,
    /// Only records that are still open
    #[serde(default)]
    pub open: bool,
    /// RFC3339 lower bound (inclusive) on the start time
    pub started_after: Option<String>,
    /// RFC3339 upper bound (exclusive) on the start time
    pub started_before: Option<String>,
    /// Maximum number of records to return (default: 50, max: 100)
    pub limit: Option<u32>,
}

/// Response payload for downtime listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DowntimeResponse {
    pub records: Vec<DowntimeRecord>,
}

/// Open a downtime record for a (workflow, connector) pair
#[utoipa::path(
    post,
    path = "/v1/downtime",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader),
    request_body = DetectDowntimeRequest,
    responses(
        (status = 201, description = "Downtime recorded", body = DowntimeRecord),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "downtime"
)]
pub async fn detect_downtime(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserId(user_id): UserId,
    payload: Result<Json<DetectDowntimeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DowntimeRecord>), ApiError> {
    let Json(request) = payload?;
    require_identifier("workflow_id", &request.workflow_id)?;
    require_identifier("connector_id", &request.connector_id)?;

    let record = state
        .detector
        .detect(DetectRequest {
            workflow_id: request.workflow_id.trim().to_string(),
            connector_id: request.connector_id.trim().to_string(),
            cause: request.cause,
            started_at: request.started_at,
            auto_backfill: request.auto_backfill,
            user_id: Some(user_id),
        })
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Close a downtime record and trigger recovery
#[utoipa::path(
    post,
    path = "/v1/downtime/{id}/resolve",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Downtime record ID")),
    responses(
        (status = 200, description = "Record resolved", body = DowntimeRecord),
        (status = 404, description = "Unknown record", body = ApiError),
        (status = 409, description = "Record already resolved", body = ApiError)
    ),
    tag = "downtime"
)]
pub async fn resolve_downtime(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<DowntimeRecord>, ApiError> {
    let record = state
        .detector
        .resolve(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(record))
}

/// List downtime records, most recent start first
#[utoipa::path(
    get,
    path = "/v1/downtime",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ListDowntimeQuery),
    responses(
        (status = 200, description = "Downtime records", body = DowntimeResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError)
    ),
    tag = "downtime"
)]
pub async fn list_downtime(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    params: Result<Query<ListDowntimeQuery>, QueryRejection>,
) -> Result<Json<DowntimeResponse>, ApiError> {
    let Query(params) = params?;
    let filter = DowntimeFilter {
        workflow_id: params.workflow_id,
        connector_id: params.connector_id,
        open_only: params.open,
        started_after: parse_timestamp("started_after", params.started_after.as_deref())?,
        started_before: parse_timestamp("started_before", params.started_before.as_deref())?,
        limit: Some(parse_limit(params.limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT)?),
    };

    let records = state
        .detector
        .list(&filter)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(DowntimeResponse { records }))
}

/// Fetch one downtime record
#[utoipa::path(
    get,
    path = "/v1/downtime/{id}",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Downtime record ID")),
    responses(
        (status = 200, description = "Downtime record", body = DowntimeRecord),
        (status = 404, description = "Unknown record", body = ApiError)
    ),
    tag = "downtime"
)]
pub async fn get_downtime(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<DowntimeRecord>, ApiError> {
    let record = state
        .detector
        .get(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(record))
}

/// Register a pair with the health monitor
#[utoipa::path(
    post,
    path = "/v1/downtime/watch",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader),
    request_body = WatchRequest,
    responses(
        (status = 201, description = "Target registered", body = WatchTarget),
        (status = 400, description = "Invalid request", body = ApiError)
    ),
    tag = "downtime"
)]
pub async fn watch_pair(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserId(user_id): UserId,
    payload: Result<Json<WatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<WatchTarget>), ApiError> {
    let Json(request) = payload?;
    require_identifier("workflow_id", &request.workflow_id)?;
    require_identifier("connector_id", &request.connector_id)?;

    let health_url = url::Url::parse(&request.health_url)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .ok_or_else(|| {
            validation_error(
                "Invalid health URL",
                serde_json::json!({ "health_url": "Must be an absolute http(s) URL" }),
            )
        })?;

    let target = WatchTarget {
        workflow_id: request.workflow_id.trim().to_string(),
        connector_id: request.connector_id.trim().to_string(),
        health_url: health_url.to_string(),
        user_id: Some(user_id),
    };
    state.monitor.watch(target.clone());
    Ok((StatusCode::CREATED, Json(target)))
}
