//! # Jobs API Handlers
//!
//! Create, inspect and drive backfill jobs.

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
use crate::backfill::{
    BackfillJob, BackfillStrategy, JobConfigOverrides, JobFilter, JobStatus, NewJob,
    RecoveredEvent, TimeWindow,
};
use crate::error::{ApiError, validation_error};
use crate::handlers::{api_error, parse_limit, parse_timestamp, require_identifier};
use crate::server::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 100;
const DEFAULT_EVENTS_LIMIT: u32 = 100;
const MAX_EVENTS_LIMIT: u32 = 1000;

/// Request body for creating a backfill job
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateJobRequest {
    #[schema(example = "github")]
    pub connector_id: String,
    #[schema(example = "wf-123")]
    pub workflow_id: String,
    /// Inclusive start of the recovery window
    #[schema(example = "2025-01-01T10:00:00Z")]
    pub start_time: DateTime<Utc>,
    /// Exclusive end of the recovery window
    #[schema(example = "2025-01-01T12:00:00Z")]
    pub end_time: DateTime<Utc>,
    /// Explicit strategy; selected automatically when omitted
    #[serde(default)]
    pub strategy: Option<BackfillStrategy>,
    #[serde(default)]
    pub config: Option<JobConfigOverrides>,
    /// Start the job right away instead of leaving it to the processor
    #[serde(default)]
    pub start: bool,
}

/// Query parameters for listing jobs
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListJobsQuery {
    pub connector_id: Option<String>,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
    /// One of pending, running, completed, failed, paused, cancelled, partially_completed
    pub status: Option<String>,
    /// RFC3339 lower bound (inclusive) on creation time
    pub created_after: Option<String>,
    /// RFC3339 upper bound (exclusive) on creation time
    pub created_before: Option<String>,
    /// Maximum number of jobs to return (default: 50, max: 100)
    pub limit: Option<u32>,
}

/// Query parameters for listing recovered events
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EventsQuery {
    /// Maximum number of events to return (default: 100, max: 1000)
    pub limit: Option<u32>,
}

/// Response payload for jobs listing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<BackfillJob>,
}

/// Response payload for the recovered events endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EventsResponse {
    pub job_id: Uuid,
    pub events: Vec<RecoveredEvent>,
}

/// Create a backfill job
#[utoipa::path(
    post,
    path = "/v1/backfill/jobs",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader),
    request_body = CreateJobRequest,
    responses(
        (status = 201, description = "Job created", body = BackfillJob),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 429, description = "Concurrency limit reached while starting", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserId(user_id): UserId,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<BackfillJob>), ApiError> {
    let Json(request) = payload?;
    require_identifier("connector_id", &request.connector_id)?;
    require_identifier("workflow_id", &request.workflow_id)?;

    let job = state
        .manager
        .create_job(NewJob {
            connector_id: request.connector_id.trim().to_string(),
            workflow_id: request.workflow_id.trim().to_string(),
            user_id,
            window: TimeWindow::new(request.start_time, request.end_time),
            strategy: request.strategy,
            config: request.config,
            downtime_id: None,
        })
        .await
        .map_err(|e| api_error(&state, e))?;

    if !request.start {
        return Ok((StatusCode::CREATED, Json(job)));
    }

    let started = state
        .manager
        .start_job(job.id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok((StatusCode::CREATED, Json(started)))
}

/// List backfill jobs, newest first
#[utoipa::path(
    get,
    path = "/v1/backfill/jobs",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ListJobsQuery),
    responses(
        (status = 200, description = "Jobs matching the filters", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    params: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<JobsResponse>, ApiError> {
    let Query(params) = params?;
    let limit = parse_limit(params.limit, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT)?;

    let status = match params.status.as_deref() {
        Some(raw) => Some(raw.parse::<JobStatus>().map_err(|message| {
            validation_error("Invalid status", serde_json::json!({ "status": message }))
        })?),
        None => None,
    };

    let filter = JobFilter {
        connector_id: params.connector_id,
        workflow_id: params.workflow_id,
        user_id: params.user_id,
        status,
        created_after: parse_timestamp("created_after", params.created_after.as_deref())?,
        created_before: parse_timestamp("created_before", params.created_before.as_deref())?,
        limit: Some(limit),
        oldest_first: false,
    };

    let jobs = state
        .manager
        .list_jobs(&filter)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(JobsResponse { jobs }))
}

/// Fetch one job
#[utoipa::path(
    get,
    path = "/v1/backfill/jobs/{id}",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "The job", body = BackfillJob),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<BackfillJob>, ApiError> {
    let job = state
        .manager
        .get_job(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(job))
}

/// Recovered events of a job, in delivery order
#[utoipa::path(
    get,
    path = "/v1/backfill/jobs/{id}/events",
    security(("bearer_auth" = [])),
    params(
        crate::auth::UserHeader,
        ("id" = Uuid, Path, description = "Job ID"),
        EventsQuery
    ),
    responses(
        (status = 200, description = "Recovered events", body = EventsResponse),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_job_events(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
    params: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<EventsResponse>, ApiError> {
    let Query(params) = params?;
    let limit = parse_limit(params.limit, DEFAULT_EVENTS_LIMIT, MAX_EVENTS_LIMIT)?;
    let events = state
        .manager
        .recovered_events(id, limit)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(EventsResponse { job_id: id, events }))
}

/// Start or resume a job
#[utoipa::path(
    post,
    path = "/v1/backfill/jobs/{id}/start",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job is running", body = BackfillJob),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 409, description = "Job cannot be started from its current state", body = ApiError),
        (status = 429, description = "Concurrency limit reached", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn start_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<BackfillJob>, ApiError> {
    let job = state
        .manager
        .start_job(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(job))
}

/// Pause a running job
#[utoipa::path(
    post,
    path = "/v1/backfill/jobs/{id}/pause",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job paused", body = BackfillJob),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 409, description = "Job is not running", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn pause_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<BackfillJob>, ApiError> {
    let job = state
        .manager
        .pause_job(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(job))
}

/// Cancel a job
#[utoipa::path(
    post,
    path = "/v1/backfill/jobs/{id}/cancel",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job cancelled", body = BackfillJob),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 409, description = "Job already finished", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<BackfillJob>, ApiError> {
    let job = state
        .manager
        .cancel_job(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(job))
}

/// Requeue a failed or partially completed job
#[utoipa::path(
    post,
    path = "/v1/backfill/jobs/{id}/retry",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, ("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job requeued as pending", body = BackfillJob),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 409, description = "Job is not retryable or out of retries", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn retry_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<BackfillJob>, ApiError> {
    let job = state
        .manager
        .retry_job(id)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(job))
}
