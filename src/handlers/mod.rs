//! # API Handlers
//!
//! This module contains all the HTTP endpoint handlers for the backfill API.

use axum::{http::StatusCode, response::Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backfill::BackfillError;
use crate::error::{ApiError, engine_error, validation_error};
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod analytics;
pub mod connectors;
pub mod downtime;
pub mod jobs;

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthStatus {
    #[schema(example = "ok")]
    pub status: String,
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service is alive", body = HealthStatus)
    ),
    tag = "root"
)]
pub async fn healthz() -> (StatusCode, Json<HealthStatus>) {
    (
        StatusCode::OK,
        Json(HealthStatus {
            status: "ok".to_string(),
        }),
    )
}

/// Map an engine error, hinting the processor tick as retry delay.
pub(crate) fn api_error(state: &AppState, error: BackfillError) -> ApiError {
    let retry_after = state.manager.settings().processor_tick.as_secs().max(1);
    engine_error(error, retry_after)
}

/// Parse an optional RFC3339 query parameter.
pub(crate) fn parse_timestamp(
    field: &str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| Some(ts.with_timezone(&Utc)))
        .map_err(|_| {
            validation_error(
                "Invalid timestamp",
                serde_json::json!({ field: "Must be an RFC3339 timestamp" }),
            )
        })
}

/// Resolve `limit` against a default and an upper bound.
pub(crate) fn parse_limit(value: Option<u32>, default: u32, max: u32) -> Result<u64, ApiError> {
    match value {
        None => Ok(u64::from(default)),
        Some(0) => Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": "Minimum allowed limit is 1" }),
        )),
        Some(limit) if limit > max => Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": format!("Maximum allowed limit is {}", max) }),
        )),
        Some(limit) => Ok(u64::from(limit)),
    }
}

/// Reject blank or oversized identifiers.
pub(crate) fn require_identifier(field: &str, value: &str) -> Result<(), ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > 128 || trimmed.chars().any(char::is_whitespace) {
        return Err(validation_error(
            "Invalid identifier",
            serde_json::json!({ field: "Must be 1-128 characters without whitespace" }),
        ));
    }
    Ok(())
}
