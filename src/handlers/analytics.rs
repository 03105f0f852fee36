//! # Analytics Handler

use axum::{
    extract::{Query, State, rejection::QueryRejection},
    response::Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::analytics::{AnalyticsQuery, AnalyticsReport};
use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::handlers::{api_error, parse_timestamp};
use crate::server::AppState;

const MAX_TOP_CONNECTORS: usize = 50;

/// Query parameters for the analytics report
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AnalyticsParams {
    /// RFC3339 lower bound (inclusive)
    pub start: Option<String>,
    /// RFC3339 upper bound (exclusive)
    pub end: Option<String>,
    /// Number of connectors in the ranking (default: 5, max: 50)
    pub top: Option<usize>,
}

/// Aggregated job and downtime statistics
#[utoipa::path(
    get,
    path = "/v1/backfill/analytics",
    security(("bearer_auth" = [])),
    params(crate::auth::UserHeader, AnalyticsParams),
    responses(
        (status = 200, description = "Analytics report", body = AnalyticsReport),
        (status = 400, description = "Invalid range", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "analytics"
)]
pub async fn get_analytics(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    params: Result<Query<AnalyticsParams>, QueryRejection>,
) -> Result<Json<AnalyticsReport>, ApiError> {
    let Query(params) = params?;
    if let Some(top) = params.top
        && (top == 0 || top > MAX_TOP_CONNECTORS)
    {
        return Err(validation_error(
            "Invalid top",
            serde_json::json!({ "top": format!("Must be between 1 and {}", MAX_TOP_CONNECTORS) }),
        ));
    }

    let query = AnalyticsQuery {
        start: parse_timestamp("start", params.start.as_deref())?,
        end: parse_timestamp("end", params.end.as_deref())?,
        top: params.top,
    };

    let report = state
        .analytics
        .report(&query)
        .await
        .map_err(|e| api_error(&state, e))?;
    Ok(Json(report))
}
