//! # Error Handling
//!
//! Unified problem+json error responses for the backfill API, with trace ID
//! propagation and the mapping from engine errors to HTTP statuses.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::backfill::BackfillError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the active request scope (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        validation_error(
            "Invalid query parameters",
            json!({ "query": rejection.body_text() }),
        )
    }
}

/// Map an engine error, using `retry_after` for concurrency rejections.
pub fn engine_error(error: BackfillError, retry_after: u64) -> ApiError {
    let message = error.to_string();
    match &error {
        BackfillError::UnsupportedConnector(connector) => {
            validation_error(&message, json!({ "connector_id": connector }))
        }
        BackfillError::UnsupportedStrategy {
            connector,
            strategy,
        } => validation_error(
            &message,
            json!({ "connector_id": connector, "strategy": strategy }),
        ),
        BackfillError::InvalidWindow(reason) => {
            validation_error(&message, json!({ "window": reason }))
        }
        BackfillError::WindowExceedsLookback {
            connector,
            max_lookback_hours,
        } => validation_error(
            &message,
            json!({ "connector_id": connector, "max_lookback_hours": max_lookback_hours }),
        ),
        BackfillError::JobNotFound(_) | BackfillError::DowntimeNotFound(_) => {
            ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", &message)
        }
        BackfillError::InvalidStateTransition { from, action } => {
            ApiError::new(StatusCode::CONFLICT, "CONFLICT", &message)
                .with_details(json!({ "status": from, "action": action }))
        }
        BackfillError::DowntimeAlreadyResolved(_) | BackfillError::RetryLimitReached { .. } => {
            ApiError::new(StatusCode::CONFLICT, "CONFLICT", &message)
        }
        BackfillError::ConcurrencyLimitExceeded { limit } => ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "CONCURRENCY_LIMIT",
            &message,
        )
        .with_details(json!({ "max_concurrent_jobs": limit }))
        .with_retry_after(retry_after),
        BackfillError::PreviousRunActive(id) => ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RUN_STOPPING",
            &message,
        )
        .with_details(json!({ "job_id": id }))
        .with_retry_after(1),
        BackfillError::Storage(err) => {
            tracing::error!(error = %err, "storage error");
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_SERVER_ERROR",
                "Storage error occurred",
            )
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create an unauthorized error (401) with explicit trace_id
pub fn unauthorized_with_trace_id(message: Option<&str>, trace_id: String) -> ApiError {
    let mut error = unauthorized(message);
    error.trace_id = Some(trace_id.into_boxed_str());
    error
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
