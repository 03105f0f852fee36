//! Event source trait definition
//!
//! Defines the fetch operations every connector exposes to the recovery
//! strategies, plus the shared connector error and cursor types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backfill::types::TimeWindow;

/// Connector-specific error types for structured error handling
#[derive(Debug, Clone)]
pub enum ConnectorError {
    /// HTTP error from upstream provider
    HttpError { status: u16, body: Option<String> },
    /// Malformed response from provider
    MalformedResponse { details: String },
    /// Network or connectivity error
    NetworkError { details: String, retryable: bool },
    /// Request exceeded the per-request timeout
    Timeout { after_ms: u64 },
    /// Authentication/authorization error
    AuthenticationError { details: String },
    /// Rate limiting error
    RateLimitError {
        retry_after: Option<u64>,
        limit: Option<u32>,
    },
    /// The connector keeps no replayable event log
    EventLogUnavailable { connector: String },
    /// Configuration or setup error
    ConfigurationError { details: String },
}

impl ConnectorError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ConnectorError::RateLimitError { .. })
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::RateLimitError { .. }
            | ConnectorError::Timeout { .. }
            | ConnectorError::MalformedResponse { .. } => true,
            ConnectorError::NetworkError { retryable, .. } => *retryable,
            ConnectorError::HttpError { status, .. } => *status == 408 || *status >= 500,
            ConnectorError::AuthenticationError { .. }
            | ConnectorError::EventLogUnavailable { .. }
            | ConnectorError::ConfigurationError { .. } => false,
        }
    }

    /// Provider-supplied wait hint, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ConnectorError::RateLimitError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::HttpError { status, body } => {
                write!(
                    f,
                    "HTTP error {}: {}",
                    status,
                    body.as_deref().unwrap_or("No body")
                )
            }
            ConnectorError::MalformedResponse { details } => {
                write!(f, "Malformed response: {}", details)
            }
            ConnectorError::NetworkError { details, .. } => {
                write!(f, "Network error: {}", details)
            }
            ConnectorError::Timeout { after_ms } => {
                write!(f, "Request timed out after {}ms", after_ms)
            }
            ConnectorError::AuthenticationError { details } => {
                write!(f, "Authentication error: {}", details)
            }
            ConnectorError::RateLimitError { retry_after, limit } => {
                write!(f, "Rate limit exceeded")?;
                if let Some(limit) = limit {
                    write!(f, " (limit: {})", limit)?;
                }
                if let Some(after) = retry_after {
                    write!(f, " (retry after: {}s)", after)?;
                }
                Ok(())
            }
            ConnectorError::EventLogUnavailable { connector } => {
                write!(f, "Connector '{}' has no replayable event log", connector)
            }
            ConnectorError::ConfigurationError { details } => {
                write!(f, "Configuration error: {}", details)
            }
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ConnectorError::Timeout { after_ms: 0 }
        } else if err.is_decode() {
            ConnectorError::MalformedResponse {
                details: err.to_string(),
            }
        } else if err.is_builder() {
            ConnectorError::ConfigurationError {
                details: err.to_string(),
            }
        } else {
            ConnectorError::NetworkError {
                details: err.to_string(),
                retryable: true,
            }
        }
    }
}

/// Cursor for paginated event fetches.
///
/// Wraps an opaque JSON payload returned by connectors. The payload may be a
/// primitive or structured object and must round-trip without alteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Cursor(pub serde_json::Value);

impl Cursor {
    /// Construct a cursor from any JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Convenience helper to build a string cursor.
    pub fn from_string<S: Into<String>>(value: S) -> Self {
        Self(serde_json::Value::String(value.into()))
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl From<Cursor> for serde_json::Value {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

impl From<serde_json::Value> for Cursor {
    fn from(value: serde_json::Value) -> Self {
        Cursor::from_json(value)
    }
}

/// One upstream event as seen by the recovery strategies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct UpstreamEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A page returned by a cursor fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<UpstreamEvent>,
    /// `None` once the window is exhausted
    pub next_cursor: Option<Cursor>,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Poll the provider API for events inside `window`.
    async fn poll_range(&self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError>;

    /// Read the provider's event log for `window`.
    ///
    /// Sources without a log return [`ConnectorError::EventLogUnavailable`].
    async fn fetch_event_log(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError>;

    /// Fetch one page of events inside `window`, starting after `cursor`.
    async fn fetch_page(
        &self,
        window: &TimeWindow,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> Result<EventPage, ConnectorError>;

    /// List every event with a timestamp inside `window`.
    async fn list_events(&self, window: &TimeWindow)
    -> Result<Vec<UpstreamEvent>, ConnectorError>;
}
