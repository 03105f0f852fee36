//! Shared HTTP helpers for event sources

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use tracing::warn;

use crate::connectors::ConnectorError;

const BODY_SNIPPET_LIMIT: usize = 200;

pub(crate) const USER_AGENT: &str = concat!("webhook-backfill/", env!("CARGO_PKG_VERSION"));

/// Parse a header value as an integer.
pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

/// Seconds to wait derived from `Retry-After` or an `X-RateLimit-Reset` epoch.
pub(crate) fn retry_after_secs(headers: &HeaderMap, now: DateTime<Utc>) -> Option<u64> {
    if let Some(secs) = header_u64(headers, "Retry-After") {
        return Some(secs);
    }
    header_u64(headers, "X-RateLimit-Reset").map(|reset| {
        let now = u64::try_from(now.timestamp()).unwrap_or_default();
        reset.saturating_sub(now)
    })
}

fn snippet(body: String) -> Option<String> {
    if body.is_empty() {
        None
    } else if body.len() > BODY_SNIPPET_LIMIT {
        let cut = (0..=BODY_SNIPPET_LIMIT)
            .rev()
            .find(|idx| body.is_char_boundary(*idx))
            .unwrap_or(0);
        Some(format!("{}...", &body[..cut]))
    } else {
        Some(body)
    }
}

/// Translate a non-success response into a structured connector error.
pub(crate) async fn error_from_response(connector: &str, response: Response) -> ConnectorError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();

    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && header_u64(&headers, "X-RateLimit-Remaining") == Some(0));

    if rate_limited {
        let retry_after = retry_after_secs(&headers, Utc::now());
        warn!(connector, ?retry_after, "upstream rate limit hit");
        return ConnectorError::RateLimitError {
            retry_after,
            limit: header_u64(&headers, "X-RateLimit-Limit")
                .and_then(|limit| u32::try_from(limit).ok()),
        };
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ConnectorError::AuthenticationError {
            details: snippet(body).unwrap_or_else(|| status.to_string()),
        },
        _ => ConnectorError::HttpError {
            status: status.as_u16(),
            body: snippet(body),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_prefers_explicit_header() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", HeaderValue::from_static("12"));
        headers.insert("X-RateLimit-Reset", HeaderValue::from_static("9999999999"));
        assert_eq!(retry_after_secs(&headers, Utc::now()), Some(12));
    }

    #[test]
    fn retry_after_falls_back_to_reset_epoch() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        let reset = (now.timestamp() + 30).to_string();
        headers.insert("X-RateLimit-Reset", HeaderValue::from_str(&reset).unwrap());
        assert_eq!(retry_after_secs(&headers, now), Some(30));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(500);
        let truncated = snippet(body).unwrap();
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.len(), BODY_SNIPPET_LIMIT + 3);
        assert_eq!(snippet(String::new()), None);
    }
}
