//! Per-job guards: duplicate suppression, request pacing and retry backoff.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, thread_rng};
use sha2::{Digest, Sha256};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backfill::types::{DedupPolicy, RetryPolicy};
use crate::connectors::{ConnectorError, UpstreamEvent};
use crate::execution::{ExecutionError, WorkflowExecutor};

const PRUNE_EVERY: usize = 1_024;
const KEY_SEPARATOR: char = '\u{1f}';

/// Remembers composite keys of events already processed by one job.
///
/// Keys older than the lookback (relative to the newest event seen) are
/// pruned, so a job only suppresses duplicates within that horizon.
#[derive(Debug, Clone)]
pub struct DedupGuard {
    enabled: bool,
    key_fields: Vec<String>,
    lookback: chrono::Duration,
    seen: HashMap<String, DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    inserts_since_prune: usize,
}

impl DedupGuard {
    pub fn new(policy: &DedupPolicy) -> Self {
        Self {
            enabled: policy.enabled,
            key_fields: policy.key_fields.clone(),
            lookback: chrono::Duration::hours(i64::from(policy.lookback_hours)),
            seen: HashMap::new(),
            newest: None,
            inserts_since_prune: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Hex SHA-256 digest of the configured key fields.
    pub fn key_for(&self, event: &UpstreamEvent) -> String {
        let mut raw = String::new();
        for (index, field) in self.key_fields.iter().enumerate() {
            if index > 0 {
                raw.push(KEY_SEPARATOR);
            }
            raw.push_str(&field_value(event, field));
        }
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// Returns `true` when the event is new and records it; `false` for a duplicate.
    pub fn admit(&mut self, event: &UpstreamEvent) -> bool {
        if !self.enabled {
            return true;
        }

        let key = self.key_for(event);
        if let Some(seen_at) = self.seen.get(&key)
            && !self.expired(*seen_at)
        {
            return false;
        }

        self.seen.insert(key, event.timestamp);
        if self.newest.is_none_or(|newest| event.timestamp > newest) {
            self.newest = Some(event.timestamp);
        }
        self.inserts_since_prune += 1;
        if self.inserts_since_prune >= PRUNE_EVERY {
            self.prune();
        }
        true
    }

    fn expired(&self, seen_at: DateTime<Utc>) -> bool {
        self.newest
            .is_some_and(|newest| newest - seen_at > self.lookback)
    }

    fn prune(&mut self) {
        self.inserts_since_prune = 0;
        let Some(newest) = self.newest else {
            return;
        };
        let lookback = self.lookback;
        let before = self.seen.len();
        self.seen.retain(|_, seen_at| newest - *seen_at <= lookback);
        debug!(pruned = before - self.seen.len(), "pruned dedup keys");
    }
}

fn field_value(event: &UpstreamEvent, field: &str) -> String {
    match field {
        "id" => event.id.clone(),
        "timestamp" => event.timestamp.to_rfc3339(),
        "type" => event.event_type.clone(),
        "priority" => event.priority.clone().unwrap_or_default(),
        other => match event.payload.get(other) {
            Some(serde_json::Value::String(text)) => text.clone(),
            Some(value) => value.to_string(),
            None => String::new(),
        },
    }
}

/// Spaces out upstream requests to stay within a requests-per-minute budget.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RequestPacer {
    pub fn new(requests_per_minute: u32) -> Self {
        let min_interval = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / requests_per_minute
        };
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request is allowed, then claim the slot.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last {
            let ready_at = last + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                sleep(ready_at - now).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Sleep for `delay` unless the token fires first. Returns `false` on cancellation.
pub async fn pause_for(delay: Duration, token: &CancellationToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    if delay.is_zero() {
        return true;
    }
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

/// Backoff before re-issuing a failed fetch: policy delay, raised to the
/// provider's retry-after hint, plus up to 10% jitter.
pub fn fetch_backoff(policy: &RetryPolicy, attempt: u32, err: &ConnectorError) -> Duration {
    let mut backoff = policy.delay_for_attempt(attempt);
    if let Some(retry_after) = err.retry_after() {
        backoff = backoff.max(Duration::from_secs(retry_after));
    }
    let jitter_ms = (backoff.as_millis() as f64 * 0.1) as u64;
    if jitter_ms > 0 {
        backoff += Duration::from_millis(thread_rng().gen_range(0..=jitter_ms));
    }
    backoff
}

/// Why a guarded fetch produced no data
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// A pause or cancel request arrived while waiting to retry
    #[error("fetch interrupted before retrying")]
    Interrupted,
    #[error(transparent)]
    Upstream(#[from] ConnectorError),
}

/// Run an upstream fetch under the per-request timeout, retrying retryable
/// failures (including rate limits) up to the policy's retry budget.
pub async fn fetch_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    pacer: &mut RequestPacer,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt = 0;
    loop {
        pacer.acquire().await;
        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let backoff = fetch_backoff(policy, attempt, &err);
                warn!(attempt, ?backoff, error = %err, "upstream fetch failed, retrying");
                if !pause_for(backoff, token).await {
                    debug!(attempt, error = %err, "fetch retry interrupted");
                    return Err(FetchError::Interrupted);
                }
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Result of delivering one event to the workflow executor
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { execution_id: String, attempts: u32 },
    Failed { error: ExecutionError, attempts: u32 },
}

/// Execute the workflow for one event, retrying transient failures with
/// `initial × multiplier^attempt` backoff. Cancellation stops further retries.
pub async fn deliver_with_retry(
    executor: &dyn WorkflowExecutor,
    workflow_id: &str,
    job_id: Uuid,
    event: &UpstreamEvent,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> DeliveryOutcome {
    let mut attempt = 0;
    loop {
        match executor.execute(workflow_id, job_id, event).await {
            Ok(execution_id) => {
                return DeliveryOutcome::Delivered {
                    execution_id,
                    attempts: attempt + 1,
                };
            }
            Err(error) if error.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(event_id = %event.id, attempt, ?delay, error = %error, "retrying workflow execution");
                if !pause_for(delay, token).await {
                    return DeliveryOutcome::Failed {
                        error,
                        attempts: attempt + 1,
                    };
                }
                attempt += 1;
            }
            Err(error) => {
                return DeliveryOutcome::Failed {
                    error,
                    attempts: attempt + 1,
                };
            }
        }
    }
}
