//! Backfill domain types
//!
//! Jobs, recovery strategies, progress counters and the structured error and
//! timeline records a recovery run accumulates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::connectors::{Cursor, UpstreamEvent};

/// Lifecycle state of a backfill job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
    PartiallyCompleted,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
        JobStatus::Cancelled,
        JobStatus::PartiallyCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::PartiallyCompleted => "partially_completed",
        }
    }

    /// Terminal jobs never run again unless explicitly retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::PartiallyCompleted
        )
    }

    /// `start` is accepted only from these states.
    pub fn can_start(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown job status '{}'", value))
    }
}

/// Recovery algorithm used to replay a time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStrategy {
    ApiPolling,
    EventLogReplay,
    TimestampScan,
    CursorBased,
    Hybrid,
}

impl BackfillStrategy {
    pub const ALL: [BackfillStrategy; 5] = [
        BackfillStrategy::ApiPolling,
        BackfillStrategy::EventLogReplay,
        BackfillStrategy::TimestampScan,
        BackfillStrategy::CursorBased,
        BackfillStrategy::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStrategy::ApiPolling => "api_polling",
            BackfillStrategy::EventLogReplay => "event_log_replay",
            BackfillStrategy::TimestampScan => "timestamp_scan",
            BackfillStrategy::CursorBased => "cursor_based",
            BackfillStrategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for BackfillStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BackfillStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == value)
            .ok_or_else(|| format!("unknown backfill strategy '{}'", value))
    }
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Window length in fractional hours.
    pub fn hours(&self) -> f64 {
        self.duration().num_milliseconds().max(0) as f64 / 3_600_000.0
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Partition into `parts` contiguous sub-windows of equal length. The last
    /// sub-window absorbs rounding so the union is exactly `[start, end)`.
    pub fn split(&self, parts: u32) -> Vec<TimeWindow> {
        let parts = parts.max(1);
        let total_ms = self.duration().num_milliseconds().max(0);
        let step = total_ms / i64::from(parts);

        (0..parts)
            .map(|index| {
                let start = self.start + Duration::milliseconds(step * i64::from(index));
                let end = if index + 1 == parts {
                    self.end
                } else {
                    self.start + Duration::milliseconds(step * i64::from(index + 1))
                };
                TimeWindow { start, end }
            })
            .collect()
    }
}

/// Retry policy for per-event execution and rate-limited fetches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based): `initial × multiplier^attempt`,
    /// capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Deduplication policy applied within a single job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DedupPolicy {
    pub enabled: bool,
    pub key_fields: Vec<String>,
    pub lookback_hours: u32,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            key_fields: vec!["id".to_string(), "timestamp".to_string(), "type".to_string()],
            lookback_hours: 24,
        }
    }
}

/// Event type / priority filters; empty lists accept everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EventFilters {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub priorities: Vec<String>,
}

impl EventFilters {
    pub fn matches(&self, event: &UpstreamEvent) -> bool {
        let type_ok = self.event_types.is_empty()
            || self.event_types.iter().any(|t| t == &event.event_type);
        let priority_ok = self.priorities.is_empty()
            || event
                .priority
                .as_ref()
                .is_some_and(|p| self.priorities.iter().any(|wanted| wanted == p));
        type_ok && priority_ok
    }
}

/// Effective per-job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobConfig {
    pub batch_size: u32,
    pub delay_between_batches_ms: u64,
    /// Recorded with the job for reporting only. Batches and pages of one
    /// job always run one at a time, so this never widens upstream fan-out.
    pub max_concurrent_requests: u32,
    pub timeout_per_request_ms: u64,
    pub retry_policy: RetryPolicy,
    pub deduplication: DedupPolicy,
    pub filters: EventFilters,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay_between_batches_ms: 1_000,
            max_concurrent_requests: 1,
            timeout_per_request_ms: 30_000,
            retry_policy: RetryPolicy::default(),
            deduplication: DedupPolicy::default(),
            filters: EventFilters::default(),
        }
    }
}

/// Caller-supplied configuration, merged field by field over the defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobConfigOverrides {
    pub batch_size: Option<u32>,
    pub delay_between_batches_ms: Option<u64>,
    pub max_concurrent_requests: Option<u32>,
    pub timeout_per_request_ms: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
    pub deduplication: Option<DedupPolicy>,
    pub filters: Option<EventFilters>,
}

impl JobConfig {
    pub fn merged(defaults: &JobConfig, overrides: Option<JobConfigOverrides>) -> JobConfig {
        let Some(overrides) = overrides else {
            return defaults.clone();
        };

        JobConfig {
            batch_size: overrides.batch_size.unwrap_or(defaults.batch_size).max(1),
            delay_between_batches_ms: overrides
                .delay_between_batches_ms
                .unwrap_or(defaults.delay_between_batches_ms),
            max_concurrent_requests: overrides
                .max_concurrent_requests
                .unwrap_or(defaults.max_concurrent_requests)
                .max(1),
            timeout_per_request_ms: overrides
                .timeout_per_request_ms
                .unwrap_or(defaults.timeout_per_request_ms),
            retry_policy: overrides
                .retry_policy
                .unwrap_or_else(|| defaults.retry_policy.clone()),
            deduplication: overrides
                .deduplication
                .unwrap_or_else(|| defaults.deduplication.clone()),
            filters: overrides
                .filters
                .unwrap_or_else(|| defaults.filters.clone()),
        }
    }
}

/// Progress counters of a job.
///
/// `processed == successful + failed + skipped` holds after every mutation;
/// `duplicates` is tracked separately and never counts as processed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobProgress {
    pub total_events: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub current_batch: u32,
    pub total_batches: u32,
    pub estimated_time_remaining_secs: Option<u64>,
    pub throughput_per_second: f64,
}

impl JobProgress {
    pub fn record_success(&mut self) {
        self.successful += 1;
        self.processed += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
        self.processed += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
        self.processed += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn is_consistent(&self) -> bool {
        self.processed == self.successful + self.failed + self.skipped
    }

    /// Recompute throughput and remaining-time estimates from elapsed run time.
    pub fn refresh_rates(&mut self, elapsed: std::time::Duration) {
        let seconds = elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return;
        }
        self.throughput_per_second = self.processed as f64 / seconds;
        self.estimated_time_remaining_secs = if self.throughput_per_second > 0.0 {
            let remaining = self.total_events.saturating_sub(self.processed);
            Some((remaining as f64 / self.throughput_per_second).ceil() as u64)
        } else {
            None
        };
    }

    /// Clear counters for a fresh run (explicit retry).
    pub fn reset(&mut self) {
        *self = JobProgress {
            total_events: self.total_events,
            total_batches: self.total_batches,
            ..JobProgress::default()
        };
    }
}

/// Category of a structured backfill error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    FetchFailed,
    RateLimited,
    Timeout,
    ExecutionFailed,
    EventLogUnavailable,
    Cancelled,
    Internal,
}

/// Failure record attached to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BackfillErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub batch_id: Option<String>,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub retryable: bool,
}

impl BackfillErrorRecord {
    pub fn new(
        batch_id: Option<String>,
        category: ErrorCategory,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            batch_id,
            category,
            message: message.into(),
            details: serde_json::Value::Null,
            retryable,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    Created,
    Started,
    Resumed,
    Paused,
    BatchCompleted,
    BatchFailed,
    Cancelled,
    Completed,
    PartiallyCompleted,
    Failed,
    Retried,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: TimelineKind,
    pub message: String,
}

impl TimelineEntry {
    pub fn now(kind: TimelineKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of replaying one upstream event through the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecoveredEvent {
    pub job_id: Uuid,
    pub original_event_id: String,
    pub original_timestamp: DateTime<Utc>,
    pub recovered_at: DateTime<Utc>,
    pub event_type: String,
    pub source_connector: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub success: bool,
    pub execution_id: Option<String>,
}

/// The unit of recovery work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BackfillJob {
    pub id: Uuid,
    pub connector_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub window: TimeWindow,
    pub status: JobStatus,
    pub strategy: BackfillStrategy,
    pub config: JobConfig,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub errors: Vec<BackfillErrorRecord>,
    pub timeline: Vec<TimelineEntry>,
    /// Next page cursor saved when a `cursor_based` run is paused
    #[schema(value_type = Option<Object>)]
    pub checkpoint_cursor: Option<Cursor>,
    /// Downtime record that spawned this job, if auto-triggered
    pub downtime_id: Option<Uuid>,
}

impl BackfillJob {
    pub fn push_timeline(&mut self, kind: TimelineKind, message: impl Into<String>) {
        self.timeline.push(TimelineEntry::now(kind, message));
    }

    /// Wall-clock run duration for finished jobs.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) if completed >= started => Some(completed - started),
            _ => None,
        }
    }
}

/// Filter used by the job listing API and the processor
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub connector_id: Option<String>,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    pub oldest_first: bool,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &BackfillJob) -> bool {
        self.connector_id
            .as_ref()
            .is_none_or(|c| c == &job.connector_id)
            && self.workflow_id.as_ref().is_none_or(|w| w == &job.workflow_id)
            && self.user_id.as_ref().is_none_or(|u| u == &job.user_id)
            && self.status.is_none_or(|s| s == job.status)
            && self.created_after.is_none_or(|after| job.created_at >= after)
            && self.created_before.is_none_or(|before| job.created_at < before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_pending_and_paused_can_start() {
        let startable: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::can_start)
            .collect();
        assert_eq!(startable, vec![JobStatus::Pending, JobStatus::Paused]);
    }

    #[test]
    fn window_split_covers_range_without_gaps() {
        let window = TimeWindow::new(ts("2025-01-01T00:00:00Z"), ts("2025-01-01T01:00:00Z"));
        let parts = window.split(7);

        assert_eq!(parts.len(), 7);
        assert_eq!(parts[0].start, window.start);
        assert_eq!(parts[6].end, window.end);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn window_is_half_open() {
        let window = TimeWindow::new(ts("2025-01-01T00:00:00Z"), ts("2025-01-01T01:00:00Z"));
        assert!(window.contains(window.start));
        assert!(!window.contains(window.end));
        assert!((window.hours() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn retry_delay_grows_geometrically_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_multiplier: 2.0,
            initial_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(policy.delay_for_attempt(1).as_millis(), 200);
        assert_eq!(policy.delay_for_attempt(2).as_millis(), 400);
        assert_eq!(policy.delay_for_attempt(3).as_millis(), 500);
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let defaults = JobConfig::default();
        let merged = JobConfig::merged(
            &defaults,
            Some(JobConfigOverrides {
                batch_size: Some(25),
                ..Default::default()
            }),
        );
        assert_eq!(merged.batch_size, 25);
        assert_eq!(merged.retry_policy, defaults.retry_policy);
        assert_eq!(merged.deduplication, defaults.deduplication);
        assert_eq!(merged.max_concurrent_requests, 1);
    }

    #[test]
    fn concurrent_requests_are_recorded_as_given() {
        let defaults = JobConfig::default();
        let raised = JobConfig::merged(
            &defaults,
            Some(JobConfigOverrides {
                max_concurrent_requests: Some(8),
                ..Default::default()
            }),
        );
        assert_eq!(raised.max_concurrent_requests, 8);

        let zero = JobConfig::merged(
            &defaults,
            Some(JobConfigOverrides {
                max_concurrent_requests: Some(0),
                ..Default::default()
            }),
        );
        assert_eq!(zero.max_concurrent_requests, 1);
    }

    #[test]
    fn progress_counters_keep_invariant() {
        let mut progress = JobProgress::default();
        progress.record_success();
        progress.record_failure();
        progress.record_skip();
        progress.record_duplicate();

        assert_eq!(progress.processed, 3);
        assert_eq!(progress.duplicates, 1);
        assert!(progress.is_consistent());
    }

    #[test]
    fn filters_match_type_and_priority() {
        let event = UpstreamEvent {
            id: "1".to_string(),
            timestamp: ts("2025-01-01T00:00:00Z"),
            event_type: "push".to_string(),
            priority: Some("high".to_string()),
            payload: serde_json::Value::Null,
        };

        assert!(EventFilters::default().matches(&event));
        assert!(
            EventFilters {
                event_types: vec!["push".to_string()],
                priorities: vec!["high".to_string()],
            }
            .matches(&event)
        );
        assert!(
            !EventFilters {
                event_types: vec!["issues".to_string()],
                priorities: vec![],
            }
            .matches(&event)
        );
    }
}
