//! Recovery strategies
//!
//! The five recovery algorithms share one contract: produce candidate events
//! for the job window, run them through the dedup guard, execute the workflow
//! per surviving event and publish progress after every batch. Batches inside
//! a job run strictly sequentially.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backfill::error::BackfillError;
use crate::backfill::guard::{
    DedupGuard, DeliveryOutcome, FetchError, RequestPacer, deliver_with_retry, fetch_with_retry,
    pause_for,
};
use crate::backfill::types::{
    BackfillErrorRecord, BackfillStrategy, ErrorCategory, JobConfig, JobProgress, RecoveredEvent,
    TimeWindow, TimelineEntry, TimelineKind,
};
use crate::connectors::{ConnectorCapability, ConnectorError, Cursor, EventSource, UpstreamEvent};
use crate::execution::WorkflowExecutor;

/// Pick a strategy by window length and connector capability.
pub fn select_strategy(capability: &ConnectorCapability, window: &TimeWindow) -> BackfillStrategy {
    let hours = window.hours();
    if hours <= 1.0 && capability.event_log {
        BackfillStrategy::EventLogReplay
    } else if hours <= 6.0 && capability.cursor_pagination {
        BackfillStrategy::CursorBased
    } else if hours <= 24.0 {
        BackfillStrategy::TimestampScan
    } else if capability.supports(BackfillStrategy::Hybrid) {
        BackfillStrategy::Hybrid
    } else {
        BackfillStrategy::ApiPolling
    }
}

/// `ceil(estimated / batch_size)`, never below one.
pub fn total_batches(estimated_events: u64, batch_size: u32) -> u32 {
    let batch_size = u64::from(batch_size.max(1));
    let batches = estimated_events.div_ceil(batch_size).max(1);
    u32::try_from(batches).unwrap_or(u32::MAX)
}

/// Fatal failure that ends a strategy run
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Engine(#[from] BackfillError),
    #[error("strategy run aborted: {0}")]
    Aborted(String),
}

impl RunError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RunError::Connector(err) => connector_category(err),
            RunError::Engine(_) | RunError::Aborted(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RunError::Connector(err) => err.is_retryable(),
            RunError::Engine(_) | RunError::Aborted(_) => false,
        }
    }
}

fn connector_category(err: &ConnectorError) -> ErrorCategory {
    match err {
        ConnectorError::RateLimitError { .. } => ErrorCategory::RateLimited,
        ConnectorError::Timeout { .. } => ErrorCategory::Timeout,
        ConnectorError::EventLogUnavailable { .. } => ErrorCategory::EventLogUnavailable,
        _ => ErrorCategory::FetchFailed,
    }
}

/// Incremental state a run publishes after each batch
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress: JobProgress,
    pub errors: Vec<BackfillErrorRecord>,
    pub timeline: Vec<TimelineEntry>,
    pub recovered: Vec<RecoveredEvent>,
    pub checkpoint_cursor: Option<Cursor>,
}

/// Receives progress snapshots of a running job
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, job_id: Uuid, update: ProgressUpdate) -> Result<(), BackfillError>;
}

/// Everything one strategy run needs, owned by the job's task
pub struct RunContext {
    pub job_id: Uuid,
    pub workflow_id: String,
    pub window: TimeWindow,
    pub config: JobConfig,
    pub capability: ConnectorCapability,
    source: Arc<dyn EventSource>,
    executor: Arc<dyn WorkflowExecutor>,
    sink: Arc<dyn ProgressSink>,
    token: CancellationToken,
    pacer: RequestPacer,
    pub dedup: DedupGuard,
    pub progress: JobProgress,
    pub checkpoint_cursor: Option<Cursor>,
    /// Batches below this index were finished by an earlier run
    resume_from: u32,
    errors: Vec<BackfillErrorRecord>,
    timeline: Vec<TimelineEntry>,
    recovered: Vec<RecoveredEvent>,
    recorded_events: usize,
    max_recorded_events: usize,
    started: Instant,
}

pub struct RunParts {
    pub job_id: Uuid,
    pub workflow_id: String,
    pub window: TimeWindow,
    pub config: JobConfig,
    pub capability: ConnectorCapability,
    pub source: Arc<dyn EventSource>,
    pub executor: Arc<dyn WorkflowExecutor>,
    pub sink: Arc<dyn ProgressSink>,
    pub token: CancellationToken,
    pub dedup: DedupGuard,
    pub progress: JobProgress,
    pub checkpoint_cursor: Option<Cursor>,
    pub max_recorded_events: usize,
    pub recorded_events: usize,
}

impl RunContext {
    pub fn new(parts: RunParts) -> Self {
        let pacer = RequestPacer::new(parts.capability.rate_limits.requests_per_minute);
        let resume_from = parts.progress.current_batch;
        Self {
            job_id: parts.job_id,
            workflow_id: parts.workflow_id,
            window: parts.window,
            config: parts.config,
            capability: parts.capability,
            source: parts.source,
            executor: parts.executor,
            sink: parts.sink,
            token: parts.token,
            pacer,
            dedup: parts.dedup,
            progress: parts.progress,
            checkpoint_cursor: parts.checkpoint_cursor,
            resume_from,
            errors: Vec::new(),
            timeline: Vec::new(),
            recovered: Vec::new(),
            recorded_events: parts.recorded_events,
            max_recorded_events: parts.max_recorded_events,
            started: Instant::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_per_request_ms.max(1))
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.config.delay_between_batches_ms)
    }

    fn already_done(&self, batch_index: u32) -> bool {
        batch_index < self.resume_from
    }

    pub fn record_error(&mut self, record: BackfillErrorRecord) {
        self.errors.push(record);
    }

    pub fn record_timeline(&mut self, kind: TimelineKind, message: impl Into<String>) {
        self.timeline.push(TimelineEntry::now(kind, message));
    }

    /// Publish accumulated progress, errors, timeline and recovered events.
    pub async fn flush(&mut self) -> Result<(), BackfillError> {
        self.progress.refresh_rates(self.started.elapsed());
        let update = ProgressUpdate {
            progress: self.progress.clone(),
            errors: std::mem::take(&mut self.errors),
            timeline: std::mem::take(&mut self.timeline),
            recovered: std::mem::take(&mut self.recovered),
            checkpoint_cursor: self.checkpoint_cursor.clone(),
        };
        self.sink.publish(self.job_id, update).await
    }

    async fn poll_range(&mut self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, FetchError> {
        let source = Arc::clone(&self.source);
        let timeout = self.timeout();
        fetch_with_retry(
            &self.config.retry_policy,
            timeout,
            &mut self.pacer,
            &self.token,
            || source.poll_range(window),
        )
        .await
    }

    async fn fetch_event_log(&mut self) -> Result<Vec<UpstreamEvent>, FetchError> {
        if !self.capability.event_log {
            return Err(ConnectorError::EventLogUnavailable {
                connector: self.capability.id.clone(),
            }
            .into());
        }
        let source = Arc::clone(&self.source);
        let timeout = self.timeout();
        let window = self.window;
        fetch_with_retry(
            &self.config.retry_policy,
            timeout,
            &mut self.pacer,
            &self.token,
            || source.fetch_event_log(&window),
        )
        .await
    }

    async fn list_events(&mut self) -> Result<Vec<UpstreamEvent>, FetchError> {
        let source = Arc::clone(&self.source);
        let timeout = self.timeout();
        let window = self.window;
        fetch_with_retry(
            &self.config.retry_policy,
            timeout,
            &mut self.pacer,
            &self.token,
            || source.list_events(&window),
        )
        .await
    }

    async fn fetch_page(
        &mut self,
        cursor: Option<Cursor>,
    ) -> Result<crate::connectors::EventPage, FetchError> {
        let source = Arc::clone(&self.source);
        let timeout = self.timeout();
        let window = self.window;
        let limit = self.config.batch_size;
        fetch_with_retry(
            &self.config.retry_policy,
            timeout,
            &mut self.pacer,
            &self.token,
            || source.fetch_page(&window, cursor.as_ref(), limit),
        )
        .await
    }

    /// Filter, deduplicate and execute one batch of candidate events.
    async fn process_batch(&mut self, batch_id: &str, events: Vec<UpstreamEvent>) {
        let batch_started = Instant::now();
        let connector = self.capability.id.clone();

        for event in events {
            if !self.window.contains(event.timestamp) || !self.config.filters.matches(&event) {
                self.progress.record_skip();
                continue;
            }
            if !self.dedup.admit(&event) {
                self.progress.record_duplicate();
                counter!("backfill_events_duplicate_total", "connector" => connector.clone())
                    .increment(1);
                continue;
            }

            let outcome = deliver_with_retry(
                self.executor.as_ref(),
                &self.workflow_id,
                self.job_id,
                &event,
                &self.config.retry_policy,
                &self.token,
            )
            .await;

            match outcome {
                DeliveryOutcome::Delivered { execution_id, .. } => {
                    self.progress.record_success();
                    counter!("backfill_events_recovered_total", "connector" => connector.clone())
                        .increment(1);
                    self.remember(&event, true, Some(execution_id));
                }
                DeliveryOutcome::Failed { error, attempts } => {
                    self.progress.record_failure();
                    counter!("backfill_events_failed_total", "connector" => connector.clone())
                        .increment(1);
                    warn!(job_id = %self.job_id, event_id = %event.id, attempts, error = %error, "event replay failed");
                    self.record_error(
                        BackfillErrorRecord::new(
                            Some(batch_id.to_string()),
                            ErrorCategory::ExecutionFailed,
                            error.message.clone(),
                            false,
                        )
                        .with_details(serde_json::json!({
                            "event_id": event.id,
                            "attempts": attempts,
                            "kind": error.kind,
                        })),
                    );
                    self.remember(&event, false, None);
                }
            }
        }

        histogram!("backfill_batch_duration_ms").record(batch_started.elapsed().as_millis() as f64);
    }

    fn remember(&mut self, event: &UpstreamEvent, success: bool, execution_id: Option<String>) {
        if self.recorded_events >= self.max_recorded_events {
            return;
        }
        self.recorded_events += 1;
        self.recovered.push(RecoveredEvent {
            job_id: self.job_id,
            original_event_id: event.id.clone(),
            original_timestamp: event.timestamp,
            recovered_at: Utc::now(),
            event_type: event.event_type.clone(),
            source_connector: self.capability.id.clone(),
            payload: event.payload.clone(),
            success,
            execution_id,
        });
    }

    /// Close out batch `index`: advance the checkpoint and publish.
    async fn finish_batch(&mut self, batch_id: &str, index: u32) -> Result<(), BackfillError> {
        self.progress.current_batch = index + 1;
        let message = format!(
            "batch {} of {} done ({} processed)",
            index + 1,
            self.progress.total_batches,
            self.progress.processed
        );
        self.record_timeline(TimelineKind::BatchCompleted, message);
        debug!(job_id = %self.job_id, batch_id, "batch completed");
        self.flush().await
    }

    fn batch_failed(&mut self, batch_id: &str, err: &ConnectorError) {
        warn!(job_id = %self.job_id, batch_id, error = %err, "batch fetch failed");
        self.record_error(
            BackfillErrorRecord::new(
                Some(batch_id.to_string()),
                connector_category(err),
                err.to_string(),
                true,
            )
            .with_details(serde_json::json!({ "retry_after": err.retry_after() })),
        );
        self.record_timeline(TimelineKind::BatchFailed, format!("{}: {}", batch_id, err));
    }

    /// Sleep the inter-batch delay; `false` once cancellation is requested.
    async fn between_batches(&self) -> bool {
        pause_for(self.delay(), &self.token).await
    }
}

/// Run the job's strategy to completion, cancellation or a fatal error.
#[instrument(skip(ctx), fields(job_id = %ctx.job_id, connector_id = %ctx.capability.id))]
pub async fn execute(strategy: BackfillStrategy, ctx: &mut RunContext) -> Result<(), RunError> {
    info!(%strategy, "running recovery strategy");
    match strategy {
        BackfillStrategy::ApiPolling => api_polling(ctx, 0).await,
        BackfillStrategy::EventLogReplay => event_log_replay(ctx).await,
        BackfillStrategy::TimestampScan => timestamp_scan(ctx).await,
        BackfillStrategy::CursorBased => cursor_based(ctx).await,
        BackfillStrategy::Hybrid => hybrid(ctx).await,
    }
}

/// Partition the window into equal sub-windows and poll each in turn.
/// Batch indices start at `offset` so hybrid runs keep one batch sequence.
async fn api_polling(ctx: &mut RunContext, offset: u32) -> Result<(), RunError> {
    let estimated = ctx.capability.estimate_events(&ctx.window);
    let batches = total_batches(estimated, ctx.config.batch_size);
    if offset == 0 {
        ctx.progress.total_events = estimated;
    } else {
        ctx.progress.total_events += estimated;
    }
    ctx.progress.total_batches = offset + batches;

    let sub_windows = ctx.window.split(batches);
    for (position, sub_window) in sub_windows.iter().enumerate() {
        let index = offset + position as u32;
        if ctx.already_done(index) {
            continue;
        }
        if ctx.is_cancelled() {
            return Ok(());
        }

        let batch_id = format!("api_polling-{}", index);
        match ctx.poll_range(sub_window).await {
            Ok(events) => ctx.process_batch(&batch_id, events).await,
            // sub-window stays pending for the resumed run
            Err(FetchError::Interrupted) => return Ok(()),
            Err(FetchError::Upstream(err)) => ctx.batch_failed(&batch_id, &err),
        }
        ctx.finish_batch(&batch_id, index).await?;

        let last = position + 1 == sub_windows.len();
        if !last && !ctx.between_batches().await {
            return Ok(());
        }
    }
    Ok(())
}

/// Replay events from an already fetched list in fixed-size batches.
/// `trailing` reserves batch slots for a pass that follows this one.
async fn replay_in_batches(
    ctx: &mut RunContext,
    label: &str,
    events: Vec<UpstreamEvent>,
    offset: u32,
    trailing: u32,
) -> Result<u32, RunError> {
    let batch_size = ctx.config.batch_size.max(1) as usize;
    let batches = total_batches(events.len() as u64, ctx.config.batch_size);
    ctx.progress.total_batches = offset + batches + trailing;

    let mut chunks: Vec<Vec<UpstreamEvent>> = events
        .chunks(batch_size)
        .map(<[UpstreamEvent]>::to_vec)
        .collect();
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }

    let count = chunks.len();
    for (position, chunk) in chunks.into_iter().enumerate() {
        let index = offset + position as u32;
        if ctx.already_done(index) {
            continue;
        }
        if ctx.is_cancelled() {
            return Ok(batches);
        }

        let batch_id = format!("{}-{}", label, index);
        ctx.process_batch(&batch_id, chunk).await;
        ctx.finish_batch(&batch_id, index).await?;

        let last = position + 1 == count;
        if !last && !ctx.between_batches().await {
            return Ok(batches);
        }
    }
    Ok(batches)
}

/// `None` when a pause or cancel request interrupted the fetch.
fn settled<T>(result: Result<T, FetchError>) -> Result<Option<T>, RunError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(FetchError::Interrupted) => Ok(None),
        Err(FetchError::Upstream(err)) => Err(err.into()),
    }
}

async fn event_log_replay(ctx: &mut RunContext) -> Result<(), RunError> {
    let Some(events) = settled(ctx.fetch_event_log().await)? else {
        return Ok(());
    };
    ctx.progress.total_events = events.len() as u64;
    replay_in_batches(ctx, "event_log_replay", events, 0, 0).await?;
    Ok(())
}

/// Fetch the full candidate set once and process it as a single batch.
async fn timestamp_scan(ctx: &mut RunContext) -> Result<(), RunError> {
    if ctx.already_done(0) || ctx.is_cancelled() {
        return Ok(());
    }

    let Some(mut events) = settled(ctx.list_events().await)? else {
        return Ok(());
    };
    events.sort_by_key(|event| event.timestamp);
    ctx.progress.total_events = events.len() as u64;
    ctx.progress.total_batches = 1;

    let batch_id = "timestamp_scan-0";
    ctx.process_batch(batch_id, events).await;
    ctx.finish_batch(batch_id, 0).await?;
    Ok(())
}

/// Follow the cursor chain until the source reports no next cursor.
async fn cursor_based(ctx: &mut RunContext) -> Result<(), RunError> {
    let estimated = ctx.capability.estimate_events(&ctx.window);
    ctx.progress.total_events = ctx.progress.total_events.max(estimated);
    ctx.progress.total_batches = ctx
        .progress
        .total_batches
        .max(total_batches(estimated, ctx.config.batch_size));

    let mut cursor = ctx.checkpoint_cursor.clone();
    let mut index = ctx.progress.current_batch;

    loop {
        if ctx.is_cancelled() {
            return Ok(());
        }

        let Some(page) = settled(ctx.fetch_page(cursor.clone()).await)? else {
            return Ok(());
        };
        let batch_id = format!("cursor_based-{}", index);
        ctx.progress.total_batches = ctx.progress.total_batches.max(index + 1);
        ctx.process_batch(&batch_id, page.events).await;

        cursor = page.next_cursor;
        ctx.checkpoint_cursor = cursor.clone();
        if cursor.is_none() {
            ctx.progress.total_batches = index + 1;
        }
        ctx.finish_batch(&batch_id, index).await?;

        if cursor.is_none() {
            return Ok(());
        }
        index += 1;
        if !ctx.between_batches().await {
            return Ok(());
        }
    }
}

/// Event log pass (when available) followed by a gap-filling polling pass.
async fn hybrid(ctx: &mut RunContext) -> Result<(), RunError> {
    let mut offset = 0;
    let polling_batches = total_batches(
        ctx.capability.estimate_events(&ctx.window),
        ctx.config.batch_size,
    );

    if ctx.capability.event_log {
        match ctx.fetch_event_log().await {
            Ok(events) => {
                ctx.progress.total_events = events.len() as u64;
                offset = replay_in_batches(ctx, "hybrid_log", events, 0, polling_batches).await?;
            }
            Err(FetchError::Interrupted) => return Ok(()),
            Err(FetchError::Upstream(err)) => {
                ctx.batch_failed("hybrid_log", &err);
                ctx.flush().await?;
            }
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
        if !ctx.between_batches().await {
            return Ok(());
        }
    }

    api_polling(ctx, offset).await
}
