//! Integration tests for the job lifecycle: creation, execution, pause and
//! resume, cancellation, retries and the concurrency cap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use webhook_backfill::backfill::{
    BackfillError, BackfillStrategy, EngineSettings, ErrorCategory, EventFilters, JobConfigOverrides,
    JobFilter, JobProcessor, JobStatus, NewJob, RetryPolicy, TimeWindow, TimelineKind,
};
use webhook_backfill::connectors::{ConnectorError, Cursor, EventPage, EventSource, UpstreamEvent};

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::{
    RecordingExecutor, StaticEventSource, capability, engine, event, fast_settings, hours_ago,
    spread_events, wait_for_job, wait_until_settled,
};

fn two_hour_window() -> TimeWindow {
    let end = hours_ago(1);
    TimeWindow::new(end - chrono::Duration::hours(2), end)
}

fn new_job(connector_id: &str, window: TimeWindow) -> NewJob {
    NewJob {
        connector_id: connector_id.to_string(),
        workflow_id: "wf-orders".to_string(),
        user_id: "user-1".to_string(),
        window,
        strategy: None,
        config: None,
        downtime_id: None,
    }
}

fn with_batch_size(mut request: NewJob, batch_size: u32) -> NewJob {
    request.config = Some(JobConfigOverrides {
        batch_size: Some(batch_size),
        ..JobConfigOverrides::default()
    });
    request
}

fn source(events: Vec<UpstreamEvent>) -> Arc<dyn EventSource> {
    Arc::new(StaticEventSource::new(events))
}

#[tokio::test]
async fn create_job_selects_strategy_and_estimates_work() {
    let engine = engine(
        vec![(capability("stripe"), source(Vec::new()))],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let job = engine
        .manager
        .create_job(new_job("stripe", two_hour_window()))
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    // stripe has cursors and an event log; two hours falls in the cursor band
    assert_eq!(job.strategy, BackfillStrategy::CursorBased);
    assert_eq!(job.progress.total_events, 200);
    assert_eq!(job.progress.total_batches, 2);
    assert_eq!(job.max_retries, 2);
    assert!(job.started_at.is_none());
    assert_eq!(job.timeline.len(), 1);
    assert_eq!(job.timeline[0].kind, TimelineKind::Created);

    let stored = engine.manager.get_job(job.id).await.unwrap();
    assert_eq!(stored, job);
}

#[tokio::test]
async fn create_job_rejects_invalid_requests() {
    let engine = engine(
        vec![
            (capability("stripe"), source(Vec::new())),
            (capability("slack"), source(Vec::new())),
            (capability("typeform"), source(Vec::new())),
            (capability("discord"), source(Vec::new())),
        ],
        RecordingExecutor::default(),
        fast_settings(),
    );
    let manager = &engine.manager;

    let err = manager
        .create_job(new_job("myspace", two_hour_window()))
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::UnsupportedConnector(ref id) if id == "myspace"));

    // listed but flagged unsupported
    let err = manager
        .create_job(new_job("discord", two_hour_window()))
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::UnsupportedConnector(_)));

    // supported in the catalogue but no event source wired
    let err = manager
        .create_job(new_job("gitlab", two_hour_window()))
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::UnsupportedConnector(_)));

    let inverted = TimeWindow::new(hours_ago(1), hours_ago(3));
    let err = manager.create_job(new_job("stripe", inverted)).await.unwrap_err();
    assert!(matches!(err, BackfillError::InvalidWindow(_)));

    let future = TimeWindow::new(hours_ago(1), Utc::now() + chrono::Duration::hours(2));
    let err = manager.create_job(new_job("stripe", future)).await.unwrap_err();
    assert!(matches!(err, BackfillError::InvalidWindow(_)));

    // slack keeps one week of history
    let too_old = TimeWindow::new(hours_ago(200), hours_ago(190));
    let err = manager.create_job(new_job("slack", too_old)).await.unwrap_err();
    assert!(matches!(
        err,
        BackfillError::WindowExceedsLookback {
            max_lookback_hours: 168,
            ..
        }
    ));

    let mut request = new_job("typeform", two_hour_window());
    request.strategy = Some(BackfillStrategy::CursorBased);
    let err = manager.create_job(request).await.unwrap_err();
    assert!(matches!(
        err,
        BackfillError::UnsupportedStrategy {
            strategy: BackfillStrategy::CursorBased,
            ..
        }
    ));

    let listed = manager.list_jobs(&JobFilter::default()).await.unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn empty_window_is_accepted() {
    let engine = engine(
        vec![(capability("stripe"), source(Vec::new()))],
        RecordingExecutor::default(),
        fast_settings(),
    );
    let instant = hours_ago(2);

    let job = engine
        .manager
        .create_job(new_job("stripe", TimeWindow::new(instant, instant)))
        .await
        .unwrap();
    assert_eq!(job.progress.total_events, 0);
    assert_eq!(job.progress.total_batches, 1);

    engine.manager.start_job(job.id).await.unwrap();
    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.processed, 0);
}

#[tokio::test]
async fn cursor_job_delivers_every_event_and_records_them() {
    let window = two_hour_window();
    let events = spread_events(&window, 12);
    let engine = engine(
        vec![(capability("stripe"), source(events))],
        RecordingExecutor::rejecting(&["evt-3"]),
        fast_settings(),
    );

    let job = engine
        .manager
        .create_job(with_batch_size(new_job("stripe", window), 5))
        .await
        .unwrap();
    let started = engine.manager.start_job(job.id).await.unwrap();
    assert_eq!(started.status, JobStatus::Running);
    assert!(started.started_at.is_some());

    let done = wait_until_settled(&engine.manager, job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(done.progress.processed, 12);
    assert_eq!(done.progress.successful, 11);
    assert_eq!(done.progress.failed, 1);
    assert_eq!(done.progress.duplicates, 0);
    assert!(done.progress.is_consistent());
    assert_eq!(done.progress.current_batch, 3);
    assert_eq!(done.progress.total_batches, 3);
    assert!(done.checkpoint_cursor.is_none());

    let execution_failures: Vec<_> = done
        .errors
        .iter()
        .filter(|error| error.category == ErrorCategory::ExecutionFailed)
        .collect();
    assert_eq!(execution_failures.len(), 1);
    assert_eq!(execution_failures[0].details["event_id"], "evt-3");

    let kinds: Vec<_> = done.timeline.iter().map(|entry| entry.kind).collect();
    assert_eq!(kinds.first(), Some(&TimelineKind::Created));
    assert!(kinds.contains(&TimelineKind::Started));
    assert_eq!(
        kinds.iter().filter(|kind| **kind == TimelineKind::BatchCompleted).count(),
        3
    );
    assert_eq!(kinds.last(), Some(&TimelineKind::Completed));

    assert_eq!(engine.executor.delivered().len(), 11);

    let recovered = engine.manager.recovered_events(job.id, 100).await.unwrap();
    assert_eq!(recovered.len(), 12);
    let failed: Vec<_> = recovered.iter().filter(|event| !event.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].original_event_id, "evt-3");
    assert!(failed[0].execution_id.is_none());
    assert!(
        recovered
            .iter()
            .filter(|event| event.success)
            .all(|event| event.execution_id.is_some() && event.source_connector == "stripe")
    );
}

#[tokio::test]
async fn duplicates_and_filtered_events_are_not_executed() {
    let window = two_hour_window();
    let at = window.start + chrono::Duration::minutes(10);
    let mut refund = event("evt-refund", at);
    refund.event_type = "refund.created".to_string();
    let events = vec![
        event("evt-a", at),
        event("evt-a", at),
        event("evt-b", at + chrono::Duration::minutes(5)),
        refund,
    ];
    let engine = engine(
        vec![(capability("typeform"), source(events))],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let mut request = new_job("typeform", window);
    request.strategy = Some(BackfillStrategy::TimestampScan);
    request.config = Some(JobConfigOverrides {
        filters: Some(EventFilters {
            event_types: vec!["order.created".to_string()],
            priorities: Vec::new(),
        }),
        ..JobConfigOverrides::default()
    });
    let job = engine.manager.create_job(request).await.unwrap();
    engine.manager.start_job(job.id).await.unwrap();

    let done = wait_until_settled(&engine.manager, job.id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.successful, 2);
    assert_eq!(done.progress.skipped, 1);
    assert_eq!(done.progress.duplicates, 1);
    assert_eq!(done.progress.processed, 3);
    let mut delivered = engine.executor.delivered();
    delivered.sort();
    assert_eq!(delivered, vec!["evt-a".to_string(), "evt-b".to_string()]);
}

#[tokio::test]
async fn paused_job_resumes_without_redelivering() {
    let window = two_hour_window();
    let events = spread_events(&window, 30);
    let slow: Arc<dyn EventSource> =
        Arc::new(StaticEventSource::new(events).with_latency(Duration::from_millis(50)));
    let engine = engine(
        vec![(capability("stripe"), slow)],
        RecordingExecutor::default(),
        fast_settings(),
    );

    // 200 estimated events in batches of 20 -> 10 polled sub-windows
    let mut request = with_batch_size(new_job("stripe", window), 20);
    request.strategy = Some(BackfillStrategy::ApiPolling);
    let job = engine.manager.create_job(request).await.unwrap();
    engine.manager.start_job(job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(130)).await;
    let paused = engine.manager.pause_job(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);

    let parked = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(parked.status, JobStatus::Paused);
    assert!(parked.progress.current_batch > 0);
    assert!(parked.progress.current_batch < parked.progress.total_batches);
    let delivered_before = engine.executor.delivered().len();
    assert!(delivered_before < 30);

    // pausing twice is not a valid transition
    let err = engine.manager.pause_job(job.id).await.unwrap_err();
    assert!(matches!(
        err,
        BackfillError::InvalidStateTransition {
            from: JobStatus::Paused,
            action: "pause"
        }
    ));

    let resumed = engine.manager.start_job(job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    assert_eq!(resumed.started_at, parked.started_at);

    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.successful, 30);
    assert_eq!(done.progress.duplicates, 0);
    assert_eq!(done.progress.current_batch, 10);

    let mut delivered = engine.executor.delivered();
    assert_eq!(delivered.len(), 30);
    delivered.sort();
    delivered.dedup();
    assert_eq!(delivered.len(), 30);

    let kinds: Vec<_> = done.timeline.iter().map(|entry| entry.kind).collect();
    assert!(kinds.contains(&TimelineKind::Paused));
    assert!(kinds.contains(&TimelineKind::Resumed));
}

#[tokio::test]
async fn cancel_stops_running_and_pending_jobs() {
    let window = two_hour_window();
    let slow: Arc<dyn EventSource> = Arc::new(
        StaticEventSource::new(spread_events(&window, 30)).with_latency(Duration::from_millis(50)),
    );
    let engine = engine(
        vec![(capability("stripe"), slow)],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let mut request = with_batch_size(new_job("stripe", window), 20);
    request.strategy = Some(BackfillStrategy::ApiPolling);
    let running = engine.manager.create_job(request.clone()).await.unwrap();
    let pending = engine.manager.create_job(request).await.unwrap();

    engine.manager.start_job(running.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let cancelled = engine.manager.cancel_job(running.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let settled = wait_until_settled(&engine.manager, running.id).await;
    assert_eq!(settled.status, JobStatus::Cancelled);
    assert!(settled.progress.current_batch < settled.progress.total_batches);
    assert!(!engine.manager.is_running(running.id));

    let cancelled = engine.manager.cancel_job(pending.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(
        cancelled.timeline.last().map(|entry| entry.kind),
        Some(TimelineKind::Cancelled)
    );

    // terminal jobs cannot be cancelled or started again
    let err = engine.manager.cancel_job(pending.id).await.unwrap_err();
    assert!(matches!(err, BackfillError::InvalidStateTransition { action: "cancel", .. }));
    let err = engine.manager.start_job(pending.id).await.unwrap_err();
    assert!(matches!(err, BackfillError::InvalidStateTransition { action: "start", .. }));
}

#[tokio::test]
async fn failed_job_can_be_retried_until_the_limit() {
    let failing: Arc<dyn EventSource> = Arc::new(StaticEventSource::new(Vec::new()).with_log_error(
        ConnectorError::HttpError {
            status: 400,
            body: Some("bad request".to_string()),
        },
    ));
    let engine = engine(
        vec![(capability("stripe"), failing)],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let mut request = new_job("stripe", two_hour_window());
    request.strategy = Some(BackfillStrategy::EventLogReplay);
    request.config = Some(JobConfigOverrides {
        retry_policy: Some(RetryPolicy {
            max_retries: 1,
            backoff_multiplier: 2.0,
            initial_delay_ms: 5,
            max_delay_ms: 10,
        }),
        ..JobConfigOverrides::default()
    });
    let job = engine.manager.create_job(request).await.unwrap();

    // only failed or partially completed jobs are retryable
    let err = engine.manager.retry_job(job.id).await.unwrap_err();
    assert!(matches!(err, BackfillError::InvalidStateTransition { action: "retry", .. }));

    engine.manager.start_job(job.id).await.unwrap();
    let failed = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.last_error.as_deref().unwrap().contains("400"));
    let fatal = failed.errors.last().unwrap();
    assert_eq!(fatal.category, ErrorCategory::FetchFailed);
    assert!(!fatal.retryable);
    assert_eq!(
        failed.timeline.last().map(|entry| entry.kind),
        Some(TimelineKind::Failed)
    );

    let requeued = engine.manager.retry_job(job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.last_error.is_none());
    assert!(requeued.completed_at.is_none());
    assert_eq!(requeued.progress.current_batch, 0);

    engine.manager.start_job(job.id).await.unwrap();
    let failed_again = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(failed_again.status, JobStatus::Failed);

    let err = engine.manager.retry_job(job.id).await.unwrap_err();
    assert!(matches!(
        err,
        BackfillError::RetryLimitReached { max_retries: 1, .. }
    ));
}

/// Source whose every fetch panics, as a buggy connector would.
struct PanickingSource;

#[async_trait]
impl EventSource for PanickingSource {
    async fn poll_range(&self, _window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        panic!("connector bug while polling");
    }

    async fn fetch_event_log(
        &self,
        _window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        panic!("connector bug while reading the event log");
    }

    async fn fetch_page(
        &self,
        _window: &TimeWindow,
        _cursor: Option<&Cursor>,
        _limit: u32,
    ) -> Result<EventPage, ConnectorError> {
        panic!("connector bug while paging");
    }

    async fn list_events(&self, _window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        panic!("connector bug while listing");
    }
}

#[tokio::test]
async fn panicking_connector_fails_the_job_and_frees_its_slot() {
    let engine = engine(
        vec![(capability("stripe"), Arc::new(PanickingSource) as Arc<dyn EventSource>)],
        RecordingExecutor::default(),
        fast_settings(),
    );
    let mut request = new_job("stripe", two_hour_window());
    request.strategy = Some(BackfillStrategy::ApiPolling);
    let job = engine.manager.create_job(request).await.unwrap();
    engine.manager.start_job(job.id).await.unwrap();

    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.completed_at.is_some());
    let last_error = done.last_error.as_deref().unwrap();
    assert!(last_error.contains("aborted"), "last error: {}", last_error);
    let fatal = done.errors.last().unwrap();
    assert_eq!(fatal.category, ErrorCategory::Internal);
    assert!(!fatal.retryable);
    assert!(!engine.manager.is_running(job.id));
    assert!(
        done.timeline
            .iter()
            .any(|entry| entry.kind == TimelineKind::Failed)
    );
}

#[tokio::test]
async fn pause_during_fetch_backoff_replays_the_window_on_resume() {
    let window = two_hour_window();
    let flaky: Arc<dyn EventSource> =
        Arc::new(StaticEventSource::new(spread_events(&window, 4)).with_unavailable_polls(1));
    let engine = engine(
        vec![(capability("stripe"), flaky)],
        RecordingExecutor::default(),
        fast_settings(),
    );

    // 200 estimated events in batches of 100 -> 2 polled sub-windows
    let mut request = new_job("stripe", window);
    request.strategy = Some(BackfillStrategy::ApiPolling);
    request.config = Some(JobConfigOverrides {
        retry_policy: Some(RetryPolicy {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 10_000,
            max_delay_ms: 60_000,
        }),
        ..JobConfigOverrides::default()
    });
    let job = engine.manager.create_job(request).await.unwrap();
    engine.manager.start_job(job.id).await.unwrap();

    // the first poll answers 503 and the run waits out a 10s backoff
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.manager.pause_job(job.id).await.unwrap();

    let parked = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(parked.status, JobStatus::Paused);
    assert_eq!(parked.progress.current_batch, 0);
    assert!(parked.errors.is_empty());
    assert!(engine.executor.delivered().is_empty());

    engine.manager.start_job(job.id).await.unwrap();
    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.successful, 4);
    assert_eq!(done.progress.current_batch, 2);
    assert!(done.errors.is_empty());
    assert!(
        !done.timeline
            .iter()
            .any(|entry| entry.kind == TimelineKind::BatchFailed)
    );
    assert_eq!(engine.executor.delivered().len(), 4);
}

#[tokio::test]
async fn restarting_while_the_old_run_stops_asks_to_retry() {
    let window = two_hour_window();
    let slow: Arc<dyn EventSource> = Arc::new(
        StaticEventSource::new(spread_events(&window, 4)).with_latency(Duration::from_millis(500)),
    );
    let engine = engine(
        vec![(capability("stripe"), slow)],
        RecordingExecutor::default(),
        fast_settings(),
    );
    let mut request = new_job("stripe", window);
    request.strategy = Some(BackfillStrategy::ApiPolling);
    let job = engine.manager.create_job(request).await.unwrap();
    engine.manager.start_job(job.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.manager.pause_job(job.id).await.unwrap();

    // the first poll is still in flight, so the old run holds its slot
    let err = engine.manager.start_job(job.id).await.unwrap_err();
    assert!(matches!(err, BackfillError::PreviousRunActive(id) if id == job.id));
    let still_paused = engine.manager.get_job(job.id).await.unwrap();
    assert_eq!(still_paused.status, JobStatus::Paused);

    wait_until_settled(&engine.manager, job.id).await;
    engine.manager.start_job(job.id).await.unwrap();
    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(engine.executor.delivered().len(), 4);
}

#[tokio::test]
async fn late_fatal_failure_counts_as_partial_completion() {
    let window = two_hour_window();
    // 150 events over two estimated batches of 100; the second page fails
    let source: Arc<dyn EventSource> =
        Arc::new(StaticEventSource::new(spread_events(&window, 150)).with_page_error_from(100));
    let engine = engine(
        vec![(capability("stripe"), source)],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let job = engine
        .manager
        .create_job(new_job("stripe", window))
        .await
        .unwrap();
    assert_eq!(job.strategy, BackfillStrategy::CursorBased);
    engine.manager.start_job(job.id).await.unwrap();

    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::PartiallyCompleted);
    assert_eq!(done.progress.successful, 100);
    assert_eq!(done.progress.current_batch, 1);
    assert!(done.last_error.is_some());
    assert_eq!(
        done.timeline.last().map(|entry| entry.kind),
        Some(TimelineKind::PartiallyCompleted)
    );

    let requeued = engine.manager.retry_job(job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.checkpoint_cursor.is_none());
    assert_eq!(requeued.progress.successful, 0);
}

#[tokio::test]
async fn hybrid_falls_back_to_polling_without_event_log() {
    let window = two_hour_window();
    let source: Arc<dyn EventSource> = Arc::new(
        StaticEventSource::new(spread_events(&window, 8)).with_log_error(
            ConnectorError::EventLogUnavailable {
                connector: "stripe".to_string(),
            },
        ),
    );
    let engine = engine(
        vec![(capability("stripe"), source)],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let mut request = new_job("stripe", window);
    request.strategy = Some(BackfillStrategy::Hybrid);
    let job = engine.manager.create_job(request).await.unwrap();
    engine.manager.start_job(job.id).await.unwrap();

    let done = wait_until_settled(&engine.manager, job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.successful, 8);
    assert!(
        done.errors
            .iter()
            .any(|error| error.category == ErrorCategory::EventLogUnavailable)
    );
    assert_eq!(engine.executor.delivered().len(), 8);
}

#[tokio::test]
async fn concurrency_cap_rejects_then_processor_starts_pending_jobs() {
    let window = two_hour_window();
    let slow: Arc<dyn EventSource> = Arc::new(
        StaticEventSource::new(spread_events(&window, 3)).with_latency(Duration::from_millis(150)),
    );
    let settings = EngineSettings {
        max_concurrent_jobs: 1,
        ..fast_settings()
    };
    let engine = engine(
        vec![(capability("typeform"), slow)],
        RecordingExecutor::default(),
        settings,
    );

    let mut request = new_job("typeform", window);
    request.strategy = Some(BackfillStrategy::TimestampScan);
    let first = engine.manager.create_job(request.clone()).await.unwrap();
    let second = engine.manager.create_job(request).await.unwrap();

    engine.manager.start_job(first.id).await.unwrap();
    assert_eq!(engine.manager.running_count(), 1);
    assert_eq!(engine.manager.available_capacity(), 0);

    let err = engine.manager.start_job(second.id).await.unwrap_err();
    assert!(matches!(err, BackfillError::ConcurrencyLimitExceeded { limit: 1 }));
    let still_pending = engine.manager.get_job(second.id).await.unwrap();
    assert_eq!(still_pending.status, JobStatus::Pending);

    let processor = JobProcessor::new(engine.manager.clone());
    let busy = processor.tick().await.unwrap();
    assert_eq!(busy.capacity, 0);
    assert_eq!(busy.started, 0);

    wait_until_settled(&engine.manager, first.id).await;

    let tick = processor.tick().await.unwrap();
    assert_eq!(tick.capacity, 1);
    assert_eq!(tick.pending_seen, 1);
    assert_eq!(tick.started, 1);

    let done = wait_for_job(&engine.manager, second.id, |job| job.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress.successful, 3);
}

#[tokio::test]
async fn background_processor_picks_up_pending_jobs() {
    let window = two_hour_window();
    let engine = engine(
        vec![(capability("stripe"), source(spread_events(&window, 4)))],
        RecordingExecutor::default(),
        fast_settings(),
    );
    let job = engine
        .manager
        .create_job(new_job("stripe", window))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let processor = JobProcessor::new(engine.manager.clone())
        .with_tick_interval(Duration::from_millis(20));
    let handle = tokio::spawn(processor.run(shutdown.clone()));

    let done = wait_for_job(&engine.manager, job.id, |job| job.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(engine.executor.delivered().len(), 4);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn list_jobs_filters_and_orders_newest_first() {
    let engine = engine(
        vec![
            (capability("stripe"), source(Vec::new())),
            (capability("typeform"), source(Vec::new())),
        ],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let mut created = Vec::new();
    for connector in ["stripe", "typeform", "stripe"] {
        let job = engine
            .manager
            .create_job(new_job(connector, two_hour_window()))
            .await
            .unwrap();
        created.push(job.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.manager.cancel_job(created[0]).await.unwrap();

    let all = engine.manager.list_jobs(&JobFilter::default()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![created[2], created[1], created[0]]);

    let stripe = engine
        .manager
        .list_jobs(&JobFilter {
            connector_id: Some("stripe".to_string()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(stripe.len(), 2);

    let pending = engine
        .manager
        .list_jobs(&JobFilter::with_status(JobStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    let limited = engine
        .manager
        .list_jobs(&JobFilter {
            limit: Some(1),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, created[2]);
}

#[tokio::test]
async fn purge_removes_finished_jobs_and_their_events() {
    let window = two_hour_window();
    let engine = engine(
        vec![(capability("typeform"), source(spread_events(&window, 2)))],
        RecordingExecutor::default(),
        fast_settings(),
    );

    let done = engine
        .manager
        .create_job(new_job("typeform", window))
        .await
        .unwrap();
    let kept = engine
        .manager
        .create_job(new_job("typeform", window))
        .await
        .unwrap();
    engine.manager.start_job(done.id).await.unwrap();
    wait_until_settled(&engine.manager, done.id).await;

    let purged = engine
        .manager
        .purge(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    let err = engine.manager.get_job(done.id).await.unwrap_err();
    assert!(matches!(err, BackfillError::JobNotFound(_)));
    let err = engine.manager.recovered_events(done.id, 10).await.unwrap_err();
    assert!(matches!(err, BackfillError::JobNotFound(_)));
    assert!(engine.manager.get_job(kept.id).await.is_ok());
}
