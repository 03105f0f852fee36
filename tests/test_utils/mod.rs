//! Shared fixtures for the integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, scripted
//! event sources and executors, and helpers that wire a [`BackfillManager`]
//! or a full [`AppState`] around them.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webhook_backfill::backfill::{
    BackfillJob, BackfillManager, BackfillStore, EngineSettings, JobConfig, JobStatus,
    MemoryStore, RetryPolicy, TimeWindow,
};
use webhook_backfill::config::AppConfig;
use webhook_backfill::connectors::{
    ConnectorCapability, ConnectorError, ConnectorRegistry, Cursor, EventPage, EventSource,
    UpstreamEvent, builtin_catalog,
};
use webhook_backfill::downtime::{HealthProbe, ProbeOutcome};
use webhook_backfill::execution::{ExecutionError, WorkflowExecutor};
use webhook_backfill::server::AppState;

pub const OPERATOR_TOKEN: &str = "test-operator-token";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(hours)
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}

pub fn event(id: &str, timestamp: DateTime<Utc>) -> UpstreamEvent {
    UpstreamEvent {
        id: id.to_string(),
        timestamp,
        event_type: "order.created".to_string(),
        priority: None,
        payload: serde_json::json!({ "id": id }),
    }
}

/// `count` events spread evenly across `window`, ids `evt-0..`.
pub fn spread_events(window: &TimeWindow, count: usize) -> Vec<UpstreamEvent> {
    let step = window.duration() / (count as i32 + 1);
    (0..count)
        .map(|index| event(&format!("evt-{}", index), window.start + step * (index as i32 + 1)))
        .collect()
}

/// Catalogue capability with upstream pacing switched off.
pub fn capability(id: &str) -> ConnectorCapability {
    let mut capability = builtin_catalog()
        .into_iter()
        .find(|capability| capability.id == id)
        .unwrap_or_else(|| panic!("connector '{}' missing from catalogue", id));
    capability.rate_limits.requests_per_minute = 0;
    capability
}

/// Event source that serves a fixed event list for every fetch shape.
#[derive(Default)]
pub struct StaticEventSource {
    events: Vec<UpstreamEvent>,
    /// Fixed latency added to every fetch
    latency: Duration,
    log_error: Option<ConnectorError>,
    /// Pages starting at or past this offset fail with a client error
    page_error_from: Option<usize>,
    /// Polls still to answer with 503 before serving events
    unavailable_polls: Mutex<u32>,
    fetches: Mutex<u32>,
}

impl StaticEventSource {
    pub fn new(events: Vec<UpstreamEvent>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_log_error(mut self, error: ConnectorError) -> Self {
        self.log_error = Some(error);
        self
    }

    pub fn with_page_error_from(mut self, offset: usize) -> Self {
        self.page_error_from = Some(offset);
        self
    }

    pub fn with_unavailable_polls(self, count: u32) -> Self {
        *self.unavailable_polls.lock().unwrap() = count;
        self
    }

    pub fn fetches(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }

    async fn in_window(&self, window: &TimeWindow) -> Vec<UpstreamEvent> {
        *self.fetches.lock().unwrap() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.events
            .iter()
            .filter(|event| window.contains(event.timestamp))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSource for StaticEventSource {
    async fn poll_range(&self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        {
            let mut remaining = self.unavailable_polls.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                *self.fetches.lock().unwrap() += 1;
                return Err(ConnectorError::HttpError {
                    status: 503,
                    body: Some("upstream unavailable".to_string()),
                });
            }
        }
        Ok(self.in_window(window).await)
    }

    async fn fetch_event_log(
        &self,
        window: &TimeWindow,
    ) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        if let Some(error) = &self.log_error {
            *self.fetches.lock().unwrap() += 1;
            return Err(error.clone());
        }
        Ok(self.in_window(window).await)
    }

    /// Pages are offsets into the in-window list, encoded as JSON numbers.
    async fn fetch_page(
        &self,
        window: &TimeWindow,
        cursor: Option<&Cursor>,
        limit: u32,
    ) -> Result<EventPage, ConnectorError> {
        let events = self.in_window(window).await;
        let offset = cursor
            .and_then(|cursor| cursor.as_json().as_u64())
            .unwrap_or(0) as usize;
        if self.page_error_from.is_some_and(|from| offset >= from) {
            return Err(ConnectorError::HttpError {
                status: 400,
                body: Some("cursor expired".to_string()),
            });
        }
        let end = (offset + limit.max(1) as usize).min(events.len());
        let page = events.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();

        Ok(EventPage {
            events: page,
            next_cursor: (end < events.len()).then(|| Cursor::from_json(serde_json::json!(end))),
        })
    }

    async fn list_events(&self, window: &TimeWindow) -> Result<Vec<UpstreamEvent>, ConnectorError> {
        Ok(self.in_window(window).await)
    }
}

/// Executor that records every delivered event id.
#[derive(Default)]
pub struct RecordingExecutor {
    rejected: HashSet<String>,
    delivered: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    /// Events with these ids fail permanently.
    pub fn rejecting(ids: &[&str]) -> Self {
        Self {
            rejected: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowExecutor for RecordingExecutor {
    async fn execute(
        &self,
        _workflow_id: &str,
        _job_id: Uuid,
        event: &UpstreamEvent,
    ) -> Result<String, ExecutionError> {
        if self.rejected.contains(&event.id) {
            return Err(ExecutionError::permanent("workflow rejected the event"));
        }
        self.delivered.lock().unwrap().push(event.id.clone());
        Ok(format!("exec-{}", event.id))
    }
}

/// Probe returning whatever outcome the test sets last.
pub struct ScriptedProbe {
    outcome: Mutex<ProbeOutcome>,
}

impl ScriptedProbe {
    pub fn healthy() -> Self {
        Self {
            outcome: Mutex::new(ProbeOutcome::Healthy),
        }
    }

    pub fn set(&self, outcome: ProbeOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _url: &str) -> ProbeOutcome {
        self.outcome.lock().unwrap().clone()
    }
}

/// Engine settings with no inter-batch delay and millisecond retry backoff.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        job_defaults: JobConfig {
            delay_between_batches_ms: 0,
            timeout_per_request_ms: 5_000,
            retry_policy: RetryPolicy {
                max_retries: 2,
                backoff_multiplier: 2.0,
                initial_delay_ms: 5,
                max_delay_ms: 20,
            },
            ..JobConfig::default()
        },
        ..EngineSettings::default()
    }
}

pub fn registry_with(
    sources: Vec<(ConnectorCapability, Arc<dyn EventSource>)>,
) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    for capability in builtin_catalog() {
        registry.register(capability, None);
    }
    for (capability, source) in sources {
        registry.register(capability, Some(source));
    }
    registry
}

pub struct Engine {
    pub manager: BackfillManager,
    pub store: Arc<dyn BackfillStore>,
    pub executor: Arc<RecordingExecutor>,
}

pub fn engine(
    sources: Vec<(ConnectorCapability, Arc<dyn EventSource>)>,
    executor: RecordingExecutor,
    settings: EngineSettings,
) -> Engine {
    let store: Arc<dyn BackfillStore> = Arc::new(MemoryStore::new());
    let executor = Arc::new(executor);
    let manager = BackfillManager::new(
        Arc::clone(&store),
        Arc::new(registry_with(sources)),
        executor.clone(),
        settings,
    );
    Engine {
        manager,
        store,
        executor,
    }
}

/// Poll the job until `done` holds, failing after five seconds.
pub async fn wait_for_job<F>(manager: &BackfillManager, id: Uuid, done: F) -> BackfillJob
where
    F: Fn(&BackfillJob) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = manager.get_job(id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the job is terminal and its run has released its slot.
pub async fn wait_until_settled(manager: &BackfillManager, id: Uuid) -> BackfillJob {
    let job = wait_for_job(manager, id, |job| {
        job.status.is_terminal() || job.status == JobStatus::Paused
    })
    .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.is_running(id) {
        assert!(tokio::time::Instant::now() < deadline, "job {} never released", id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.get_job(id).await.unwrap_or(job)
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        ..AppConfig::default()
    };
    config.engine.default_delay_ms = 0;
    config.retry.initial_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.downtime.grace_period_seconds = 3_600;
    config
}

pub struct TestApp {
    pub state: AppState,
    pub executor: Arc<RecordingExecutor>,
    pub probe: Arc<ScriptedProbe>,
    pub shutdown: CancellationToken,
}

pub fn test_app(
    config: AppConfig,
    store: Arc<dyn BackfillStore>,
    sources: Vec<(ConnectorCapability, Arc<dyn EventSource>)>,
) -> TestApp {
    let executor = Arc::new(RecordingExecutor::default());
    let probe = Arc::new(ScriptedProbe::healthy());
    let shutdown = CancellationToken::new();
    let state = AppState::new(
        Arc::new(config),
        store,
        registry_with(sources),
        executor.clone(),
        probe.clone(),
        shutdown.clone(),
    );
    TestApp {
        state,
        executor,
        probe,
        shutdown,
    }
}
