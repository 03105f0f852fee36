//! Job Lifecycle Manager
//!
//! Owns the job state machine, the global running-jobs set used for the
//! concurrency cap and the per-job dedup seen-sets kept across pause/resume.
//! Every job mutation is a read-modify-write under one write lock, so a
//! running job's progress updates never clobber a concurrent pause or cancel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

use crate::backfill::error::BackfillError;
use crate::backfill::guard::DedupGuard;
use crate::backfill::store::BackfillStore;
use crate::backfill::strategy::{
    self, ProgressSink, ProgressUpdate, RunContext, RunError, RunParts, select_strategy,
    total_batches,
};
use crate::backfill::types::{
    BackfillErrorRecord, BackfillJob, BackfillStrategy, JobConfig, JobConfigOverrides, JobFilter,
    JobProgress, JobStatus, RecoveredEvent, RetryPolicy, TimeWindow, TimelineKind,
};
use crate::config::AppConfig;
use crate::connectors::{ConnectorCapability, ConnectorRegistry, EventSource};
use crate::execution::WorkflowExecutor;

/// Engine-wide knobs
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_concurrent_jobs: usize,
    pub processor_tick: Duration,
    pub clock_skew: chrono::Duration,
    /// Share of batches that must be done for a fatal run to count as partial
    pub partial_completion_quota: f64,
    pub job_defaults: JobConfig,
    pub max_recorded_events: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            processor_tick: Duration::from_secs(10),
            clock_skew: chrono::Duration::seconds(60),
            partial_completion_quota: 0.5,
            job_defaults: JobConfig::default(),
            max_recorded_events: 1_000,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let engine = &config.engine;
        let retry = &config.retry;
        Self {
            max_concurrent_jobs: engine.max_concurrent_jobs,
            processor_tick: Duration::from_secs(engine.processor_tick_seconds),
            clock_skew: chrono::Duration::seconds(engine.clock_skew_seconds),
            partial_completion_quota: engine.partial_completion_quota,
            job_defaults: JobConfig {
                batch_size: engine.default_batch_size,
                delay_between_batches_ms: engine.default_delay_ms,
                timeout_per_request_ms: engine.default_timeout_ms,
                retry_policy: RetryPolicy {
                    max_retries: retry.max_retries,
                    backoff_multiplier: retry.backoff_multiplier,
                    initial_delay_ms: retry.initial_delay_ms,
                    max_delay_ms: retry.max_delay_ms,
                },
                ..JobConfig::default()
            },
            max_recorded_events: engine.max_recorded_events,
        }
    }
}

/// Parameters for a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub connector_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub window: TimeWindow,
    pub strategy: Option<BackfillStrategy>,
    pub config: Option<JobConfigOverrides>,
    pub downtime_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct BackfillManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: Arc<dyn BackfillStore>,
    registry: Arc<ConnectorRegistry>,
    executor: Arc<dyn WorkflowExecutor>,
    settings: EngineSettings,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Dedup seen-sets of paused jobs, restored on resume
    parked: Mutex<HashMap<Uuid, DedupGuard>>,
    write_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BackfillManager {
    pub fn new(
        store: Arc<dyn BackfillStore>,
        registry: Arc<ConnectorRegistry>,
        executor: Arc<dyn WorkflowExecutor>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                registry,
                executor,
                settings,
                running: Mutex::new(HashMap::new()),
                parked: Mutex::new(HashMap::new()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> Arc<dyn BackfillStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn registry(&self) -> Arc<ConnectorRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.inner.running).len()
    }

    pub fn available_capacity(&self) -> usize {
        self.inner
            .settings
            .max_concurrent_jobs
            .saturating_sub(self.running_count())
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        lock(&self.inner.running).contains_key(&id)
    }

    /// Validate and persist a new `pending` job.
    #[instrument(skip(self, request), fields(connector_id = %request.connector_id, workflow_id = %request.workflow_id))]
    pub async fn create_job(&self, request: NewJob) -> Result<BackfillJob, BackfillError> {
        let capability = self.supported_capability(&request.connector_id)?;
        self.validate_window(&capability, &request.window)?;

        let strategy = match request.strategy {
            Some(strategy) if capability.supports(strategy) => strategy,
            Some(strategy) => {
                return Err(BackfillError::UnsupportedStrategy {
                    connector: capability.id.clone(),
                    strategy,
                });
            }
            None => select_strategy(&capability, &request.window),
        };

        let config = JobConfig::merged(&self.inner.settings.job_defaults, request.config);
        let estimated = capability.estimate_events(&request.window);
        let now = Utc::now();

        let mut job = BackfillJob {
            id: Uuid::new_v4(),
            connector_id: request.connector_id,
            workflow_id: request.workflow_id,
            user_id: request.user_id,
            window: request.window,
            status: JobStatus::Pending,
            strategy,
            progress: JobProgress {
                total_events: estimated,
                total_batches: total_batches(estimated, config.batch_size),
                ..JobProgress::default()
            },
            max_retries: config.retry_policy.max_retries,
            config,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            retry_count: 0,
            errors: Vec::new(),
            timeline: Vec::new(),
            checkpoint_cursor: None,
            downtime_id: request.downtime_id,
        };
        job.push_timeline(
            TimelineKind::Created,
            format!("created with strategy {} (~{} events)", strategy, estimated),
        );

        self.inner.store.insert_job(&job).await?;
        counter!("backfill_jobs_created_total").increment(1);
        info!(job_id = %job.id, %strategy, estimated, "backfill job created");
        Ok(job)
    }

    fn supported_capability(&self, connector_id: &str) -> Result<ConnectorCapability, BackfillError> {
        let registry = &self.inner.registry;
        if !registry.is_supported(connector_id) {
            return Err(BackfillError::UnsupportedConnector(connector_id.to_string()));
        }
        registry
            .capability(connector_id)
            .cloned()
            .map_err(|_| BackfillError::UnsupportedConnector(connector_id.to_string()))
    }

    fn validate_window(
        &self,
        capability: &ConnectorCapability,
        window: &TimeWindow,
    ) -> Result<(), BackfillError> {
        let now = Utc::now();
        if window.start > window.end {
            return Err(BackfillError::InvalidWindow(
                "start must not be after end".to_string(),
            ));
        }
        if window.end > now + self.inner.settings.clock_skew {
            return Err(BackfillError::InvalidWindow(
                "end lies in the future".to_string(),
            ));
        }
        let lookback = chrono::Duration::hours(i64::from(capability.max_lookback_hours));
        if window.start < now - lookback {
            return Err(BackfillError::WindowExceedsLookback {
                connector: capability.id.clone(),
                max_lookback_hours: capability.max_lookback_hours,
            });
        }
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<BackfillJob, BackfillError> {
        self.inner
            .store
            .get_job(id)
            .await?
            .ok_or(BackfillError::JobNotFound(id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BackfillJob>, BackfillError> {
        Ok(self.inner.store.list_jobs(filter).await?)
    }

    pub async fn recovered_events(
        &self,
        id: Uuid,
        limit: u64,
    ) -> Result<Vec<RecoveredEvent>, BackfillError> {
        self.get_job(id).await?;
        Ok(self.inner.store.list_recovered_events(id, limit).await?)
    }

    /// Start (or resume) a job and spawn its execution task.
    #[instrument(skip(self))]
    pub async fn start_job(&self, id: Uuid) -> Result<BackfillJob, BackfillError> {
        let inner = &self.inner;
        let write = inner.write_lock.lock().await;

        let mut job = inner
            .store
            .get_job(id)
            .await?
            .ok_or(BackfillError::JobNotFound(id))?;
        if !job.status.can_start() {
            return Err(BackfillError::InvalidStateTransition {
                from: job.status,
                action: "start",
            });
        }

        let capability = self.supported_capability(&job.connector_id)?;
        let source = inner
            .registry
            .source(&job.connector_id)
            .map_err(|_| BackfillError::UnsupportedConnector(job.connector_id.clone()))?;

        let token = CancellationToken::new();
        inner.claim_slot(id, token.clone())?;

        let resumed = job.status == JobStatus::Paused;
        job.status = JobStatus::Running;
        job.completed_at = None;
        if job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        if resumed {
            job.push_timeline(
                TimelineKind::Resumed,
                format!("resumed at batch {}", job.progress.current_batch),
            );
        } else {
            job.push_timeline(TimelineKind::Started, format!("started with {}", job.strategy));
        }

        if let Err(err) = inner.store.save_job(&job).await {
            inner.release_slot(id);
            return Err(err.into());
        }
        drop(write);

        counter!("backfill_jobs_started_total").increment(1);
        info!(job_id = %id, strategy = %job.strategy, resumed, "backfill job started");

        tokio::spawn(Arc::clone(inner).run_job(job.clone(), capability, source, token));
        Ok(job)
    }

    /// Pause a running job; it stops at its next check point.
    #[instrument(skip(self))]
    pub async fn pause_job(&self, id: Uuid) -> Result<BackfillJob, BackfillError> {
        let job = self
            .inner
            .mutate_job(id, |job| {
                if job.status != JobStatus::Running {
                    return Err(BackfillError::InvalidStateTransition {
                        from: job.status,
                        action: "pause",
                    });
                }
                job.status = JobStatus::Paused;
                job.push_timeline(TimelineKind::Paused, "pause requested");
                Ok(())
            })
            .await?;
        self.inner.signal(id);
        info!(job_id = %id, "backfill job paused");
        Ok(job)
    }

    /// Cancel a pending, paused or running job.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, id: Uuid) -> Result<BackfillJob, BackfillError> {
        let job = self
            .inner
            .mutate_job(id, |job| {
                match job.status {
                    JobStatus::Pending | JobStatus::Paused | JobStatus::Running => {}
                    from => {
                        return Err(BackfillError::InvalidStateTransition {
                            from,
                            action: "cancel",
                        });
                    }
                }
                let was = job.status;
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                job.push_timeline(TimelineKind::Cancelled, format!("cancelled while {}", was));
                Ok(())
            })
            .await?;

        self.inner.signal(id);
        lock(&self.inner.parked).remove(&id);
        counter!("backfill_jobs_finished_total", "status" => JobStatus::Cancelled.as_str())
            .increment(1);
        info!(job_id = %id, "backfill job cancelled");
        Ok(job)
    }

    /// Re-queue a failed or partially completed job for a fresh run.
    #[instrument(skip(self))]
    pub async fn retry_job(&self, id: Uuid) -> Result<BackfillJob, BackfillError> {
        let job = self
            .inner
            .mutate_job(id, |job| {
                if !matches!(
                    job.status,
                    JobStatus::Failed | JobStatus::PartiallyCompleted
                ) {
                    return Err(BackfillError::InvalidStateTransition {
                        from: job.status,
                        action: "retry",
                    });
                }
                if job.retry_count >= job.max_retries {
                    return Err(BackfillError::RetryLimitReached {
                        job_id: job.id,
                        max_retries: job.max_retries,
                    });
                }
                job.retry_count += 1;
                job.status = JobStatus::Pending;
                job.progress.reset();
                job.checkpoint_cursor = None;
                job.completed_at = None;
                job.last_error = None;
                let message = format!("retry {} of {}", job.retry_count, job.max_retries);
                job.push_timeline(TimelineKind::Retried, message);
                Ok(())
            })
            .await?;
        info!(job_id = %id, retry_count = job.retry_count, "backfill job re-queued");
        Ok(job)
    }

    /// Remove finished jobs completed before `before`.
    pub async fn purge(&self, before: chrono::DateTime<Utc>) -> Result<u64, BackfillError> {
        Ok(self.inner.store.purge_jobs(before).await?)
    }
}

impl ManagerInner {
    fn claim_slot(&self, id: Uuid, token: CancellationToken) -> Result<(), BackfillError> {
        let mut running = lock(&self.running);
        if running.contains_key(&id) {
            return Err(BackfillError::PreviousRunActive(id));
        }
        if running.len() >= self.settings.max_concurrent_jobs {
            return Err(BackfillError::ConcurrencyLimitExceeded {
                limit: self.settings.max_concurrent_jobs,
            });
        }
        running.insert(id, token);
        gauge!("backfill_running_jobs").set(running.len() as f64);
        Ok(())
    }

    fn release_slot(&self, id: Uuid) {
        let mut running = lock(&self.running);
        running.remove(&id);
        gauge!("backfill_running_jobs").set(running.len() as f64);
    }

    fn signal(&self, id: Uuid) {
        if let Some(token) = lock(&self.running).get(&id) {
            token.cancel();
        }
    }

    async fn mutate_job<F>(&self, id: Uuid, mutate: F) -> Result<BackfillJob, BackfillError>
    where
        F: FnOnce(&mut BackfillJob) -> Result<(), BackfillError> + Send,
    {
        let _write = self.write_lock.lock().await;
        let mut job = self
            .store
            .get_job(id)
            .await?
            .ok_or(BackfillError::JobNotFound(id))?;
        mutate(&mut job)?;
        self.store.save_job(&job).await?;
        Ok(job)
    }

    #[instrument(skip_all, fields(job_id = %job.id, connector_id = %job.connector_id, strategy = %job.strategy))]
    async fn run_job(
        self: Arc<Self>,
        job: BackfillJob,
        capability: ConnectorCapability,
        source: Arc<dyn EventSource>,
        token: CancellationToken,
    ) {
        let id = job.id;
        let cleanup = Arc::clone(&self);
        scopeguard::defer! {
            cleanup.release_slot(id);
        }

        let dedup = lock(&self.parked)
            .remove(&id)
            .unwrap_or_else(|| DedupGuard::new(&job.config.deduplication));
        let recorded_events = match self
            .store
            .list_recovered_events(id, self.settings.max_recorded_events as u64)
            .await
        {
            Ok(events) => events.len(),
            Err(err) => {
                warn!(error = %err, "could not count recorded events");
                0
            }
        };

        let sink: Arc<dyn ProgressSink> = Arc::clone(&self) as Arc<dyn ProgressSink>;
        let mut ctx = RunContext::new(RunParts {
            job_id: id,
            workflow_id: job.workflow_id.clone(),
            window: job.window,
            config: job.config.clone(),
            capability,
            source,
            executor: Arc::clone(&self.executor),
            sink,
            token,
            dedup,
            progress: job.progress.clone(),
            checkpoint_cursor: job.checkpoint_cursor.clone(),
            max_recorded_events: self.settings.max_recorded_events,
            recorded_events,
        });

        let selected = job.strategy;
        let run = tokio::spawn(async move {
            let outcome = strategy::execute(selected, &mut ctx).await;
            (outcome, ctx)
        }
        .in_current_span());
        let (outcome, mut ctx) = match run.await {
            Ok(done) => done,
            Err(err) => {
                error!(error = %err, "strategy task aborted");
                let dedup = DedupGuard::new(&job.config.deduplication);
                self.finish(id, Err(RunError::Aborted(err.to_string())), false, dedup)
                    .await;
                return;
            }
        };
        let flushed = ctx.flush().await;
        let outcome = match (outcome, flushed) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(RunError::from(err)),
            (Ok(()), Ok(())) => Ok(()),
        };

        let exhausted = ctx.progress.total_batches > 0
            && ctx.progress.current_batch >= ctx.progress.total_batches
            && ctx.checkpoint_cursor.is_none();
        self.finish(id, outcome, exhausted, ctx.dedup).await;
    }

    /// Settle the final status of a run. Pause and cancel requests keep the
    /// status they set, unless a paused run had already finished its work.
    async fn finish(&self, id: Uuid, outcome: Result<(), RunError>, exhausted: bool, dedup: DedupGuard) {
        let quota = self.settings.partial_completion_quota;
        let result = self
            .mutate_job(id, |job| {
                let now = Utc::now();
                match (job.status, &outcome) {
                    (JobStatus::Cancelled, _) => {
                        job.completed_at.get_or_insert(now);
                    }
                    (JobStatus::Paused, Ok(())) if !exhausted => {}
                    (JobStatus::Paused, Err(_)) => {}
                    (_, Ok(())) => {
                        job.status = JobStatus::Completed;
                        job.completed_at = Some(now);
                        let message = format!(
                            "{} recovered, {} failed, {} duplicates",
                            job.progress.successful, job.progress.failed, job.progress.duplicates
                        );
                        job.push_timeline(TimelineKind::Completed, message);
                    }
                    (_, Err(err)) => {
                        let progress = &job.progress;
                        let done = f64::from(progress.current_batch);
                        let total = f64::from(progress.total_batches.max(1));
                        let partial = progress.current_batch > 0 && done / total >= quota;

                        job.status = if partial {
                            JobStatus::PartiallyCompleted
                        } else {
                            JobStatus::Failed
                        };
                        job.completed_at = Some(now);
                        job.last_error = Some(err.to_string());
                        job.errors.push(BackfillErrorRecord::new(
                            None,
                            err.category(),
                            err.to_string(),
                            err.is_retryable(),
                        ));
                        let kind = if partial {
                            TimelineKind::PartiallyCompleted
                        } else {
                            TimelineKind::Failed
                        };
                        job.push_timeline(kind, err.to_string());
                    }
                }
                Ok(())
            })
            .await;

        match result {
            Ok(job) => {
                if job.status == JobStatus::Paused {
                    lock(&self.parked).insert(id, dedup);
                    info!(job_id = %id, checkpoint = job.progress.current_batch, "backfill job parked");
                    return;
                }
                if job.status != JobStatus::Cancelled {
                    counter!("backfill_jobs_finished_total", "status" => job.status.as_str())
                        .increment(1);
                }
                info!(
                    job_id = %id,
                    status = %job.status,
                    successful = job.progress.successful,
                    failed = job.progress.failed,
                    duplicates = job.progress.duplicates,
                    "backfill job finished"
                );
            }
            Err(err) => error!(job_id = %id, error = %err, "failed to record job outcome"),
        }
    }
}

#[async_trait]
impl ProgressSink for ManagerInner {
    async fn publish(&self, job_id: Uuid, update: ProgressUpdate) -> Result<(), BackfillError> {
        let ProgressUpdate {
            progress,
            errors,
            timeline,
            recovered,
            checkpoint_cursor,
        } = update;

        self.mutate_job(job_id, move |job| {
            job.progress = progress;
            job.errors.extend(errors);
            job.timeline.extend(timeline);
            job.checkpoint_cursor = checkpoint_cursor;
            Ok(())
        })
        .await?;

        if !recovered.is_empty() {
            self.store.append_recovered_events(&recovered).await?;
        }
        Ok(())
    }
}
