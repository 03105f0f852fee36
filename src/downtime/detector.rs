//! Downtime detector
//!
//! Opens downtime records, resolves them into a missed-event estimate and,
//! when auto-backfill is enabled, turns each resolved record into exactly
//! one recovery job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backfill::{
    BackfillError, BackfillManager, BackfillStore, BackfillStrategy, NewJob, TimeWindow,
};
use crate::config::AppConfig;
use crate::connectors::{DEFAULT_ACTIVITY_RATE_PER_HOUR, estimate_events};
use crate::downtime::{DowntimeCause, DowntimeFilter, DowntimeRecord};

#[derive(Debug, Clone)]
pub struct DowntimeSettings {
    /// Wait after detection before an auto-backfill resolution is attempted
    pub grace_period: Duration,
    pub auto_backfill: bool,
    /// Owner of jobs spawned for records without a user
    pub system_user_id: String,
}

impl Default for DowntimeSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            auto_backfill: true,
            system_user_id: "system".to_string(),
        }
    }
}

impl DowntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            grace_period: Duration::from_secs(config.downtime.grace_period_seconds),
            auto_backfill: config.downtime.auto_backfill,
            system_user_id: config.downtime.system_user_id.clone(),
        }
    }
}

/// Input of [`DowntimeDetector::detect`]
#[derive(Debug, Clone)]
pub struct DetectRequest {
    pub workflow_id: String,
    pub connector_id: String,
    pub cause: DowntimeCause,
    /// Backdated start; defaults to now
    pub started_at: Option<DateTime<Utc>>,
    /// Per-record override of the configured auto-backfill flag
    pub auto_backfill: Option<bool>,
    pub user_id: Option<String>,
}

type PairKey = (String, String);

#[derive(Clone)]
pub struct DowntimeDetector {
    inner: Arc<DetectorInner>,
}

struct DetectorInner {
    store: Arc<dyn BackfillStore>,
    manager: BackfillManager,
    settings: DowntimeSettings,
    /// Last known health per (workflow, connector); absent means healthy
    health: Mutex<HashMap<PairKey, bool>>,
    resolve_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl DowntimeDetector {
    pub fn new(
        manager: BackfillManager,
        settings: DowntimeSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                store: manager.store(),
                manager,
                settings,
                health: Mutex::new(HashMap::new()),
                resolve_lock: tokio::sync::Mutex::new(()),
                shutdown,
            }),
        }
    }

    pub fn settings(&self) -> &DowntimeSettings {
        &self.inner.settings
    }

    /// Open a downtime record for the pair.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, connector_id = %request.connector_id, cause = %request.cause))]
    pub async fn detect(&self, request: DetectRequest) -> Result<DowntimeRecord, BackfillError> {
        let now = Utc::now();
        let start_time = request.started_at.unwrap_or(now);
        if start_time > now {
            return Err(BackfillError::InvalidWindow(
                "downtime cannot start in the future".to_string(),
            ));
        }

        let record = DowntimeRecord {
            id: Uuid::new_v4(),
            workflow_id: request.workflow_id,
            connector_id: request.connector_id,
            user_id: request
                .user_id
                .unwrap_or_else(|| self.inner.settings.system_user_id.clone()),
            start_time,
            end_time: None,
            detected_at: now,
            resolved_at: None,
            cause: request.cause,
            severity: request.cause.severity(),
            estimated_missed_events: 0,
            auto_backfill_enabled: request
                .auto_backfill
                .unwrap_or(self.inner.settings.auto_backfill),
            backfill_job_id: None,
        };
        self.inner.store.insert_downtime(&record).await?;

        counter!("downtime_detected_total", "cause" => record.cause.as_str()).increment(1);
        info!(
            downtime_id = %record.id,
            severity = %record.severity,
            auto_backfill = record.auto_backfill_enabled,
            "webhook downtime detected"
        );

        if record.auto_backfill_enabled {
            tokio::spawn(Arc::clone(&self.inner).deferred_resolve(record.id));
        }
        Ok(record)
    }

    /// Close a record, estimate what was missed and trigger recovery.
    pub async fn resolve(&self, id: Uuid) -> Result<DowntimeRecord, BackfillError> {
        self.inner.resolve(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<DowntimeRecord, BackfillError> {
        self.inner
            .store
            .get_downtime(id)
            .await?
            .ok_or(BackfillError::DowntimeNotFound(id))
    }

    pub async fn list(&self, filter: &DowntimeFilter) -> Result<Vec<DowntimeRecord>, BackfillError> {
        Ok(self.inner.store.list_downtimes(filter).await?)
    }

    /// Newest open record of the pair, if any.
    pub async fn open_record_for(
        &self,
        workflow_id: &str,
        connector_id: &str,
    ) -> Result<Option<DowntimeRecord>, BackfillError> {
        let filter = DowntimeFilter {
            workflow_id: Some(workflow_id.to_string()),
            connector_id: Some(connector_id.to_string()),
            open_only: true,
            limit: Some(1),
            ..DowntimeFilter::default()
        };
        Ok(self.inner.store.list_downtimes(&filter).await?.into_iter().next())
    }

    pub fn mark_health(&self, workflow_id: &str, connector_id: &str, healthy: bool) {
        let key = (workflow_id.to_string(), connector_id.to_string());
        let mut health = self
            .inner
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if healthy {
            health.remove(&key);
        } else {
            health.insert(key, false);
        }
    }

    pub fn is_unhealthy(&self, workflow_id: &str, connector_id: &str) -> bool {
        self.inner.is_unhealthy(workflow_id, connector_id)
    }
}

impl DetectorInner {
    fn is_unhealthy(&self, workflow_id: &str, connector_id: &str) -> bool {
        let key = (workflow_id.to_string(), connector_id.to_string());
        self.health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .is_some_and(|healthy| !healthy)
    }

    /// Wait out the grace period, then resolve once the pair looks healthy.
    #[instrument(skip(self))]
    async fn deferred_resolve(self: Arc<Self>, id: Uuid) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(downtime_id = %id, "deferred resolution abandoned on shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.settings.grace_period) => {}
            }

            let record = match self.store.get_downtime(id).await {
                Ok(Some(record)) => record,
                Ok(None) => return,
                Err(err) => {
                    warn!(downtime_id = %id, error = %err, "could not load downtime record");
                    continue;
                }
            };
            if !record.is_open() {
                return;
            }
            if self.is_unhealthy(&record.workflow_id, &record.connector_id) {
                debug!(downtime_id = %id, "pair still unhealthy, extending grace period");
                continue;
            }

            match self.resolve(id).await {
                Ok(_) | Err(BackfillError::DowntimeAlreadyResolved(_)) => return,
                Err(err) => {
                    warn!(downtime_id = %id, error = %err, "deferred resolution failed");
                    return;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn resolve(&self, id: Uuid) -> Result<DowntimeRecord, BackfillError> {
        let _guard = self.resolve_lock.lock().await;

        let mut record = self
            .store
            .get_downtime(id)
            .await?
            .ok_or(BackfillError::DowntimeNotFound(id))?;
        if !record.is_open() {
            return Err(BackfillError::DowntimeAlreadyResolved(id));
        }

        let now = Utc::now();
        let end_time = now.max(record.start_time);
        let window = TimeWindow::new(record.start_time, end_time);

        let registry = self.manager.registry();
        let capability = registry.capability(&record.connector_id).ok();
        let rate = capability
            .map(|capability| capability.activity_rate_per_hour)
            .unwrap_or(DEFAULT_ACTIVITY_RATE_PER_HOUR);

        record.end_time = Some(end_time);
        record.resolved_at = Some(now);
        record.estimated_missed_events = estimate_events(rate, &window);
        self.store.save_downtime(&record).await?;

        info!(
            downtime_id = %id,
            hours = window.hours(),
            estimated_missed_events = record.estimated_missed_events,
            "webhook downtime resolved"
        );

        if record.estimated_missed_events == 0 || !record.auto_backfill_enabled {
            return Ok(record);
        }

        let strategy = capability
            .filter(|capability| capability.supports(BackfillStrategy::Hybrid))
            .map(|_| BackfillStrategy::Hybrid);
        let request = NewJob {
            connector_id: record.connector_id.clone(),
            workflow_id: record.workflow_id.clone(),
            user_id: record.user_id.clone(),
            window,
            strategy,
            config: None,
            downtime_id: Some(record.id),
        };

        let job = match self.manager.create_job(request).await {
            Ok(job) => job,
            Err(err) => {
                warn!(downtime_id = %id, error = %err, "auto-backfill job could not be created");
                return Ok(record);
            }
        };

        match self.manager.start_job(job.id).await {
            Ok(_) => {}
            Err(
                BackfillError::ConcurrencyLimitExceeded { .. }
                | BackfillError::PreviousRunActive(_),
            ) => {
                info!(job_id = %job.id, "auto-backfill job queued until capacity frees up");
            }
            Err(err) => warn!(job_id = %job.id, error = %err, "auto-backfill job did not start"),
        }

        record.backfill_job_id = Some(job.id);
        self.store.save_downtime(&record).await?;
        Ok(record)
    }
}
