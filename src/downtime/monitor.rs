//! Health monitor
//!
//! Periodically probes registered (workflow, connector) targets and feeds
//! the detector: failed probes open downtime records, healthy probes clear
//! the unhealthy mark.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use metrics::histogram;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::backfill::BackfillError;
use crate::downtime::detector::{DetectRequest, DowntimeDetector};
use crate::downtime::DowntimeCause;

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(DowntimeCause, String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// Probe issuing a plain `GET` against the health URL
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("webhook-backfill/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

/// Downtime cause suggested by an unhealthy HTTP status.
pub fn cause_for_status(status: StatusCode) -> DowntimeCause {
    match status.as_u16() {
        429 => DowntimeCause::RateLimitExceeded,
        404 | 503 => DowntimeCause::EndpointDown,
        401 | 403 => DowntimeCause::ConfigurationError,
        code if code >= 500 => DowntimeCause::ServerError,
        _ => DowntimeCause::Unknown,
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.client.get(url).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => {
                let status = response.status();
                ProbeOutcome::Unhealthy(cause_for_status(status), format!("health check returned {status}"))
            }
            Err(err) if err.is_timeout() || err.is_connect() => {
                ProbeOutcome::Unhealthy(DowntimeCause::NetworkFailure, err.to_string())
            }
            Err(err) => ProbeOutcome::Unhealthy(DowntimeCause::Unknown, err.to_string()),
        }
    }
}

/// A (workflow, connector) pair watched by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WatchTarget {
    pub workflow_id: String,
    pub connector_id: String,
    pub health_url: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub probed: usize,
    pub unhealthy: usize,
    pub opened: usize,
    pub resolved: usize,
}

pub struct HealthMonitor {
    detector: DowntimeDetector,
    probe: Arc<dyn HealthProbe>,
    targets: RwLock<Vec<WatchTarget>>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(detector: DowntimeDetector, probe: Arc<dyn HealthProbe>, interval: Duration) -> Self {
        Self {
            detector,
            probe,
            targets: RwLock::new(Vec::new()),
            interval,
        }
    }

    /// Register a target, replacing an earlier one for the same pair.
    pub fn watch(&self, target: WatchTarget) {
        let mut targets = self
            .targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        targets.retain(|existing| {
            existing.workflow_id != target.workflow_id || existing.connector_id != target.connector_id
        });
        info!(
            workflow_id = %target.workflow_id,
            connector_id = %target.connector_id,
            "health monitor target registered"
        );
        targets.push(target);
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        self.targets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "Starting health monitor");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Health monitor shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Health monitor tick failed");
                    }
                    histogram!("downtime_monitor_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Health monitor stopped");
    }

    pub async fn tick(&self) -> Result<MonitorStats, BackfillError> {
        let mut stats = MonitorStats::default();

        for target in self.targets() {
            stats.probed += 1;
            let outcome = self.probe.probe(&target.health_url).await;
            let open = self
                .detector
                .open_record_for(&target.workflow_id, &target.connector_id)
                .await?;

            match outcome {
                ProbeOutcome::Unhealthy(cause, reason) => {
                    stats.unhealthy += 1;
                    self.detector
                        .mark_health(&target.workflow_id, &target.connector_id, false);
                    if open.is_some() {
                        continue;
                    }
                    warn!(
                        workflow_id = %target.workflow_id,
                        connector_id = %target.connector_id,
                        %cause,
                        %reason,
                        "health probe failed"
                    );
                    self.detector
                        .detect(DetectRequest {
                            workflow_id: target.workflow_id.clone(),
                            connector_id: target.connector_id.clone(),
                            cause,
                            started_at: None,
                            auto_backfill: None,
                            user_id: target.user_id.clone(),
                        })
                        .await?;
                    stats.opened += 1;
                }
                ProbeOutcome::Healthy => {
                    self.detector
                        .mark_health(&target.workflow_id, &target.connector_id, true);
                    // auto-backfill records are closed by their deferred resolver
                    if let Some(record) = open
                        && !record.auto_backfill_enabled
                    {
                        match self.detector.resolve(record.id).await {
                            Ok(_) => stats.resolved += 1,
                            Err(BackfillError::DowntimeAlreadyResolved(_)) => {}
                            Err(err) => return Err(err),
                        }
                    }
                }
            }
        }

        debug!(
            probed = stats.probed,
            unhealthy = stats.unhealthy,
            opened = stats.opened,
            resolved = stats.resolved,
            "Health monitor tick completed"
        );
        Ok(stats)
    }
}
