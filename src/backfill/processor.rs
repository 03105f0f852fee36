//! # Job Processor
//!
//! Background task that wakes on a fixed interval and starts as many `pending`
//! jobs as the remaining capacity allows, oldest first. This is how jobs
//! rejected with `ConcurrencyLimitExceeded`, and jobs created by downtime
//! resolution, eventually begin execution.

use std::time::Duration;

use metrics::histogram;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backfill::error::BackfillError;
use crate::backfill::manager::BackfillManager;
use crate::backfill::types::{JobFilter, JobStatus};

/// Background processor service.
pub struct JobProcessor {
    manager: BackfillManager,
    tick_interval: Duration,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub capacity: usize,
    pub pending_seen: usize,
    pub started: usize,
    pub rejected: usize,
}

impl JobProcessor {
    pub fn new(manager: BackfillManager) -> Self {
        let tick_interval = manager.settings().processor_tick;
        Self {
            manager,
            tick_interval,
        }
    }

    /// Override the tick interval (primarily for tests).
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Run the processor loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(tick = ?self.tick_interval, "Starting backfill job processor");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job processor shutdown requested");
                    break;
                }
                _ = sleep(self.tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Job processor tick failed");
                    }
                    histogram!("backfill_processor_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job processor stopped");
    }

    pub async fn tick(&self) -> Result<TickStats, BackfillError> {
        let mut stats = TickStats {
            capacity: self.manager.available_capacity(),
            ..TickStats::default()
        };
        if stats.capacity == 0 {
            return Ok(stats);
        }

        let pending = self
            .manager
            .list_jobs(&JobFilter {
                status: Some(JobStatus::Pending),
                oldest_first: true,
                ..JobFilter::default()
            })
            .await?;
        stats.pending_seen = pending.len();

        for job in pending {
            if stats.started >= stats.capacity {
                break;
            }
            match self.manager.start_job(job.id).await {
                Ok(_) => stats.started += 1,
                Err(BackfillError::ConcurrencyLimitExceeded { .. }) => break,
                Err(BackfillError::PreviousRunActive(_)) => {
                    debug!(job_id = %job.id, "previous run still stopping, retrying next tick");
                }
                Err(err) => {
                    stats.rejected += 1;
                    warn!(job_id = %job.id, error = %err, "pending job could not be started");
                }
            }
        }

        debug!(
            capacity = stats.capacity,
            pending = stats.pending_seen,
            started = stats.started,
            rejected = stats.rejected,
            "Processor tick completed"
        );
        Ok(stats)
    }
}
