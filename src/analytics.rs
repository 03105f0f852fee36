//! Analytics
//!
//! Read-only aggregation over job and downtime history. Nothing is cached;
//! every report is recomputed from the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backfill::{BackfillError, BackfillJob, BackfillStore, JobFilter, JobStatus};
use crate::downtime::{DowntimeCause, DowntimeFilter, DowntimeRecord, Severity};

pub const DEFAULT_TOP_CONNECTORS: usize = 5;

/// Optional `[start, end)` range applied to job creation and downtime start
#[derive(Debug, Clone, Default)]
pub struct AnalyticsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub top: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConnectorStats {
    pub connector_id: String,
    pub jobs: u64,
    pub completed: u64,
    pub events_recovered: u64,
    /// Completed jobs over finished (terminal) jobs
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DowntimeStats {
    pub total: u64,
    pub open: u64,
    pub mean_duration_secs: Option<f64>,
    pub estimated_missed_events: u64,
    pub by_cause: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AnalyticsReport {
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub total_jobs: u64,
    pub jobs_by_status: BTreeMap<String, u64>,
    pub events_recovered: u64,
    pub events_failed: u64,
    pub duplicates_skipped: u64,
    pub mean_job_duration_secs: Option<f64>,
    pub top_connectors: Vec<ConnectorStats>,
    pub downtime: DowntimeStats,
}

pub struct Analytics {
    store: Arc<dyn BackfillStore>,
}

impl Analytics {
    pub fn new(store: Arc<dyn BackfillStore>) -> Self {
        Self { store }
    }

    pub async fn report(&self, query: &AnalyticsQuery) -> Result<AnalyticsReport, BackfillError> {
        if let (Some(start), Some(end)) = (query.start, query.end)
            && start > end
        {
            return Err(BackfillError::InvalidWindow(
                "start must not be after end".to_string(),
            ));
        }

        let jobs = self
            .store
            .list_jobs(&JobFilter {
                created_after: query.start,
                created_before: query.end,
                ..JobFilter::default()
            })
            .await?;
        let downtimes = self
            .store
            .list_downtimes(&DowntimeFilter {
                started_after: query.start,
                started_before: query.end,
                ..DowntimeFilter::default()
            })
            .await?;

        Ok(build_report(
            query,
            &jobs,
            &downtimes,
            query.top.unwrap_or(DEFAULT_TOP_CONNECTORS),
        ))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u64), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

pub fn build_report(
    query: &AnalyticsQuery,
    jobs: &[BackfillJob],
    downtimes: &[DowntimeRecord],
    top: usize,
) -> AnalyticsReport {
    let mut jobs_by_status: BTreeMap<String, u64> = JobStatus::ALL
        .iter()
        .map(|status| (status.as_str().to_string(), 0))
        .collect();
    let mut connectors: HashMap<&str, (u64, u64, u64, u64)> = HashMap::new();

    for job in jobs {
        *jobs_by_status.entry(job.status.as_str().to_string()).or_default() += 1;
        let entry = connectors.entry(job.connector_id.as_str()).or_default();
        entry.0 += 1;
        if job.status == JobStatus::Completed {
            entry.1 += 1;
        }
        if job.status.is_terminal() {
            entry.2 += 1;
        }
        entry.3 += job.progress.successful;
    }

    let mut top_connectors: Vec<ConnectorStats> = connectors
        .into_iter()
        .map(|(id, (count, completed, finished, recovered))| ConnectorStats {
            connector_id: id.to_string(),
            jobs: count,
            completed,
            events_recovered: recovered,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
        })
        .collect();
    top_connectors.sort_by(|a, b| {
        b.jobs
            .cmp(&a.jobs)
            .then_with(|| a.connector_id.cmp(&b.connector_id))
    });
    top_connectors.truncate(top);

    AnalyticsReport {
        range_start: query.start,
        range_end: query.end,
        total_jobs: jobs.len() as u64,
        jobs_by_status,
        events_recovered: jobs.iter().map(|job| job.progress.successful).sum(),
        events_failed: jobs.iter().map(|job| job.progress.failed).sum(),
        duplicates_skipped: jobs.iter().map(|job| job.progress.duplicates).sum(),
        mean_job_duration_secs: mean(
            jobs.iter()
                .filter_map(BackfillJob::duration)
                .map(|d| d.num_milliseconds() as f64 / 1_000.0),
        ),
        top_connectors,
        downtime: downtime_stats(downtimes),
    }
}

fn downtime_stats(records: &[DowntimeRecord]) -> DowntimeStats {
    let mut by_cause: BTreeMap<String, u64> = DowntimeCause::ALL
        .iter()
        .map(|cause| (cause.as_str().to_string(), 0))
        .collect();
    let mut by_severity: BTreeMap<String, u64> = Severity::ALL
        .iter()
        .map(|severity| (severity.as_str().to_string(), 0))
        .collect();

    for record in records {
        *by_cause.entry(record.cause.as_str().to_string()).or_default() += 1;
        *by_severity
            .entry(record.severity.as_str().to_string())
            .or_default() += 1;
    }

    DowntimeStats {
        total: records.len() as u64,
        open: records.iter().filter(|record| record.is_open()).count() as u64,
        mean_duration_secs: mean(
            records
                .iter()
                .filter_map(DowntimeRecord::duration)
                .map(|d| d.num_milliseconds() as f64 / 1_000.0),
        ),
        estimated_missed_events: records
            .iter()
            .map(|record| record.estimated_missed_events)
            .sum(),
        by_cause,
        by_severity,
    }
}
