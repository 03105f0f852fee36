//! Persistence seam for jobs, downtime records and recovered events.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backfill::types::{BackfillJob, JobFilter, RecoveredEvent};
use crate::downtime::{DowntimeFilter, DowntimeRecord};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt {entity} row {id}: {details}")]
    Corrupt {
        entity: &'static str,
        id: String,
        details: String,
    },
    #[error("{entity} {id} not found")]
    Missing { entity: &'static str, id: Uuid },
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[async_trait]
pub trait BackfillStore: Send + Sync {
    async fn insert_job(&self, job: &BackfillJob) -> Result<(), StoreError>;
    /// Overwrite an existing job.
    async fn save_job(&self, job: &BackfillJob) -> Result<(), StoreError>;
    async fn get_job(&self, id: Uuid) -> Result<Option<BackfillJob>, StoreError>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BackfillJob>, StoreError>;
    /// Delete terminal jobs completed before `before`, with their recovered events.
    async fn purge_jobs(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn append_recovered_events(&self, events: &[RecoveredEvent]) -> Result<(), StoreError>;
    async fn list_recovered_events(
        &self,
        job_id: Uuid,
        limit: u64,
    ) -> Result<Vec<RecoveredEvent>, StoreError>;

    async fn insert_downtime(&self, record: &DowntimeRecord) -> Result<(), StoreError>;
    async fn save_downtime(&self, record: &DowntimeRecord) -> Result<(), StoreError>;
    async fn get_downtime(&self, id: Uuid) -> Result<Option<DowntimeRecord>, StoreError>;
    async fn list_downtimes(
        &self,
        filter: &DowntimeFilter,
    ) -> Result<Vec<DowntimeRecord>, StoreError>;
}

/// Process-scoped store used when no database is configured
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, BackfillJob>>,
    downtimes: RwLock<HashMap<Uuid, DowntimeRecord>>,
    recovered: RwLock<HashMap<Uuid, Vec<RecoveredEvent>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_limit<T>(mut items: Vec<T>, limit: Option<u64>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
    items
}

#[async_trait]
impl BackfillStore for MemoryStore {
    async fn insert_job(&self, job: &BackfillJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn save_job(&self, job: &BackfillJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(StoreError::Missing {
                entity: "job",
                id: job.id,
            }),
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<BackfillJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BackfillJob>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        if filter.oldest_first {
            jobs.sort_by_key(|job| job.created_at);
        } else {
            jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        Ok(apply_limit(jobs, filter.limit))
    }

    async fn purge_jobs(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let purged: Vec<Uuid> = jobs
            .values()
            .filter(|job| {
                job.status.is_terminal() && job.completed_at.is_some_and(|done| done < before)
            })
            .map(|job| job.id)
            .collect();

        let mut recovered = self.recovered.write().await;
        for id in &purged {
            jobs.remove(id);
            recovered.remove(id);
        }
        Ok(purged.len() as u64)
    }

    async fn append_recovered_events(&self, events: &[RecoveredEvent]) -> Result<(), StoreError> {
        let mut recovered = self.recovered.write().await;
        for event in events {
            recovered
                .entry(event.job_id)
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    async fn list_recovered_events(
        &self,
        job_id: Uuid,
        limit: u64,
    ) -> Result<Vec<RecoveredEvent>, StoreError> {
        let events = self
            .recovered
            .read()
            .await
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        Ok(apply_limit(events, Some(limit)))
    }

    async fn insert_downtime(&self, record: &DowntimeRecord) -> Result<(), StoreError> {
        self.downtimes
            .write()
            .await
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn save_downtime(&self, record: &DowntimeRecord) -> Result<(), StoreError> {
        let mut downtimes = self.downtimes.write().await;
        match downtimes.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::Missing {
                entity: "downtime",
                id: record.id,
            }),
        }
    }

    async fn get_downtime(&self, id: Uuid) -> Result<Option<DowntimeRecord>, StoreError> {
        Ok(self.downtimes.read().await.get(&id).cloned())
    }

    async fn list_downtimes(
        &self,
        filter: &DowntimeFilter,
    ) -> Result<Vec<DowntimeRecord>, StoreError> {
        let mut records: Vec<_> = self
            .downtimes
            .read()
            .await
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(apply_limit(records, filter.limit))
    }
}
