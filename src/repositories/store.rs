//! # SeaORM Store
//!
//! Persists jobs, downtime records and recovered events through SeaORM.
//! Works against Postgres in production and SQLite in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::backfill::store::{BackfillStore, StoreError};
use crate::backfill::types::{BackfillJob, JobFilter, JobStatus, RecoveredEvent, TimeWindow};
use crate::connectors::Cursor;
use crate::downtime::{DowntimeFilter, DowntimeRecord};
use crate::models::{backfill_job, downtime_record, recovered_event};

/// Store backed by a SeaORM connection pool
#[derive(Debug, Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn to_db_time(value: DateTime<Utc>) -> DateTimeWithTimeZone {
    value.fixed_offset()
}

fn from_db_time(value: DateTimeWithTimeZone) -> DateTime<Utc> {
    value.with_timezone(&Utc)
}

fn to_json<T: Serialize>(entity: &'static str, id: Uuid, value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        entity,
        id: id.to_string(),
        details: e.to_string(),
    })
}

fn from_json<T: DeserializeOwned>(
    entity: &'static str,
    id: Uuid,
    value: JsonValue,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        entity,
        id: id.to_string(),
        details: e.to_string(),
    })
}

fn parse_column<T>(entity: &'static str, id: Uuid, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(|details| StoreError::Corrupt {
        entity,
        id: id.to_string(),
        details,
    })
}

fn saturating_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn job_to_active(job: &BackfillJob) -> Result<backfill_job::ActiveModel, StoreError> {
    Ok(backfill_job::ActiveModel {
        id: Set(job.id),
        connector_id: Set(job.connector_id.clone()),
        workflow_id: Set(job.workflow_id.clone()),
        user_id: Set(job.user_id.clone()),
        window_start: Set(to_db_time(job.window.start)),
        window_end: Set(to_db_time(job.window.end)),
        status: Set(job.status.as_str().to_string()),
        strategy: Set(job.strategy.as_str().to_string()),
        config: Set(to_json("job", job.id, &job.config)?),
        progress: Set(to_json("job", job.id, &job.progress)?),
        errors: Set(to_json("job", job.id, &job.errors)?),
        timeline: Set(to_json("job", job.id, &job.timeline)?),
        checkpoint_cursor: Set(job.checkpoint_cursor.clone().map(JsonValue::from)),
        last_error: Set(job.last_error.clone()),
        retry_count: Set(saturating_i32(job.retry_count)),
        max_retries: Set(saturating_i32(job.max_retries)),
        downtime_id: Set(job.downtime_id),
        created_at: Set(to_db_time(job.created_at)),
        started_at: Set(job.started_at.map(to_db_time)),
        completed_at: Set(job.completed_at.map(to_db_time)),
        updated_at: Set(Utc::now().fixed_offset()),
    })
}

fn job_from_model(model: backfill_job::Model) -> Result<BackfillJob, StoreError> {
    let id = model.id;
    Ok(BackfillJob {
        id,
        connector_id: model.connector_id,
        workflow_id: model.workflow_id,
        user_id: model.user_id,
        window: TimeWindow {
            start: from_db_time(model.window_start),
            end: from_db_time(model.window_end),
        },
        status: parse_column("job", id, &model.status)?,
        strategy: parse_column("job", id, &model.strategy)?,
        config: from_json("job", id, model.config)?,
        progress: from_json("job", id, model.progress)?,
        created_at: from_db_time(model.created_at),
        started_at: model.started_at.map(from_db_time),
        completed_at: model.completed_at.map(from_db_time),
        last_error: model.last_error,
        retry_count: u32::try_from(model.retry_count).unwrap_or(0),
        max_retries: u32::try_from(model.max_retries).unwrap_or(0),
        errors: from_json("job", id, model.errors)?,
        timeline: from_json("job", id, model.timeline)?,
        checkpoint_cursor: model.checkpoint_cursor.map(Cursor::from),
        downtime_id: model.downtime_id,
    })
}

fn downtime_to_active(record: &DowntimeRecord) -> downtime_record::ActiveModel {
    downtime_record::ActiveModel {
        id: Set(record.id),
        workflow_id: Set(record.workflow_id.clone()),
        connector_id: Set(record.connector_id.clone()),
        user_id: Set(record.user_id.clone()),
        start_time: Set(to_db_time(record.start_time)),
        end_time: Set(record.end_time.map(to_db_time)),
        detected_at: Set(to_db_time(record.detected_at)),
        resolved_at: Set(record.resolved_at.map(to_db_time)),
        cause: Set(record.cause.as_str().to_string()),
        severity: Set(record.severity.as_str().to_string()),
        estimated_missed_events: Set(i64::try_from(record.estimated_missed_events)
            .unwrap_or(i64::MAX)),
        auto_backfill_enabled: Set(record.auto_backfill_enabled),
        backfill_job_id: Set(record.backfill_job_id),
    }
}

fn downtime_from_model(model: downtime_record::Model) -> Result<DowntimeRecord, StoreError> {
    let id = model.id;
    Ok(DowntimeRecord {
        id,
        workflow_id: model.workflow_id,
        connector_id: model.connector_id,
        user_id: model.user_id,
        start_time: from_db_time(model.start_time),
        end_time: model.end_time.map(from_db_time),
        detected_at: from_db_time(model.detected_at),
        resolved_at: model.resolved_at.map(from_db_time),
        cause: parse_column("downtime", id, &model.cause)?,
        severity: parse_column("downtime", id, &model.severity)?,
        estimated_missed_events: u64::try_from(model.estimated_missed_events).unwrap_or(0),
        auto_backfill_enabled: model.auto_backfill_enabled,
        backfill_job_id: model.backfill_job_id,
    })
}

fn event_from_model(model: recovered_event::Model) -> RecoveredEvent {
    RecoveredEvent {
        job_id: model.job_id,
        original_event_id: model.original_event_id,
        original_timestamp: from_db_time(model.original_timestamp),
        recovered_at: from_db_time(model.recovered_at),
        event_type: model.event_type,
        source_connector: model.source_connector,
        payload: model.payload,
        success: model.success,
        execution_id: model.execution_id,
    }
}

fn map_update_error(entity: &'static str, id: Uuid, err: DbErr) -> StoreError {
    match err {
        DbErr::RecordNotUpdated => StoreError::Missing { entity, id },
        other => StoreError::from(other),
    }
}

#[async_trait]
impl BackfillStore for SeaOrmStore {
    async fn insert_job(&self, job: &BackfillJob) -> Result<(), StoreError> {
        job_to_active(job)?.insert(&self.db).await?;
        tracing::debug!(job_id = %job.id, "Backfill job persisted");
        Ok(())
    }

    async fn save_job(&self, job: &BackfillJob) -> Result<(), StoreError> {
        job_to_active(job)?
            .update(&self.db)
            .await
            .map_err(|e| map_update_error("job", job.id, e))?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<BackfillJob>, StoreError> {
        backfill_job::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(job_from_model)
            .transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<BackfillJob>, StoreError> {
        use backfill_job::Column;

        let mut query = backfill_job::Entity::find();
        if let Some(connector_id) = &filter.connector_id {
            query = query.filter(Column::ConnectorId.eq(connector_id.clone()));
        }
        if let Some(workflow_id) = &filter.workflow_id {
            query = query.filter(Column::WorkflowId.eq(workflow_id.clone()));
        }
        if let Some(user_id) = &filter.user_id {
            query = query.filter(Column::UserId.eq(user_id.clone()));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(Column::CreatedAt.gte(to_db_time(after)));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(Column::CreatedAt.lt(to_db_time(before)));
        }

        query = if filter.oldest_first {
            query.order_by_asc(Column::CreatedAt)
        } else {
            query.order_by_desc(Column::CreatedAt)
        };
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        query
            .all(&self.db)
            .await?
            .into_iter()
            .map(job_from_model)
            .collect()
    }

    async fn purge_jobs(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        use backfill_job::Column;

        let terminal: Vec<&'static str> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::is_terminal)
            .map(|status| status.as_str())
            .collect();

        let ids: Vec<Uuid> = backfill_job::Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.is_in(terminal))
            .filter(Column::CompletedAt.lt(to_db_time(before)))
            .into_tuple()
            .all(&self.db)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        recovered_event::Entity::delete_many()
            .filter(recovered_event::Column::JobId.is_in(ids.clone()))
            .exec(&self.db)
            .await?;
        let result = backfill_job::Entity::delete_many()
            .filter(Column::Id.is_in(ids))
            .exec(&self.db)
            .await?;

        tracing::info!(purged = result.rows_affected, "Purged finished backfill jobs");
        Ok(result.rows_affected)
    }

    async fn append_recovered_events(&self, events: &[RecoveredEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let rows = events.iter().map(|event| recovered_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(event.job_id),
            original_event_id: Set(event.original_event_id.clone()),
            original_timestamp: Set(to_db_time(event.original_timestamp)),
            recovered_at: Set(to_db_time(event.recovered_at)),
            event_type: Set(event.event_type.clone()),
            source_connector: Set(event.source_connector.clone()),
            payload: Set(event.payload.clone()),
            success: Set(event.success),
            execution_id: Set(event.execution_id.clone()),
        });
        recovered_event::Entity::insert_many(rows)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_recovered_events(
        &self,
        job_id: Uuid,
        limit: u64,
    ) -> Result<Vec<RecoveredEvent>, StoreError> {
        use recovered_event::Column;

        let rows = recovered_event::Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::RecoveredAt)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(event_from_model).collect())
    }

    async fn insert_downtime(&self, record: &DowntimeRecord) -> Result<(), StoreError> {
        downtime_to_active(record).insert(&self.db).await?;
        Ok(())
    }

    async fn save_downtime(&self, record: &DowntimeRecord) -> Result<(), StoreError> {
        downtime_to_active(record)
            .update(&self.db)
            .await
            .map_err(|e| map_update_error("downtime", record.id, e))?;
        Ok(())
    }

    async fn get_downtime(&self, id: Uuid) -> Result<Option<DowntimeRecord>, StoreError> {
        downtime_record::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .map(downtime_from_model)
            .transpose()
    }

    async fn list_downtimes(
        &self,
        filter: &DowntimeFilter,
    ) -> Result<Vec<DowntimeRecord>, StoreError> {
        use downtime_record::Column;

        let mut query = downtime_record::Entity::find();
        if let Some(workflow_id) = &filter.workflow_id {
            query = query.filter(Column::WorkflowId.eq(workflow_id.clone()));
        }
        if let Some(connector_id) = &filter.connector_id {
            query = query.filter(Column::ConnectorId.eq(connector_id.clone()));
        }
        if filter.open_only {
            query = query.filter(Column::EndTime.is_null());
        }
        if let Some(after) = filter.started_after {
            query = query.filter(Column::StartTime.gte(to_db_time(after)));
        }
        if let Some(before) = filter.started_before {
            query = query.filter(Column::StartTime.lt(to_db_time(before)));
        }
        query = query.order_by_desc(Column::StartTime);
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        query
            .all(&self.db)
            .await?
            .into_iter()
            .map(downtime_from_model)
            .collect()
    }
}
