//! Migration to create the recovered_events table.
//!
//! Holds a capped sample of the events each backfill job delivered to its
//! workflow.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RecoveredEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RecoveredEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RecoveredEvents::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(RecoveredEvents::OriginalEventId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RecoveredEvents::OriginalTimestamp)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RecoveredEvents::RecoveredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RecoveredEvents::EventType).text().not_null())
                    .col(
                        ColumnDef::new(RecoveredEvents::SourceConnector)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RecoveredEvents::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RecoveredEvents::Success).boolean().not_null())
                    .col(ColumnDef::new(RecoveredEvents::ExecutionId).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_recovered_events_job_id")
                            .from(RecoveredEvents::Table, RecoveredEvents::JobId)
                            .to(BackfillJobs::Table, BackfillJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_recovered_events_job_recovered")
                    .table(RecoveredEvents::Table)
                    .col(RecoveredEvents::JobId)
                    .col(RecoveredEvents::RecoveredAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_recovered_events_job_recovered")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RecoveredEvents::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RecoveredEvents {
    Table,
    Id,
    JobId,
    OriginalEventId,
    OriginalTimestamp,
    RecoveredAt,
    EventType,
    SourceConnector,
    Payload,
    Success,
    ExecutionId,
}

#[derive(DeriveIden)]
enum BackfillJobs {
    Table,
    Id,
}
