//! Migration to create the backfill_jobs table.
//!
//! One row per backfill job. Config, progress, errors and timeline are stored
//! as JSON documents; the columns used for filtering are kept scalar.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(BackfillJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(BackfillJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(BackfillJobs::ConnectorId).text().not_null())
                    .col(ColumnDef::new(BackfillJobs::WorkflowId).text().not_null())
                    .col(ColumnDef::new(BackfillJobs::UserId).text().not_null())
                    .col(
                        ColumnDef::new(BackfillJobs::WindowStart)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::WindowEnd)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(BackfillJobs::Strategy).text().not_null())
                    .col(ColumnDef::new(BackfillJobs::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(BackfillJobs::Progress)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(BackfillJobs::Errors).json_binary().not_null())
                    .col(
                        ColumnDef::new(BackfillJobs::Timeline)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::CheckpointCursor)
                            .json_binary()
                            .null(),
                    )
                    .col(ColumnDef::new(BackfillJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(BackfillJobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(BackfillJobs::DowntimeId).uuid().null())
                    .col(
                        ColumnDef::new(BackfillJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(BackfillJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Processor picks pending jobs oldest first
        manager
            .create_index(
                Index::create()
                    .name("idx_backfill_jobs_status_created")
                    .table(BackfillJobs::Table)
                    .col(BackfillJobs::Status)
                    .col(BackfillJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_backfill_jobs_connector_created")
                    .table(BackfillJobs::Table)
                    .col(BackfillJobs::ConnectorId)
                    .col(BackfillJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_backfill_jobs_status_created")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_backfill_jobs_connector_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(BackfillJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum BackfillJobs {
    Table,
    Id,
    ConnectorId,
    WorkflowId,
    UserId,
    WindowStart,
    WindowEnd,
    Status,
    Strategy,
    Config,
    Progress,
    Errors,
    Timeline,
    CheckpointCursor,
    LastError,
    RetryCount,
    MaxRetries,
    DowntimeId,
    CreatedAt,
    StartedAt,
    CompletedAt,
    UpdatedAt,
}
