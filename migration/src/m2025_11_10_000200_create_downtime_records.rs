//! Migration to create the downtime_records table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DowntimeRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DowntimeRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DowntimeRecords::WorkflowId).text().not_null())
                    .col(
                        ColumnDef::new(DowntimeRecords::ConnectorId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DowntimeRecords::UserId).text().not_null())
                    .col(
                        ColumnDef::new(DowntimeRecords::StartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(DowntimeRecords::EndTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(DowntimeRecords::DetectedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DowntimeRecords::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(DowntimeRecords::Cause).text().not_null())
                    .col(ColumnDef::new(DowntimeRecords::Severity).text().not_null())
                    .col(
                        ColumnDef::new(DowntimeRecords::EstimatedMissedEvents)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(DowntimeRecords::AutoBackfillEnabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(DowntimeRecords::BackfillJobId).uuid().null())
                    .to_owned(),
            )
            .await?;

        // Lookup of the open record for a (workflow, connector) pair
        manager
            .create_index(
                Index::create()
                    .name("idx_downtime_records_pair_start")
                    .table(DowntimeRecords::Table)
                    .col(DowntimeRecords::WorkflowId)
                    .col(DowntimeRecords::ConnectorId)
                    .col(DowntimeRecords::StartTime)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_downtime_records_pair_start")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(DowntimeRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DowntimeRecords {
    Table,
    Id,
    WorkflowId,
    ConnectorId,
    UserId,
    StartTime,
    EndTime,
    DetectedAt,
    ResolvedAt,
    Cause,
    Severity,
    EstimatedMissedEvents,
    AutoBackfillEnabled,
    BackfillJobId,
}
