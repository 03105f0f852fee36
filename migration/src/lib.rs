//! Database migrations for the webhook backfill service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_000100_create_backfill_jobs;
mod m2025_11_10_000200_create_downtime_records;
mod m2025_11_10_000300_create_recovered_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_000100_create_backfill_jobs::Migration),
            Box::new(m2025_11_10_000200_create_downtime_records::Migration),
            Box::new(m2025_11_10_000300_create_recovered_events::Migration),
        ]
    }
}
