//! # Data Models
//!
//! SeaORM entities backing the persistent store, plus small API payloads.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod backfill_job;
pub mod downtime_record;
pub mod recovered_event;

pub use backfill_job::Entity as BackfillJobEntity;
pub use downtime_record::Entity as DowntimeRecordEntity;
pub use recovered_event::Entity as RecoveredEventEntity;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "webhook-backfill".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
