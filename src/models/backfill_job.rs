//! BackfillJob entity model
//!
//! SeaORM entity for the `backfill_jobs` table.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "backfill_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub connector_id: String,

    pub workflow_id: String,

    pub user_id: String,

    /// Inclusive start of the recovery window
    pub window_start: DateTimeWithTimeZone,

    /// Exclusive end of the recovery window
    pub window_end: DateTimeWithTimeZone,

    /// Lifecycle status (snake_case `JobStatus`)
    pub status: String,

    pub strategy: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub config: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub progress: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,

    #[sea_orm(column_type = "JsonBinary")]
    pub timeline: JsonValue,

    /// Saved page cursor of a paused `cursor_based` run
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub checkpoint_cursor: Option<JsonValue>,

    pub last_error: Option<String>,

    pub retry_count: i32,

    pub max_retries: i32,

    pub downtime_id: Option<Uuid>,

    pub created_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::recovered_event::Entity")]
    RecoveredEvent,
}

impl Related<super::recovered_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RecoveredEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
