//! RecoveredEvent entity model
//!
//! One row per event a backfill job replayed through its workflow.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "recovered_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    pub original_event_id: String,

    pub original_timestamp: DateTimeWithTimeZone,

    pub recovered_at: DateTimeWithTimeZone,

    pub event_type: String,

    pub source_connector: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub success: bool,

    pub execution_id: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::backfill_job::Entity",
        from = "Column::JobId",
        to = "super::backfill_job::Column::Id",
        on_delete = "Cascade"
    )]
    BackfillJob,
}

impl Related<super::backfill_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BackfillJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
