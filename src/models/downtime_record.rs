//! DowntimeRecord entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "downtime_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub workflow_id: String,

    pub connector_id: String,

    pub user_id: String,

    pub start_time: DateTimeWithTimeZone,

    /// Null while the downtime is open
    pub end_time: Option<DateTimeWithTimeZone>,

    pub detected_at: DateTimeWithTimeZone,

    pub resolved_at: Option<DateTimeWithTimeZone>,

    pub cause: String,

    pub severity: String,

    pub estimated_missed_events: i64,

    pub auto_backfill_enabled: bool,

    pub backfill_job_id: Option<Uuid>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
