use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "maintenance_windows")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub source: String,
    pub raw_email_id: Option<String>,
    pub external_event_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub organizer: Option<String>,
    pub organizer_email: Option<String>,
    pub start_ts: DateTimeWithTimeZone,
    pub end_ts: DateTimeWithTimeZone,
    pub timezone: String,
    pub scope: String,
    pub suppress_mode: String,
    pub is_active: bool,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
