use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "incidents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub fingerprint_v2: String,
    pub title: String,
    pub source_tool: String,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub check_name: Option<String>,
    pub service: Option<String>,
    pub status: String,
    pub severity_current: String,
    pub severity_max: String,
    pub last_state: String,
    pub first_seen_at: DateTimeWithTimeZone,
    pub last_seen_at: DateTimeWithTimeZone,
    pub resolved_at: Option<DateTimeWithTimeZone>,
    pub resolution_reason: Option<String>,
    pub event_count: i64,
    pub flap_count: i64,
    pub flap_window_started_at: Option<DateTimeWithTimeZone>,
    pub flap_window_count: i64,
    pub is_flapping: bool,
    pub last_state_change_at: Option<DateTimeWithTimeZone>,
    pub is_in_maintenance: bool,
    pub maintenance_window_id: Option<String>,
    pub ai_summary: Option<String>,
    pub ai_probable_cause: Option<String>,
    pub ai_enriched_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
