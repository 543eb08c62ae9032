use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "alert_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub raw_email_id: Option<String>,
    pub source_tool: String,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub check_name: Option<String>,
    pub service: Option<String>,
    pub severity: String,
    pub state: String,
    pub occurred_at: DateTimeWithTimeZone,
    pub normalized_signature: String,
    pub fingerprint_v2: String,
    pub payload: String,
    pub tags: String,
    pub is_suppressed: bool,
    pub suppression_reason: Option<String>,
    pub content_hash: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
