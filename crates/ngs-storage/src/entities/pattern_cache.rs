use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "pattern_cache")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub signature_hash: String,
    pub from_domain: Option<String>,
    pub subject_prefix: Option<String>,
    pub body_markers: String,
    pub source_name: String,
    pub source_tool: String,
    pub extraction_rules: String,
    pub match_count: i64,
    pub success_rate: f64,
    pub is_approved: bool,
    pub last_matched_at: Option<DateTimeWithTimeZone>,
    pub analysis_duration_ms: Option<i64>,
    pub created_from_email_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
