use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "pattern_extraction_log")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub raw_email_id: String,
    pub pattern_cache_id: Option<String>,
    pub extraction_type: String,
    pub extracted_host: Option<String>,
    pub extracted_service: Option<String>,
    pub extracted_severity: Option<String>,
    pub extracted_state: Option<String>,
    pub extraction_confidence: Option<f64>,
    pub llm_response: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
