use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "quarantine_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub raw_email_id: String,
    pub extraction_data: String,
    pub confidence: f64,
    pub quarantine_reason: String,
    pub reviewed_at: Option<DateTimeWithTimeZone>,
    pub reviewed_by: Option<String>,
    pub action_taken: Option<String>,
    pub edited_data: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
