use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "raw_emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub folder: String,
    pub uid: i64,
    pub message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_addresses: String,
    pub cc_addresses: String,
    pub date_header: Option<DateTimeWithTimeZone>,
    pub headers: String,
    pub body_text: String,
    pub body_html: String,
    pub ics_content: Option<String>,
    pub attachments: String,
    pub received_at: DateTimeWithTimeZone,
    pub parse_status: String,
    pub parse_error: Option<String>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
