use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, Order, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::entities::raw_email::{self, Column, Entity};
use crate::MailStore;
use ngs_common::types::ParseStatus;

/// 原始邮件数据行（来自 raw_emails 表）。内容字段入库后不再变化，
/// 只有 parse_status / parse_error 会推进。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRow {
    pub id: String,
    pub folder: String,
    pub uid: i64,
    pub message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub date_header: Option<DateTime<Utc>>,
    pub headers: serde_json::Value,
    pub body_text: String,
    pub body_html: String,
    pub ics_content: Option<String>,
    pub attachments: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub parse_status: String,
    pub parse_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmailRow {
    /// Plain-text body, falling back to the HTML body when empty.
    pub fn best_body(&self) -> &str {
        if self.body_text.trim().is_empty() {
            &self.body_html
        } else {
            &self.body_text
        }
    }
}

/// 新邮件插入请求。
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub folder: String,
    pub uid: i64,
    pub message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub date_header: Option<DateTime<Utc>>,
    pub headers: serde_json::Value,
    pub body_text: String,
    pub body_html: String,
    pub ics_content: Option<String>,
    pub attachments: serde_json::Value,
}

fn to_row(m: raw_email::Model) -> EmailRow {
    EmailRow {
        id: m.id,
        folder: m.folder,
        uid: m.uid,
        message_id: m.message_id,
        subject: m.subject,
        from_address: m.from_address,
        to_addresses: serde_json::from_str(&m.to_addresses).unwrap_or_default(),
        cc_addresses: serde_json::from_str(&m.cc_addresses).unwrap_or_default(),
        date_header: m.date_header.map(|t| t.with_timezone(&Utc)),
        headers: serde_json::from_str(&m.headers).unwrap_or_default(),
        body_text: m.body_text,
        body_html: m.body_html,
        ics_content: m.ics_content,
        attachments: serde_json::from_str(&m.attachments).unwrap_or_default(),
        received_at: m.received_at.with_timezone(&Utc),
        parse_status: m.parse_status,
        parse_error: m.parse_error,
        created_at: m.created_at.with_timezone(&Utc),
    }
}

impl MailStore {
    /// Store a fetched message. Returns `None` when `(folder, uid)` is
    /// already present — ingestion is exactly-once per folder-local UID.
    pub async fn insert_raw_email(&self, new: &NewEmail) -> Result<Option<EmailRow>> {
        let existing = Entity::find()
            .filter(Column::Folder.eq(&new.folder))
            .filter(Column::Uid.eq(new.uid))
            .one(self.db())
            .await?;
        if existing.is_some() {
            return Ok(None);
        }

        let now = Utc::now().fixed_offset();
        let am = raw_email::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            folder: Set(new.folder.clone()),
            uid: Set(new.uid),
            message_id: Set(new.message_id.clone()),
            subject: Set(new.subject.clone()),
            from_address: Set(new.from_address.clone()),
            to_addresses: Set(serde_json::to_string(&new.to_addresses)?),
            cc_addresses: Set(serde_json::to_string(&new.cc_addresses)?),
            date_header: Set(new.date_header.map(|t| t.fixed_offset())),
            headers: Set(new.headers.to_string()),
            body_text: Set(new.body_text.clone()),
            body_html: Set(new.body_html.clone()),
            ics_content: Set(new.ics_content.clone()),
            attachments: Set(new.attachments.to_string()),
            received_at: Set(now),
            parse_status: Set(ParseStatus::Pending.to_string()),
            parse_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let model = am.insert(self.db()).await?;
        Ok(Some(to_row(model)))
    }

    pub async fn get_raw_email(&self, id: &str) -> Result<Option<EmailRow>> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        Ok(model.map(to_row))
    }

    /// Advance the parse status. The lifecycle is monotonic: a terminal
    /// status is never moved back to pending here (quarantine review uses
    /// [`MailStore::requeue_raw_email`] for that explicit action).
    pub async fn set_parse_status(
        &self,
        id: &str,
        status: ParseStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        if let Some(m) = model {
            let mut am: raw_email::ActiveModel = m.into();
            am.parse_status = Set(status.to_string());
            am.parse_error = Set(error.map(|e| e.to_string()));
            am.updated_at = Set(Utc::now().fixed_offset());
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Explicit re-dispatch after quarantine review: back to pending.
    pub async fn requeue_raw_email(&self, id: &str) -> Result<bool> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        if let Some(m) = model {
            let mut am: raw_email::ActiveModel = m.into();
            am.parse_status = Set(ParseStatus::Pending.to_string());
            am.parse_error = Set(None);
            am.updated_at = Set(Utc::now().fixed_offset());
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Emails stuck in `pending` older than the threshold — input for the
    /// reprocess sweeper after a mid-pipeline crash.
    pub async fn list_stuck_pending(
        &self,
        older_than_minutes: i64,
        limit: usize,
    ) -> Result<Vec<EmailRow>> {
        let cutoff = (Utc::now() - Duration::minutes(older_than_minutes)).fixed_offset();
        let rows = Entity::find()
            .filter(Column::ParseStatus.eq(ParseStatus::Pending.to_string()))
            .filter(Column::ReceivedAt.lt(cutoff))
            .order_by(Column::ReceivedAt, Order::Asc)
            .limit(limit as u64)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    pub async fn count_raw_emails(&self, folder: Option<&str>) -> Result<u64> {
        let mut q = Entity::find();
        if let Some(f) = folder {
            q = q.filter(Column::Folder.eq(f));
        }
        Ok(q.count(self.db()).await?)
    }

    /// Delete parsed mail older than the retention horizon. Raw mail is
    /// audit state, so only terminal statuses are eligible.
    pub async fn purge_old_emails(&self, retention_days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).fixed_offset();
        let res = Entity::delete_many()
            .filter(Column::ReceivedAt.lt(cutoff))
            .filter(Column::ParseStatus.ne(ParseStatus::Pending.to_string()))
            .exec(self.db())
            .await?;
        Ok(res.rows_affected)
    }
}
