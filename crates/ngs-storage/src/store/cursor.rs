use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait};
use serde::{Deserialize, Serialize};

use crate::entities::folder_cursor::{self, Entity};
use crate::MailStore;

/// 文件夹游标数据行（来自 folder_cursors 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorRow {
    pub folder: String,
    pub last_uid: i64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: i64,
    pub emails_processed: i64,
}

fn to_row(m: folder_cursor::Model) -> CursorRow {
    CursorRow {
        folder: m.folder,
        last_uid: m.last_uid,
        last_poll_at: m.last_poll_at.map(|t| t.with_timezone(&Utc)),
        last_success_at: m.last_success_at.map(|t| t.with_timezone(&Utc)),
        last_error: m.last_error,
        error_count: m.error_count,
        emails_processed: m.emails_processed,
    }
}

impl MailStore {
    pub async fn get_cursor(&self, folder: &str) -> Result<Option<CursorRow>> {
        let model = Entity::find_by_id(folder).one(self.db()).await?;
        Ok(model.map(to_row))
    }

    /// Advance the cursor after a successful batch. The stored UID never
    /// moves backwards, and a success clears the error counter.
    pub async fn advance_cursor(
        &self,
        folder: &str,
        uid: i64,
        processed: i64,
    ) -> Result<CursorRow> {
        let now = Utc::now().fixed_offset();
        let existing = Entity::find_by_id(folder).one(self.db()).await?;
        let model = match existing {
            Some(m) => {
                let new_uid = m.last_uid.max(uid);
                let processed_total = m.emails_processed + processed;
                let mut am: folder_cursor::ActiveModel = m.into();
                am.last_uid = Set(new_uid);
                am.last_poll_at = Set(Some(now));
                am.last_success_at = Set(Some(now));
                am.last_error = Set(None);
                am.error_count = Set(0);
                am.emails_processed = Set(processed_total);
                am.updated_at = Set(now);
                am.update(self.db()).await?
            }
            None => {
                let am = folder_cursor::ActiveModel {
                    folder: Set(folder.to_string()),
                    last_uid: Set(uid),
                    last_poll_at: Set(Some(now)),
                    last_success_at: Set(Some(now)),
                    last_error: Set(None),
                    error_count: Set(0),
                    emails_processed: Set(processed),
                    updated_at: Set(now),
                };
                am.insert(self.db()).await?
            }
        };
        Ok(to_row(model))
    }

    /// Record a poll failure. The cursor UID is left untouched so the next
    /// poll retries the same range.
    pub async fn record_poll_error(&self, folder: &str, error: &str) -> Result<CursorRow> {
        let now = Utc::now().fixed_offset();
        let existing = Entity::find_by_id(folder).one(self.db()).await?;
        let model = match existing {
            Some(m) => {
                let errors = m.error_count + 1;
                let mut am: folder_cursor::ActiveModel = m.into();
                am.last_poll_at = Set(Some(now));
                am.last_error = Set(Some(error.to_string()));
                am.error_count = Set(errors);
                am.updated_at = Set(now);
                am.update(self.db()).await?
            }
            None => {
                let am = folder_cursor::ActiveModel {
                    folder: Set(folder.to_string()),
                    last_uid: Set(0),
                    last_poll_at: Set(Some(now)),
                    last_success_at: Set(None),
                    last_error: Set(Some(error.to_string())),
                    error_count: Set(1),
                    emails_processed: Set(0),
                    updated_at: Set(now),
                };
                am.insert(self.db()).await?
            }
        };
        Ok(to_row(model))
    }

    pub async fn list_cursors(&self) -> Result<Vec<CursorRow>> {
        let rows = Entity::find().all(self.db()).await?;
        Ok(rows.into_iter().map(to_row).collect())
    }
}
