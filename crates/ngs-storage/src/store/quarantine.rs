use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, Order, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::entities::quarantine_event::{self, Column, Entity};
use crate::MailStore;
use ngs_common::types::ParseStatus;

/// Review decision for a quarantined extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineAction {
    Approved,
    Rejected,
    Edited,
}

impl QuarantineAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineAction::Approved => "approved",
            QuarantineAction::Rejected => "rejected",
            QuarantineAction::Edited => "edited",
        }
    }
}

/// 隔离区数据行（来自 quarantine_events 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRow {
    pub id: String,
    pub raw_email_id: String,
    pub extraction_data: serde_json::Value,
    pub confidence: f64,
    pub quarantine_reason: String,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub action_taken: Option<String>,
    pub edited_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

fn to_row(m: quarantine_event::Model) -> QuarantineRow {
    QuarantineRow {
        id: m.id,
        raw_email_id: m.raw_email_id,
        extraction_data: serde_json::from_str(&m.extraction_data).unwrap_or_default(),
        confidence: m.confidence,
        quarantine_reason: m.quarantine_reason,
        reviewed_at: m.reviewed_at.map(|t| t.with_timezone(&Utc)),
        reviewed_by: m.reviewed_by,
        action_taken: m.action_taken,
        edited_data: m
            .edited_data
            .as_deref()
            .and_then(|d| serde_json::from_str(d).ok()),
        created_at: m.created_at.with_timezone(&Utc),
    }
}

impl MailStore {
    /// Hold a low-confidence or invalid extraction for human review.
    pub async fn insert_quarantine(
        &self,
        raw_email_id: &str,
        extraction_data: &serde_json::Value,
        confidence: f64,
        reason: &str,
    ) -> Result<QuarantineRow> {
        let am = quarantine_event::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            raw_email_id: Set(raw_email_id.to_string()),
            extraction_data: Set(extraction_data.to_string()),
            confidence: Set(confidence),
            quarantine_reason: Set(reason.to_string()),
            reviewed_at: Set(None),
            reviewed_by: Set(None),
            action_taken: Set(None),
            edited_data: Set(None),
            created_at: Set(Utc::now().fixed_offset()),
        };
        let model = am.insert(self.db()).await?;
        tracing::info!(
            quarantine_id = %model.id,
            email_id = %raw_email_id,
            confidence,
            reason,
            "Event quarantined"
        );
        Ok(to_row(model))
    }

    pub async fn list_pending_quarantine(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<QuarantineRow>> {
        let rows = Entity::find()
            .filter(Column::ReviewedAt.is_null())
            .order_by(Column::CreatedAt, Order::Asc)
            .limit(limit as u64)
            .offset(offset as u64)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    pub async fn count_pending_quarantine(&self) -> Result<u64> {
        Ok(Entity::find()
            .filter(Column::ReviewedAt.is_null())
            .count(self.db())
            .await?)
    }

    /// Apply a review decision. Approved/edited items re-queue the raw
    /// email for the normal pipeline; rejected items mark it failed.
    /// Returns false when the item is unknown or already reviewed.
    pub async fn review_quarantine(
        &self,
        quarantine_id: &str,
        action: QuarantineAction,
        reviewer: &str,
        edited_data: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let model = Entity::find_by_id(quarantine_id).one(self.db()).await?;
        let Some(m) = model else {
            return Ok(false);
        };
        if m.reviewed_at.is_some() {
            tracing::warn!(quarantine_id, "Quarantine item already reviewed");
            return Ok(false);
        }
        let raw_email_id = m.raw_email_id.clone();

        let mut am: quarantine_event::ActiveModel = m.into();
        am.reviewed_at = Set(Some(Utc::now().fixed_offset()));
        am.reviewed_by = Set(Some(reviewer.to_string()));
        am.action_taken = Set(Some(action.as_str().to_string()));
        am.edited_data = Set(edited_data.map(|v| v.to_string()));
        am.update(self.db()).await?;

        match action {
            QuarantineAction::Approved | QuarantineAction::Edited => {
                self.requeue_raw_email(&raw_email_id).await?;
                tracing::info!(
                    quarantine_id,
                    email_id = %raw_email_id,
                    action = action.as_str(),
                    "Quarantine item approved for reprocessing"
                );
            }
            QuarantineAction::Rejected => {
                self.set_parse_status(
                    &raw_email_id,
                    ParseStatus::Failed,
                    Some("rejected during quarantine review"),
                )
                .await?;
                tracing::info!(
                    quarantine_id,
                    email_id = %raw_email_id,
                    "Quarantine item rejected"
                );
            }
        }
        Ok(true)
    }

    /// Delete reviewed quarantine records older than the horizon.
    pub async fn cleanup_old_quarantine(&self, days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).fixed_offset();
        let res = Entity::delete_many()
            .filter(Column::ReviewedAt.is_not_null())
            .filter(Column::ReviewedAt.lt(cutoff))
            .exec(self.db())
            .await?;
        Ok(res.rows_affected)
    }
}
