use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, EntityTrait, Order, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::entities::dead_letter::{self, Column, Entity};
use crate::MailStore;

/// 死信队列数据行（来自 dead_letter_queue 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRow {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub status: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// 死信队列统计。
#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub pending: u64,
    pub retrying: u64,
    pub failed: u64,
    pub resolved: u64,
    pub by_type: HashMap<String, u64>,
}

fn to_row(m: dead_letter::Model) -> DeadLetterRow {
    DeadLetterRow {
        id: m.id,
        event_type: m.event_type,
        payload: serde_json::from_str(&m.payload).unwrap_or_default(),
        error_message: m.error_message,
        retry_count: m.retry_count,
        max_retries: m.max_retries,
        next_retry_at: m.next_retry_at.map(|t| t.with_timezone(&Utc)),
        last_retry_at: m.last_retry_at.map(|t| t.with_timezone(&Utc)),
        status: m.status,
        resolved_at: m.resolved_at.map(|t| t.with_timezone(&Utc)),
        created_at: m.created_at.with_timezone(&Utc),
    }
}

impl MailStore {
    /// Park a failed operation for later retry.
    pub async fn push_dead_letter(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
        error: &str,
        max_retries: i64,
        next_retry_at: DateTime<Utc>,
    ) -> Result<DeadLetterRow> {
        let now = Utc::now().fixed_offset();
        let am = dead_letter::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            event_type: Set(event_type.to_string()),
            payload: Set(payload.to_string()),
            error_message: Set(error.to_string()),
            retry_count: Set(0),
            max_retries: Set(max_retries),
            next_retry_at: Set(Some(next_retry_at.fixed_offset())),
            last_retry_at: Set(None),
            status: Set("pending".to_string()),
            resolved_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let model = am.insert(self.db()).await?;
        tracing::warn!(
            dlq_id = %model.id,
            event_type,
            error = %error.chars().take(200).collect::<String>(),
            "Event added to dead-letter queue"
        );
        Ok(to_row(model))
    }

    /// Claim due entries for retry. Claiming is optimistic: each row is
    /// flipped pending -> retrying individually, so concurrent sweepers
    /// never dispatch the same entry twice.
    pub async fn claim_due_dead_letters(&self, batch_size: usize) -> Result<Vec<DeadLetterRow>> {
        let now = Utc::now().fixed_offset();
        let due = Entity::find()
            .filter(Column::Status.eq("pending"))
            .filter(
                Condition::any()
                    .add(Column::NextRetryAt.is_null())
                    .add(Column::NextRetryAt.lte(now)),
            )
            .filter(
                sea_orm::sea_query::Expr::col(Column::RetryCount)
                    .lt(sea_orm::sea_query::Expr::col(Column::MaxRetries)),
            )
            .order_by(Column::CreatedAt, Order::Asc)
            .limit(batch_size as u64)
            .all(self.db())
            .await?;

        let mut claimed = Vec::new();
        for m in due {
            let res = Entity::update_many()
                .col_expr(Column::Status, sea_orm::sea_query::Expr::value("retrying"))
                .col_expr(Column::LastRetryAt, sea_orm::sea_query::Expr::value(now))
                .col_expr(
                    Column::RetryCount,
                    sea_orm::sea_query::Expr::col(Column::RetryCount).add(1),
                )
                .col_expr(Column::UpdatedAt, sea_orm::sea_query::Expr::value(now))
                .filter(Column::Id.eq(&m.id))
                .filter(Column::Status.eq("pending"))
                .exec(self.db())
                .await?;
            if res.rows_affected == 1 {
                let mut row = to_row(m);
                row.status = "retrying".to_string();
                row.retry_count += 1;
                claimed.push(row);
            }
        }
        Ok(claimed)
    }

    pub async fn resolve_dead_letter(&self, dlq_id: &str) -> Result<bool> {
        let model = Entity::find_by_id(dlq_id).one(self.db()).await?;
        if let Some(m) = model {
            let now = Utc::now().fixed_offset();
            let mut am: dead_letter::ActiveModel = m.into();
            am.status = Set("resolved".to_string());
            am.resolved_at = Set(Some(now));
            am.updated_at = Set(now);
            am.update(self.db()).await?;
            tracing::info!(dlq_id, "DLQ item resolved");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Record a failed retry. Entries with retries left go back to pending
    /// with the caller-computed backoff; exhausted entries become failed.
    pub async fn fail_dead_letter(
        &self,
        dlq_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let model = Entity::find_by_id(dlq_id).one(self.db()).await?;
        let Some(m) = model else {
            return Ok(false);
        };
        let exhausted = m.retry_count >= m.max_retries;
        let now = Utc::now().fixed_offset();
        let mut am: dead_letter::ActiveModel = m.into();
        am.error_message = Set(error.to_string());
        am.updated_at = Set(now);
        if exhausted {
            am.status = Set("failed".to_string());
            am.next_retry_at = Set(None);
            am.update(self.db()).await?;
            tracing::error!(dlq_id, error = %error.chars().take(200).collect::<String>(), "DLQ item permanently failed");
        } else {
            am.status = Set("pending".to_string());
            am.next_retry_at = Set(next_retry_at.map(|t| t.fixed_offset()));
            am.update(self.db()).await?;
            tracing::info!(dlq_id, next_retry = ?next_retry_at, "DLQ item scheduled for retry");
        }
        Ok(true)
    }

    pub async fn dlq_stats(&self) -> Result<DlqStats> {
        let rows = Entity::find().all(self.db()).await?;
        let mut stats = DlqStats {
            pending: 0,
            retrying: 0,
            failed: 0,
            resolved: 0,
            by_type: HashMap::new(),
        };
        for r in rows {
            match r.status.as_str() {
                "pending" => stats.pending += 1,
                "retrying" => stats.retrying += 1,
                "failed" => stats.failed += 1,
                "resolved" => stats.resolved += 1,
                _ => {}
            }
            if r.status == "pending" || r.status == "retrying" {
                *stats.by_type.entry(r.event_type).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    pub async fn count_dead_letters(&self, status: Option<&str>) -> Result<u64> {
        let mut q = Entity::find();
        if let Some(s) = status {
            q = q.filter(Column::Status.eq(s));
        }
        Ok(q.count(self.db()).await?)
    }

    /// Delete resolved/failed entries older than the horizon.
    pub async fn cleanup_old_dead_letters(&self, days: i64) -> Result<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).fixed_offset();
        let res = Entity::delete_many()
            .filter(Column::Status.is_in(vec!["resolved", "failed"]))
            .filter(Column::CreatedAt.lt(cutoff))
            .exec(self.db())
            .await?;
        Ok(res.rows_affected)
    }
}
