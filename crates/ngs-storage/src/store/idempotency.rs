use anyhow::Result;
use chrono::{Duration, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter,
};

use crate::entities::idempotency_key::{self, Column, Entity};
use crate::MailStore;

/// Outcome of reserving an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// The key is newly reserved (or reclaimed from a stale reservation);
    /// the caller owns the operation.
    Fresh,
    /// Another worker holds a non-stale reservation.
    InProgress,
    /// The operation already completed; the stored result is returned.
    Completed(Option<serde_json::Value>),
}

impl MailStore {
    /// Atomically reserve `key` for processing.
    ///
    /// The reservation is an INSERT .. ON CONFLICT DO NOTHING followed by
    /// a read-back: whoever inserted the row owns it. A `processing` row
    /// older than `stale_after_minutes` is treated as abandoned and
    /// reclaimed.
    pub async fn idempotency_begin(
        &self,
        key: &str,
        ttl_hours: i64,
        stale_after_minutes: i64,
    ) -> Result<IdempotencyOutcome> {
        let now = Utc::now();
        let am = idempotency_key::ActiveModel {
            key: Set(key.to_string()),
            status: Set("processing".to_string()),
            result: Set(None),
            expires_at: Set((now + Duration::hours(ttl_hours)).fixed_offset()),
            created_at: Set(now.fixed_offset()),
            updated_at: Set(now.fixed_offset()),
        };
        let insert = Entity::insert(am)
            .on_conflict(
                OnConflict::column(Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db())
            .await?;
        if insert > 0 {
            return Ok(IdempotencyOutcome::Fresh);
        }

        let existing = Entity::find_by_id(key)
            .one(self.db())
            .await?
            .ok_or_else(|| anyhow::anyhow!("idempotency key vanished: {key}"))?;

        // Expired rows behave as absent.
        if existing.expires_at.with_timezone(&Utc) < now {
            let mut am: idempotency_key::ActiveModel = existing.into();
            am.status = Set("processing".to_string());
            am.result = Set(None);
            am.expires_at = Set((now + Duration::hours(ttl_hours)).fixed_offset());
            am.updated_at = Set(now.fixed_offset());
            am.update(self.db()).await?;
            return Ok(IdempotencyOutcome::Fresh);
        }

        match existing.status.as_str() {
            "completed" => {
                let result = existing
                    .result
                    .as_deref()
                    .and_then(|r| serde_json::from_str(r).ok());
                Ok(IdempotencyOutcome::Completed(result))
            }
            _ => {
                let age = now - existing.updated_at.with_timezone(&Utc);
                if age > Duration::minutes(stale_after_minutes) {
                    tracing::info!(key = %&key[..key.len().min(16)], "Reclaiming stale idempotency reservation");
                    let mut am: idempotency_key::ActiveModel = existing.into();
                    am.status = Set("processing".to_string());
                    am.updated_at = Set(now.fixed_offset());
                    am.update(self.db()).await?;
                    Ok(IdempotencyOutcome::Fresh)
                } else {
                    Ok(IdempotencyOutcome::InProgress)
                }
            }
        }
    }

    /// Mark a reserved key as completed with its result.
    pub async fn idempotency_complete(
        &self,
        key: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let model = Entity::find_by_id(key).one(self.db()).await?;
        if let Some(m) = model {
            let mut am: idempotency_key::ActiveModel = m.into();
            am.status = Set("completed".to_string());
            am.result = Set(result.map(|v| v.to_string()));
            am.updated_at = Set(Utc::now().fixed_offset());
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release a reservation after a failure so a retry may reclaim it
    /// immediately.
    pub async fn idempotency_fail(&self, key: &str) -> Result<bool> {
        let model = Entity::find_by_id(key).one(self.db()).await?;
        if let Some(m) = model {
            let mut am: idempotency_key::ActiveModel = m.into();
            am.status = Set("failed".to_string());
            // Backdate so the stale-reclaim path picks it up at once.
            am.updated_at = Set((Utc::now() - Duration::days(1)).fixed_offset());
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drop expired keys. Returns the number deleted.
    pub async fn cleanup_expired_idempotency_keys(&self) -> Result<u64> {
        let now = Utc::now().fixed_offset();
        let res = Entity::delete_many()
            .filter(Column::ExpiresAt.lt(now))
            .exec(self.db())
            .await?;
        if res.rows_affected > 0 {
            tracing::info!(deleted = res.rows_affected, "Cleaned up expired idempotency keys");
        }
        Ok(res.rows_affected)
    }
}
