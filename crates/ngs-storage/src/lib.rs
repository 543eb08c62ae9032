//! Relational storage layer for the ingestion-to-incident pipeline.
//!
//! [`MailStore`] is the single durable interface: raw mail, alert events,
//! incidents, maintenance windows, the pattern cache, quarantine, the
//! dead-letter queue, idempotency keys and folder cursors all live in one
//! SQLite database managed through SeaORM. The partial unique index on
//! `incidents(fingerprint_v2)` for live statuses is created by the
//! migration and is what makes the correlator safe against races.

pub mod entities;
pub mod store;

#[cfg(test)]
mod tests;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::path::Path;

pub use store::config::ConfigVersionRow;
pub use store::cursor::CursorRow;
pub use store::dlq::{DeadLetterRow, DlqStats};
pub use store::email::{EmailRow, NewEmail};
pub use store::event::{EventRow, NewAlertEvent};
pub use store::idempotency::IdempotencyOutcome;
pub use store::incident::{IncidentRow, NewIncident};
pub use store::maintenance::{MatchTarget, NewWindow, WindowRow};
pub use store::pattern::{ExtractionLogEntry, NewPattern, PatternRow};
pub use store::quarantine::{QuarantineAction, QuarantineRow};

/// 邮件管线数据库（ngs.db）的统一访问层。
///
/// 所有方法均为 `async fn`，底层使用 SeaORM + SQLite（WAL 模式）。
pub struct MailStore {
    pub(crate) db: DatabaseConnection,
}

impl MailStore {
    /// 连接并初始化数据库，自动运行迁移确保 Schema 最新。
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("ngs.db");
        let url = format!(
            "sqlite://{}?mode=rwc",
            db_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("non-UTF-8 data_dir path"))?
        );
        let db = Database::connect(&url).await?;

        db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;

        Migrator::up(&db, None).await?;

        tracing::info!(path = %db_path.display(), "Initialized mail store (SeaORM)");

        Ok(Self { db })
    }

    /// 返回底层数据库连接引用（供子模块使用）。
    pub(crate) fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Begin a transaction for multi-step updates (correlator path).
    pub async fn begin(&self) -> Result<DatabaseTransaction> {
        Ok(self.db.begin().await?)
    }
}
