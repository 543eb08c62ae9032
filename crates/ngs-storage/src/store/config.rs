use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, Order, QueryFilter, QueryOrder,
    QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::entities::config_version::{self, Column, Entity};
use crate::MailStore;
use ngs_common::hash::sha256_hex;

/// 配置版本数据行（来自 config_versions 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigVersionRow {
    pub id: String,
    pub config_type: String,
    pub config_hash: String,
    pub config_data: serde_json::Value,
    pub created_by: String,
    pub notes: Option<String>,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn to_row(m: config_version::Model) -> ConfigVersionRow {
    ConfigVersionRow {
        id: m.id,
        config_type: m.config_type,
        config_hash: m.config_hash,
        config_data: serde_json::from_str(&m.config_data).unwrap_or_default(),
        created_by: m.created_by,
        notes: m.notes,
        is_active: m.is_active,
        activated_at: m.activated_at.map(|t| t.with_timezone(&Utc)),
        created_at: m.created_at.with_timezone(&Utc),
    }
}

/// Stable hash over the canonical JSON form of a configuration snapshot.
pub fn config_hash(data: &serde_json::Value) -> String {
    sha256_hex(&data.to_string())
}

impl MailStore {
    /// Save a configuration snapshot as a new version. Identical content
    /// (same hash) reuses the existing version. When `activate` is set the
    /// previous active version of the same type is deactivated first.
    pub async fn save_config_version(
        &self,
        config_type: &str,
        data: &serde_json::Value,
        created_by: &str,
        notes: Option<&str>,
        activate: bool,
    ) -> Result<ConfigVersionRow> {
        let hash = config_hash(data);

        let existing = Entity::find()
            .filter(Column::ConfigType.eq(config_type))
            .filter(Column::ConfigHash.eq(&hash))
            .one(self.db())
            .await?;

        if let Some(m) = existing {
            let id = m.id.clone();
            if activate && !m.is_active {
                self.activate_config_version(config_type, &id).await?;
            }
            tracing::info!(config_type, version_id = %id, "Config version already exists");
            return Ok(to_row(
                Entity::find_by_id(&id)
                    .one(self.db())
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("config version vanished: {id}"))?,
            ));
        }

        if activate {
            self.deactivate_active_version(config_type).await?;
        }

        let now = Utc::now().fixed_offset();
        let am = config_version::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            config_type: Set(config_type.to_string()),
            config_hash: Set(hash.clone()),
            config_data: Set(data.to_string()),
            created_by: Set(created_by.to_string()),
            notes: Set(notes.map(|n| n.to_string())),
            is_active: Set(activate),
            activated_at: Set(activate.then_some(now)),
            deactivated_at: Set(None),
            created_at: Set(now),
        };
        let model = am.insert(self.db()).await?;
        tracing::info!(
            config_type,
            version_id = %model.id,
            hash = %&hash[..16],
            activated = activate,
            "Saved config version"
        );
        Ok(to_row(model))
    }

    async fn deactivate_active_version(&self, config_type: &str) -> Result<()> {
        let active = Entity::find()
            .filter(Column::ConfigType.eq(config_type))
            .filter(Column::IsActive.eq(true))
            .all(self.db())
            .await?;
        let now = Utc::now().fixed_offset();
        for m in active {
            let mut am: config_version::ActiveModel = m.into();
            am.is_active = Set(false);
            am.deactivated_at = Set(Some(now));
            am.update(self.db()).await?;
        }
        Ok(())
    }

    /// Activate a specific version (rollback selects a prior one).
    pub async fn activate_config_version(&self, config_type: &str, version_id: &str) -> Result<bool> {
        let target = Entity::find_by_id(version_id).one(self.db()).await?;
        let Some(m) = target else {
            return Ok(false);
        };
        if m.config_type != config_type {
            anyhow::bail!(
                "version {version_id} belongs to config type {} not {config_type}",
                m.config_type
            );
        }

        self.deactivate_active_version(config_type).await?;

        let now = Utc::now().fixed_offset();
        let mut am: config_version::ActiveModel = m.into();
        am.is_active = Set(true);
        am.activated_at = Set(Some(now));
        am.deactivated_at = Set(None);
        am.update(self.db()).await?;
        tracing::info!(config_type, version_id, "Config version activated");
        Ok(true)
    }

    pub async fn active_config_version(&self, config_type: &str) -> Result<Option<ConfigVersionRow>> {
        let model = Entity::find()
            .filter(Column::ConfigType.eq(config_type))
            .filter(Column::IsActive.eq(true))
            .one(self.db())
            .await?;
        Ok(model.map(to_row))
    }

    pub async fn list_config_versions(
        &self,
        config_type: &str,
        limit: usize,
    ) -> Result<Vec<ConfigVersionRow>> {
        let rows = Entity::find()
            .filter(Column::ConfigType.eq(config_type))
            .order_by(Column::CreatedAt, Order::Desc)
            .limit(limit as u64)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }
}
