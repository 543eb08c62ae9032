use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, Order, QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};

use crate::entities::maintenance_match;
use crate::entities::maintenance_window::{self, Column, Entity};
use crate::MailStore;
use ngs_common::types::{SuppressMode, WindowSource};

/// 维护窗口数据行（来自 maintenance_windows 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRow {
    pub id: String,
    pub source: WindowSource,
    pub raw_email_id: Option<String>,
    pub external_event_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub organizer: Option<String>,
    pub organizer_email: Option<String>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub timezone: String,
    pub scope: serde_json::Value,
    pub suppress_mode: SuppressMode,
    pub is_active: bool,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新维护窗口插入/更新请求。
#[derive(Debug, Clone)]
pub struct NewWindow {
    pub source: WindowSource,
    pub raw_email_id: Option<String>,
    pub external_event_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub organizer: Option<String>,
    pub organizer_email: Option<String>,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub timezone: String,
    pub scope: serde_json::Value,
    pub suppress_mode: SuppressMode,
    pub is_recurring: bool,
    pub recurrence_rule: Option<String>,
}

/// What a maintenance match refers to.
#[derive(Debug, Clone)]
pub enum MatchTarget {
    Incident(String),
    Event(String),
}

fn to_row(m: maintenance_window::Model) -> WindowRow {
    WindowRow {
        id: m.id,
        source: match m.source.as_str() {
            "email" => WindowSource::Email,
            "graph" => WindowSource::Graph,
            _ => WindowSource::Manual,
        },
        raw_email_id: m.raw_email_id,
        external_event_id: m.external_event_id,
        title: m.title,
        description: m.description,
        organizer: m.organizer,
        organizer_email: m.organizer_email,
        start_ts: m.start_ts.with_timezone(&Utc),
        end_ts: m.end_ts.with_timezone(&Utc),
        timezone: m.timezone,
        scope: serde_json::from_str(&m.scope).unwrap_or_default(),
        suppress_mode: m.suppress_mode.parse().unwrap_or(SuppressMode::Mute),
        is_active: m.is_active,
        is_recurring: m.is_recurring,
        recurrence_rule: m.recurrence_rule,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    }
}

impl MailStore {
    /// Create a window, or update the times/scope of an existing one with
    /// the same (source, external_event_id). end > start is enforced here;
    /// a violating request is a data error and is rejected.
    pub async fn upsert_maintenance_window(&self, new: &NewWindow) -> Result<WindowRow> {
        anyhow::ensure!(
            new.end_ts > new.start_ts,
            "maintenance window end ({}) must be after start ({})",
            new.end_ts,
            new.start_ts
        );

        if let Some(ext_id) = new.external_event_id.as_deref() {
            let existing = Entity::find()
                .filter(Column::Source.eq(new.source.to_string()))
                .filter(Column::ExternalEventId.eq(ext_id))
                .one(self.db())
                .await?;
            if let Some(m) = existing {
                let mut am: maintenance_window::ActiveModel = m.into();
                am.title = Set(new.title.clone());
                am.start_ts = Set(new.start_ts.fixed_offset());
                am.end_ts = Set(new.end_ts.fixed_offset());
                am.timezone = Set(new.timezone.clone());
                am.scope = Set(new.scope.to_string());
                am.suppress_mode = Set(new.suppress_mode.to_string());
                am.is_recurring = Set(new.is_recurring);
                am.recurrence_rule = Set(new.recurrence_rule.clone());
                am.updated_at = Set(Utc::now().fixed_offset());
                let updated = am.update(self.db()).await?;
                tracing::info!(window_id = %updated.id, external_event_id = ext_id, "Maintenance window updated");
                return Ok(to_row(updated));
            }
        }

        let now = Utc::now().fixed_offset();
        let am = maintenance_window::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            source: Set(new.source.to_string()),
            raw_email_id: Set(new.raw_email_id.clone()),
            external_event_id: Set(new.external_event_id.clone()),
            title: Set(new.title.clone()),
            description: Set(new.description.clone()),
            organizer: Set(new.organizer.clone()),
            organizer_email: Set(new.organizer_email.clone()),
            start_ts: Set(new.start_ts.fixed_offset()),
            end_ts: Set(new.end_ts.fixed_offset()),
            timezone: Set(new.timezone.clone()),
            scope: Set(new.scope.to_string()),
            suppress_mode: Set(new.suppress_mode.to_string()),
            is_active: Set(true),
            is_recurring: Set(new.is_recurring),
            recurrence_rule: Set(new.recurrence_rule.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let model = am.insert(self.db()).await?;
        tracing::info!(window_id = %model.id, title = %model.title, "Maintenance window created");
        Ok(to_row(model))
    }

    /// Windows active at instant `t`.
    pub async fn list_active_windows(&self, t: DateTime<Utc>) -> Result<Vec<WindowRow>> {
        let t = t.fixed_offset();
        let rows = Entity::find()
            .filter(Column::IsActive.eq(true))
            .filter(Column::StartTs.lte(t))
            .filter(Column::EndTs.gte(t))
            .order_by(Column::StartTs, Order::Asc)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    pub async fn get_maintenance_window(&self, id: &str) -> Result<Option<WindowRow>> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        Ok(model.map(to_row))
    }

    /// Deactivate a window identified by its calendar UID (ICS
    /// STATUS:CANCELLED path).
    pub async fn deactivate_window_by_external_id(
        &self,
        source: WindowSource,
        external_event_id: &str,
    ) -> Result<bool> {
        let existing = Entity::find()
            .filter(Column::Source.eq(source.to_string()))
            .filter(Column::ExternalEventId.eq(external_event_id))
            .one(self.db())
            .await?;
        if let Some(m) = existing {
            let id = m.id.clone();
            let mut am: maintenance_window::ActiveModel = m.into();
            am.is_active = Set(false);
            am.updated_at = Set(Utc::now().fixed_offset());
            am.update(self.db()).await?;
            tracing::info!(window_id = %id, external_event_id, "Maintenance window cancelled");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Record why a window matched an incident or event. Idempotent per
    /// (window, target) pair.
    pub async fn insert_maintenance_match(
        &self,
        window_id: &str,
        target: &MatchTarget,
        match_reason: &serde_json::Value,
    ) -> Result<()> {
        use crate::entities::maintenance_match::{Column as MCol, Entity as MEntity};

        let (incident_id, event_id) = match target {
            MatchTarget::Incident(id) => (Some(id.clone()), None),
            MatchTarget::Event(id) => (None, Some(id.clone())),
        };

        let mut q = MEntity::find().filter(MCol::MaintenanceWindowId.eq(window_id));
        q = match target {
            MatchTarget::Incident(id) => q.filter(MCol::IncidentId.eq(id.as_str())),
            MatchTarget::Event(id) => q.filter(MCol::AlertEventId.eq(id.as_str())),
        };
        if q.one(self.db()).await?.is_some() {
            return Ok(());
        }

        let am = maintenance_match::ActiveModel {
            id: Set(ngs_common::id::next_id()),
            maintenance_window_id: Set(window_id.to_string()),
            incident_id: Set(incident_id),
            alert_event_id: Set(event_id),
            match_reason: Set(match_reason.to_string()),
            created_at: Set(Utc::now().fixed_offset()),
        };
        am.insert(self.db()).await?;
        Ok(())
    }

    pub async fn list_matches_for_window(
        &self,
        window_id: &str,
    ) -> Result<Vec<(Option<String>, Option<String>, serde_json::Value)>> {
        use crate::entities::maintenance_match::{Column as MCol, Entity as MEntity};
        let rows = MEntity::find()
            .filter(MCol::MaintenanceWindowId.eq(window_id))
            .all(self.db())
            .await?;
        Ok(rows
            .into_iter()
            .map(|m| {
                (
                    m.incident_id,
                    m.alert_event_id,
                    serde_json::from_str(&m.match_reason).unwrap_or_default(),
                )
            })
            .collect())
    }
}
