use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, Order,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::entities::incident::{self, Column, Entity};
use crate::entities::incident_event::{self, Column as LinkCol, Entity as LinkEntity};
use crate::MailStore;
use ngs_common::types::{AlertState, IncidentStatus, Severity};

/// 事件簇数据行（来自 incidents 表）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRow {
    pub id: String,
    pub fingerprint_v2: String,
    pub title: String,
    pub source_tool: String,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub check_name: Option<String>,
    pub service: Option<String>,
    pub status: IncidentStatus,
    pub severity_current: Severity,
    pub severity_max: Severity,
    pub last_state: AlertState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub event_count: i64,
    pub flap_count: i64,
    pub flap_window_started_at: Option<DateTime<Utc>>,
    pub flap_window_count: i64,
    pub is_flapping: bool,
    pub last_state_change_at: Option<DateTime<Utc>>,
    pub is_in_maintenance: bool,
    pub maintenance_window_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新事件簇插入请求。
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub fingerprint_v2: String,
    pub title: String,
    pub source_tool: String,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub check_name: Option<String>,
    pub service: Option<String>,
    pub severity: Severity,
    pub state: AlertState,
    pub first_seen_at: DateTime<Utc>,
    pub is_in_maintenance: bool,
    pub maintenance_window_id: Option<String>,
}

pub(crate) fn to_row(m: incident::Model) -> IncidentRow {
    IncidentRow {
        id: m.id,
        fingerprint_v2: m.fingerprint_v2,
        title: m.title,
        source_tool: m.source_tool,
        environment: m.environment,
        region: m.region,
        host: m.host,
        check_name: m.check_name,
        service: m.service,
        status: m.status.parse().unwrap_or(IncidentStatus::Open),
        severity_current: m.severity_current.parse().unwrap_or(Severity::Medium),
        severity_max: m.severity_max.parse().unwrap_or(Severity::Medium),
        last_state: m.last_state.parse().unwrap_or(AlertState::Unknown),
        first_seen_at: m.first_seen_at.with_timezone(&Utc),
        last_seen_at: m.last_seen_at.with_timezone(&Utc),
        resolved_at: m.resolved_at.map(|t| t.with_timezone(&Utc)),
        resolution_reason: m.resolution_reason,
        event_count: m.event_count,
        flap_count: m.flap_count,
        flap_window_started_at: m.flap_window_started_at.map(|t| t.with_timezone(&Utc)),
        flap_window_count: m.flap_window_count,
        is_flapping: m.is_flapping,
        last_state_change_at: m.last_state_change_at.map(|t| t.with_timezone(&Utc)),
        is_in_maintenance: m.is_in_maintenance,
        maintenance_window_id: m.maintenance_window_id,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    }
}

/// The unique live incident for a fingerprint, if any. The partial
/// unique index guarantees at most one row can match.
pub async fn find_live_by_fingerprint_on<C: ConnectionTrait>(
    conn: &C,
    fingerprint: &str,
) -> Result<Option<IncidentRow>> {
    let model = Entity::find()
        .filter(Column::FingerprintV2.eq(fingerprint))
        .filter(Column::Status.is_in(vec![
            IncidentStatus::Open.to_string(),
            IncidentStatus::Acknowledged.to_string(),
            IncidentStatus::Resolving.to_string(),
        ]))
        .one(conn)
        .await?;
    Ok(model.map(to_row))
}

pub async fn insert_incident_on<C: ConnectionTrait>(
    conn: &C,
    new: &NewIncident,
) -> Result<IncidentRow> {
    let now = Utc::now().fixed_offset();
    let first_seen = new.first_seen_at.fixed_offset();
    let am = incident::ActiveModel {
        id: Set(ngs_common::id::next_id()),
        fingerprint_v2: Set(new.fingerprint_v2.clone()),
        title: Set(new.title.clone()),
        source_tool: Set(new.source_tool.clone()),
        environment: Set(new.environment.clone()),
        region: Set(new.region.clone()),
        host: Set(new.host.clone()),
        check_name: Set(new.check_name.clone()),
        service: Set(new.service.clone()),
        status: Set(IncidentStatus::Open.to_string()),
        severity_current: Set(new.severity.to_string()),
        severity_max: Set(new.severity.to_string()),
        last_state: Set(new.state.to_string()),
        first_seen_at: Set(first_seen),
        last_seen_at: Set(first_seen),
        resolved_at: Set(None),
        resolution_reason: Set(None),
        event_count: Set(1),
        flap_count: Set(0),
        flap_window_started_at: Set(None),
        flap_window_count: Set(0),
        is_flapping: Set(false),
        last_state_change_at: Set(Some(first_seen)),
        is_in_maintenance: Set(new.is_in_maintenance),
        maintenance_window_id: Set(new.maintenance_window_id.clone()),
        ai_summary: Set(None),
        ai_probable_cause: Set(None),
        ai_enriched_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };
    let model = am.insert(conn).await?;
    Ok(to_row(model))
}

/// Persist the full mutable state of an incident row. The correlator is
/// the only writer, serialized per fingerprint, so a whole-row update is
/// race-free by construction.
pub async fn update_incident_on<C: ConnectionTrait>(conn: &C, row: &IncidentRow) -> Result<()> {
    let model = Entity::find_by_id(&row.id)
        .one(conn)
        .await?
        .ok_or_else(|| anyhow::anyhow!("incident {} disappeared during update", row.id))?;
    let mut am: incident::ActiveModel = model.into();
    am.title = Set(row.title.clone());
    am.status = Set(row.status.to_string());
    am.severity_current = Set(row.severity_current.to_string());
    am.severity_max = Set(row.severity_max.to_string());
    am.last_state = Set(row.last_state.to_string());
    am.first_seen_at = Set(row.first_seen_at.fixed_offset());
    am.last_seen_at = Set(row.last_seen_at.fixed_offset());
    am.resolved_at = Set(row.resolved_at.map(|t| t.fixed_offset()));
    am.resolution_reason = Set(row.resolution_reason.clone());
    am.event_count = Set(row.event_count);
    am.flap_count = Set(row.flap_count);
    am.flap_window_started_at = Set(row.flap_window_started_at.map(|t| t.fixed_offset()));
    am.flap_window_count = Set(row.flap_window_count);
    am.is_flapping = Set(row.is_flapping);
    am.last_state_change_at = Set(row.last_state_change_at.map(|t| t.fixed_offset()));
    am.is_in_maintenance = Set(row.is_in_maintenance);
    am.maintenance_window_id = Set(row.maintenance_window_id.clone());
    am.updated_at = Set(Utc::now().fixed_offset());
    am.update(conn).await?;
    Ok(())
}

/// Link an event to an incident. Idempotent on the (incident, event)
/// pair.
pub async fn link_event_on<C: ConnectionTrait>(
    conn: &C,
    incident_id: &str,
    alert_event_id: &str,
    is_deduplicated: bool,
) -> Result<()> {
    let existing = LinkEntity::find()
        .filter(LinkCol::IncidentId.eq(incident_id))
        .filter(LinkCol::AlertEventId.eq(alert_event_id))
        .one(conn)
        .await?;
    if existing.is_some() {
        return Ok(());
    }
    let am = incident_event::ActiveModel {
        id: Set(ngs_common::id::next_id()),
        incident_id: Set(incident_id.to_string()),
        alert_event_id: Set(alert_event_id.to_string()),
        is_deduplicated: Set(is_deduplicated),
        created_at: Set(Utc::now().fixed_offset()),
    };
    am.insert(conn).await?;
    Ok(())
}

/// Most recently resolved incident for a fingerprint within the lookback
/// window. Used to attach late resolution events instead of dropping them.
pub async fn recent_resolved_by_fingerprint_on<C: ConnectionTrait>(
    conn: &C,
    fingerprint: &str,
    lookback: Duration,
) -> Result<Option<IncidentRow>> {
    let cutoff = (Utc::now() - lookback).fixed_offset();
    let model = Entity::find()
        .filter(Column::FingerprintV2.eq(fingerprint))
        .filter(Column::Status.eq(IncidentStatus::Resolved.to_string()))
        .filter(Column::ResolvedAt.gte(cutoff))
        .order_by(Column::ResolvedAt, Order::Desc)
        .one(conn)
        .await?;
    Ok(model.map(to_row))
}

impl MailStore {
    pub async fn get_incident(&self, id: &str) -> Result<Option<IncidentRow>> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        Ok(model.map(to_row))
    }

    pub async fn find_live_incident(&self, fingerprint: &str) -> Result<Option<IncidentRow>> {
        find_live_by_fingerprint_on(self.db(), fingerprint).await
    }

    pub async fn count_incidents(&self, status: Option<IncidentStatus>) -> Result<u64> {
        let mut q = Entity::find();
        if let Some(s) = status {
            q = q.filter(Column::Status.eq(s.to_string()));
        }
        Ok(q.count(self.db()).await?)
    }

    /// Incidents whose silence exceeds the auto-resolve horizon and whose
    /// last state is not firing. Returns the resolved rows.
    pub async fn auto_resolve_stale(
        &self,
        older_than_hours: i64,
        reason: &str,
    ) -> Result<Vec<IncidentRow>> {
        let cutoff = (Utc::now() - Duration::hours(older_than_hours)).fixed_offset();
        let stale = Entity::find()
            .filter(Column::Status.is_in(vec![
                IncidentStatus::Open.to_string(),
                IncidentStatus::Acknowledged.to_string(),
                IncidentStatus::Resolving.to_string(),
            ]))
            .filter(Column::LastSeenAt.lt(cutoff))
            .filter(Column::LastState.ne(AlertState::Firing.to_string()))
            .all(self.db())
            .await?;

        let mut resolved = Vec::new();
        let now = Utc::now().fixed_offset();
        for m in stale {
            let mut am: incident::ActiveModel = m.into();
            am.status = Set(IncidentStatus::Resolved.to_string());
            am.resolved_at = Set(Some(now));
            am.resolution_reason = Set(Some(reason.to_string()));
            am.is_flapping = Set(false);
            am.updated_at = Set(now);
            let updated = am.update(self.db()).await?;
            resolved.push(to_row(updated));
        }
        Ok(resolved)
    }

    /// Incidents past the resolve quiet period: status resolving and no
    /// state change since `quiet_period_seconds`. Promoted to resolved.
    pub async fn promote_quiet_resolving(
        &self,
        quiet_period_seconds: i64,
        reason: &str,
    ) -> Result<Vec<IncidentRow>> {
        let cutoff = (Utc::now() - Duration::seconds(quiet_period_seconds)).fixed_offset();
        let due = Entity::find()
            .filter(Column::Status.eq(IncidentStatus::Resolving.to_string()))
            .filter(Column::LastStateChangeAt.lt(cutoff))
            .all(self.db())
            .await?;

        let mut resolved = Vec::new();
        let now = Utc::now().fixed_offset();
        for m in due {
            let mut am: incident::ActiveModel = m.into();
            am.status = Set(IncidentStatus::Resolved.to_string());
            am.resolved_at = Set(Some(now));
            am.resolution_reason = Set(Some(reason.to_string()));
            am.is_flapping = Set(false);
            am.updated_at = Set(now);
            let updated = am.update(self.db()).await?;
            resolved.push(to_row(updated));
        }
        Ok(resolved)
    }

    /// Live incidents not currently flagged as in maintenance — candidates
    /// for the maintenance evaluation tick.
    pub async fn list_live_incidents_outside_maintenance(&self) -> Result<Vec<IncidentRow>> {
        let rows = Entity::find()
            .filter(Column::Status.is_in(vec![
                IncidentStatus::Open.to_string(),
                IncidentStatus::Acknowledged.to_string(),
                IncidentStatus::Resolving.to_string(),
            ]))
            .filter(Column::IsInMaintenance.eq(false))
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    pub async fn set_incident_maintenance(
        &self,
        incident_id: &str,
        window_id: Option<&str>,
    ) -> Result<bool> {
        let model = Entity::find_by_id(incident_id).one(self.db()).await?;
        if let Some(m) = model {
            let mut am: incident::ActiveModel = m.into();
            am.is_in_maintenance = Set(window_id.is_some());
            am.maintenance_window_id = Set(window_id.map(|w| w.to_string()));
            am.updated_at = Set(Utc::now().fixed_offset());
            am.update(self.db()).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Clear the maintenance flag from incidents whose window is no longer
    /// active. `active_window_ids` is the currently-active set.
    pub async fn clear_expired_maintenance(&self, active_window_ids: &[String]) -> Result<u64> {
        let mut q = Entity::find().filter(Column::IsInMaintenance.eq(true));
        if !active_window_ids.is_empty() {
            q = q.filter(
                Column::MaintenanceWindowId
                    .is_not_in(active_window_ids.to_vec())
                    .or(Column::MaintenanceWindowId.is_null()),
            );
        }
        let expired = q.all(self.db()).await?;
        let count = expired.len() as u64;
        let now = Utc::now().fixed_offset();
        for m in expired {
            let mut am: incident::ActiveModel = m.into();
            am.is_in_maintenance = Set(false);
            am.maintenance_window_id = Set(None);
            am.updated_at = Set(now);
            am.update(self.db()).await?;
        }
        Ok(count)
    }

    /// Number of events linked to an incident (for invariant checks).
    pub async fn count_linked_events(&self, incident_id: &str) -> Result<u64> {
        Ok(LinkEntity::find()
            .filter(LinkCol::IncidentId.eq(incident_id))
            .count(self.db())
            .await?)
    }

    pub async fn list_incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<IncidentRow>> {
        let mut q = Entity::find();
        if let Some(s) = status {
            q = q.filter(Column::Status.eq(s.to_string()));
        }
        let rows = q
            .order_by(Column::LastSeenAt, Order::Desc)
            .limit(limit as u64)
            .offset(offset as u64)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }
}
