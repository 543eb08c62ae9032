use anyhow::Result;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, Order,
    QueryFilter, QueryOrder, QuerySelect,
};
use serde::{Deserialize, Serialize};

use crate::entities::alert_event::{self, Column, Entity};
use crate::entities::incident_event::{Column as LinkCol, Entity as LinkEntity};
use crate::MailStore;
use ngs_common::types::NormalizedEvent;

/// 告警事件数据行（来自 alert_events 表）。创建后不再修改。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub raw_email_id: Option<String>,
    pub source_tool: String,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub check_name: Option<String>,
    pub service: Option<String>,
    pub severity: String,
    pub state: String,
    pub occurred_at: DateTime<Utc>,
    pub normalized_signature: String,
    pub fingerprint_v2: String,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub is_suppressed: bool,
    pub suppression_reason: Option<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// 新事件插入请求。
#[derive(Debug, Clone)]
pub struct NewAlertEvent {
    pub event: NormalizedEvent,
    pub content_hash: String,
}

pub(crate) fn to_row(m: alert_event::Model) -> EventRow {
    EventRow {
        id: m.id,
        raw_email_id: m.raw_email_id,
        source_tool: m.source_tool,
        environment: m.environment,
        region: m.region,
        host: m.host,
        check_name: m.check_name,
        service: m.service,
        severity: m.severity,
        state: m.state,
        occurred_at: m.occurred_at.with_timezone(&Utc),
        normalized_signature: m.normalized_signature,
        fingerprint_v2: m.fingerprint_v2,
        payload: serde_json::from_str(&m.payload).unwrap_or_default(),
        tags: serde_json::from_str(&m.tags).unwrap_or_default(),
        is_suppressed: m.is_suppressed,
        suppression_reason: m.suppression_reason,
        content_hash: m.content_hash,
        created_at: m.created_at.with_timezone(&Utc),
    }
}

/// Insert an alert event on any connection (used inside the correlator
/// transaction).
pub async fn insert_alert_event_on<C: ConnectionTrait>(
    conn: &C,
    new: &NewAlertEvent,
) -> Result<EventRow> {
    let ev = &new.event;
    let now = Utc::now().fixed_offset();
    let am = alert_event::ActiveModel {
        id: Set(ngs_common::id::next_id()),
        raw_email_id: Set(ev.raw_email_id.clone()),
        source_tool: Set(ev.source_tool.clone()),
        environment: Set(ev.environment.clone()),
        region: Set(ev.region.clone()),
        host: Set(ev.host.clone()),
        check_name: Set(ev.check_name.clone()),
        service: Set(ev.service.clone()),
        severity: Set(ev.severity.to_string()),
        state: Set(ev.state.to_string()),
        occurred_at: Set(ev.occurred_at.fixed_offset()),
        normalized_signature: Set(ev.normalized_signature.clone()),
        fingerprint_v2: Set(ev.fingerprint.clone()),
        payload: Set(ev.payload.to_string()),
        tags: Set(serde_json::to_string(&ev.tags)?),
        is_suppressed: Set(ev.is_suppressed),
        suppression_reason: Set(ev.suppression_reason.clone()),
        content_hash: Set(new.content_hash.clone()),
        created_at: Set(now),
    };
    let model = am.insert(conn).await?;
    Ok(to_row(model))
}

/// Events linked to an incident, newest occurred-at first.
pub async fn events_for_incident_on<C: ConnectionTrait>(
    conn: &C,
    incident_id: &str,
    limit: u64,
) -> Result<Vec<EventRow>> {
    let links = LinkEntity::find()
        .filter(LinkCol::IncidentId.eq(incident_id))
        .all(conn)
        .await?;
    let ids: Vec<String> = links.into_iter().map(|l| l.alert_event_id).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = Entity::find()
        .filter(Column::Id.is_in(ids))
        .order_by(Column::OccurredAt, Order::Desc)
        .limit(limit)
        .all(conn)
        .await?;
    Ok(rows.into_iter().map(to_row).collect())
}

impl MailStore {
    pub async fn insert_alert_event(&self, new: &NewAlertEvent) -> Result<EventRow> {
        insert_alert_event_on(self.db(), new).await
    }

    pub async fn get_alert_event(&self, id: &str) -> Result<Option<EventRow>> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        Ok(model.map(to_row))
    }

    pub async fn events_for_incident(&self, incident_id: &str, limit: u64) -> Result<Vec<EventRow>> {
        events_for_incident_on(self.db(), incident_id, limit).await
    }

    /// Events flagged for digest output inside the given interval.
    pub async fn list_digest_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRow>> {
        let rows = Entity::find()
            .filter(Column::IsSuppressed.eq(true))
            .filter(Column::SuppressionReason.contains("digest"))
            .filter(Column::OccurredAt.gte(from.fixed_offset()))
            .filter(Column::OccurredAt.lte(to.fixed_offset()))
            .order_by(Column::OccurredAt, Order::Asc)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }
}
