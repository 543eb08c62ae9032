//! The correlator: turns the normalized event stream into incident
//! state. At most one live incident exists per fingerprint; everything
//! here runs under a per-fingerprint lock inside one transaction, with
//! the storage-level partial unique index as the backstop.

pub mod locks;
pub mod sink;


use anyhow::Result;
use chrono::{Duration, Utc};
use ngs_common::hash::sha256_hex;
use ngs_common::types::{AlertState, IncidentStatus, NormalizedEvent, Severity};
use ngs_storage::store::event::{events_for_incident_on, insert_alert_event_on};
use ngs_storage::store::incident::{
    find_live_by_fingerprint_on, insert_incident_on, link_event_on,
    recent_resolved_by_fingerprint_on, update_incident_on,
};
use ngs_storage::{IncidentRow, MailStore, NewAlertEvent, NewIncident};
use sea_orm::ConnectionTrait;
use std::sync::Arc;

pub use locks::KeyedLocks;
pub use sink::{LogSink, NotificationKind, NotificationSink, WebhookSink};

/// Correlation tunables (spec'd defaults in [`Default`]).
#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    pub dedup_window_minutes: i64,
    pub flap_threshold: i64,
    pub flap_window_minutes: i64,
    pub resolve_quiet_period_seconds: i64,
    pub auto_resolve_hours: i64,
    /// How long after resolution a late resolve event still attaches to
    /// the resolved incident instead of being dropped on the floor.
    pub resolved_reattach_minutes: i64,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            dedup_window_minutes: 10,
            flap_threshold: 5,
            flap_window_minutes: 30,
            resolve_quiet_period_seconds: 120,
            auto_resolve_hours: 24,
            resolved_reattach_minutes: 60,
        }
    }
}

/// What became of one processed event.
#[derive(Debug, Clone)]
pub struct CorrelationResult {
    pub event_id: String,
    pub incident_id: Option<String>,
    pub created_incident: bool,
    pub deduplicated: bool,
}

pub struct Correlator {
    store: Arc<MailStore>,
    settings: CorrelatorSettings,
    locks: KeyedLocks,
    sink: Arc<dyn NotificationSink>,
}

impl Correlator {
    pub fn new(
        store: Arc<MailStore>,
        settings: CorrelatorSettings,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            settings,
            locks: KeyedLocks::new(),
            sink,
        }
    }

    /// Apply one event to incident state.
    ///
    /// `maintenance_window_id` is the suppressing window when the
    /// maintenance matcher flagged the event; it moves onto the incident.
    pub async fn process_event(
        &self,
        event: &NormalizedEvent,
        maintenance_window_id: Option<&str>,
    ) -> Result<CorrelationResult> {
        let _guard = self.locks.acquire(&event.fingerprint).await;

        let content_hash = event_content_hash(event);
        let txn = self.store.begin().await?;

        let live = find_live_by_fingerprint_on(&txn, &event.fingerprint).await?;

        let result = match live {
            Some(incident) => {
                // Dedup against the previous linked event before this one
                // goes in.
                let previous = events_for_incident_on(&txn, &incident.id, 1).await?;
                let deduplicated = previous.first().is_some_and(|prev| {
                    prev.content_hash == content_hash
                        && (event.occurred_at - prev.occurred_at).num_minutes().abs()
                            <= self.settings.dedup_window_minutes
                });

                let stored = insert_alert_event_on(
                    &txn,
                    &NewAlertEvent {
                        event: event.clone(),
                        content_hash,
                    },
                )
                .await?;
                link_event_on(&txn, &incident.id, &stored.id, deduplicated).await?;

                let (updated, notification) = self
                    .apply_event_to_incident(&txn, incident, event, maintenance_window_id)
                    .await?;
                update_incident_on(&txn, &updated).await?;
                txn.commit().await?;

                if let Some(kind) = notification {
                    if !event.is_suppressed {
                        self.sink.notify(&updated, kind).await;
                    }
                }

                tracing::info!(
                    event_id = %stored.id,
                    incident_id = %updated.id,
                    deduplicated,
                    "Event correlated to existing incident"
                );
                CorrelationResult {
                    event_id: stored.id,
                    incident_id: Some(updated.id),
                    created_incident: false,
                    deduplicated,
                }
            }
            None if event.state == AlertState::Resolved => {
                // A resolve with nothing live never opens an incident; it
                // may still attach to a recently resolved one.
                let stored = insert_alert_event_on(
                    &txn,
                    &NewAlertEvent {
                        event: event.clone(),
                        content_hash,
                    },
                )
                .await?;
                let recent = recent_resolved_by_fingerprint_on(
                    &txn,
                    &event.fingerprint,
                    Duration::minutes(self.settings.resolved_reattach_minutes),
                )
                .await?;
                let incident_id = match recent {
                    Some(incident) => {
                        link_event_on(&txn, &incident.id, &stored.id, false).await?;
                        Some(incident.id)
                    }
                    None => None,
                };
                txn.commit().await?;
                tracing::debug!(
                    event_id = %stored.id,
                    fingerprint = %event.fingerprint,
                    attached = incident_id.is_some(),
                    "Resolve event without live incident recorded"
                );
                CorrelationResult {
                    event_id: stored.id,
                    incident_id,
                    created_incident: false,
                    deduplicated: false,
                }
            }
            None => {
                let stored = insert_alert_event_on(
                    &txn,
                    &NewAlertEvent {
                        event: event.clone(),
                        content_hash,
                    },
                )
                .await?;
                let incident = insert_incident_on(
                    &txn,
                    &NewIncident {
                        fingerprint_v2: event.fingerprint.clone(),
                        title: incident_title(event),
                        source_tool: event.source_tool.clone(),
                        environment: event.environment.clone(),
                        region: event.region.clone(),
                        host: event.host.clone(),
                        check_name: event.check_name.clone(),
                        service: event.service.clone(),
                        severity: event.severity,
                        state: event.state,
                        first_seen_at: event.occurred_at,
                        is_in_maintenance: maintenance_window_id.is_some(),
                        maintenance_window_id: maintenance_window_id.map(|s| s.to_string()),
                    },
                )
                .await?;
                link_event_on(&txn, &incident.id, &stored.id, false).await?;
                txn.commit().await?;

                if event.severity >= Severity::High && !event.is_suppressed {
                    self.sink.notify(&incident, NotificationKind::Opened).await;
                }

                tracing::info!(
                    event_id = %stored.id,
                    incident_id = %incident.id,
                    fingerprint = %event.fingerprint,
                    "New incident created"
                );
                CorrelationResult {
                    event_id: stored.id,
                    incident_id: Some(incident.id),
                    created_incident: true,
                    deduplicated: false,
                }
            }
        };

        Ok(result)
    }

    /// The state-machine step for an event landing on a live incident.
    /// Returns the updated row and any notification to emit after commit.
    async fn apply_event_to_incident<C: ConnectionTrait>(
        &self,
        conn: &C,
        mut incident: IncidentRow,
        event: &NormalizedEvent,
        maintenance_window_id: Option<&str>,
    ) -> Result<(IncidentRow, Option<NotificationKind>)> {
        let t = event.occurred_at;
        let previous_current = incident.severity_current;
        let previous_state = incident.last_state;
        let mut notification = None;

        incident.event_count += 1;
        if t < incident.first_seen_at {
            incident.first_seen_at = t;
        }
        if t > incident.last_seen_at {
            incident.last_seen_at = t;
        }

        // Out-of-order repair: current severity and state always follow
        // the linked event with the newest occurred-at, which after the
        // insert above may or may not be this one.
        let latest = events_for_incident_on(conn, &incident.id, 1).await?;
        let (latest_severity, latest_state, latest_t) = match latest.first() {
            Some(row) => (
                row.severity.parse().unwrap_or(event.severity),
                row.state.parse().unwrap_or(event.state),
                row.occurred_at,
            ),
            None => (event.severity, event.state, t),
        };

        incident.severity_current = latest_severity;
        if event.severity > incident.severity_max {
            incident.severity_max = event.severity;
        }

        // Escalation into high/critical is notified.
        if incident.severity_current > previous_current
            && incident.severity_current >= Severity::High
        {
            incident.last_state_change_at = Some(latest_t);
            notification = Some(NotificationKind::Escalated);
            tracing::info!(
                incident_id = %incident.id,
                severity = %incident.severity_current,
                "Incident severity escalated"
            );
        }

        // Flap accounting on observed state changes.
        if latest_state != previous_state {
            incident.flap_count += 1;
            incident.last_state_change_at = Some(latest_t);

            let window = Duration::minutes(self.settings.flap_window_minutes);
            let in_window = incident
                .flap_window_started_at
                .is_some_and(|started| latest_t - started <= window);
            if in_window {
                incident.flap_window_count += 1;
            } else {
                incident.flap_window_started_at = Some(latest_t);
                incident.flap_window_count = 1;
            }
            if incident.flap_window_count >= self.settings.flap_threshold {
                if !incident.is_flapping {
                    tracing::warn!(
                        incident_id = %incident.id,
                        flaps = incident.flap_window_count,
                        "Incident is flapping"
                    );
                }
                incident.is_flapping = true;
            }
        }
        incident.last_state = latest_state;

        // Resolve handling.
        match latest_state {
            AlertState::Resolved => {
                if matches!(
                    incident.status,
                    IncidentStatus::Open | IncidentStatus::Acknowledged
                ) {
                    incident.status = IncidentStatus::Resolving;
                }
                if incident.status == IncidentStatus::Resolving {
                    let last_firing = events_for_incident_on(conn, &incident.id, 50)
                        .await?
                        .into_iter()
                        .find(|e| e.state == AlertState::Firing.to_string())
                        .map(|e| e.occurred_at);
                    let quiet = Duration::seconds(self.settings.resolve_quiet_period_seconds);
                    let quiet_elapsed = match last_firing {
                        Some(fired) => Utc::now() - fired >= quiet,
                        None => true,
                    };
                    if quiet_elapsed {
                        incident.status = IncidentStatus::Resolved;
                        incident.resolved_at = Some(Utc::now());
                        incident.resolution_reason = Some("explicit_clear".to_string());
                        incident.is_flapping = false;
                        notification = notification.or(Some(NotificationKind::Resolved));
                    }
                }
            }
            AlertState::Firing => {
                // A firing event within the quiet period reverts the
                // resolve-in-progress.
                if incident.status == IncidentStatus::Resolving {
                    incident.status = IncidentStatus::Open;
                    incident.resolved_at = None;
                    incident.resolution_reason = None;
                }
            }
            AlertState::Unknown => {}
        }

        if let Some(window_id) = maintenance_window_id {
            incident.is_in_maintenance = true;
            incident.maintenance_window_id = Some(window_id.to_string());
        }

        Ok((incident, notification))
    }

    /// Auto-resolve sweep: incidents silent past the horizon whose last
    /// state is not firing.
    pub async fn auto_resolve_stale(&self) -> Result<usize> {
        let resolved = self
            .store
            .auto_resolve_stale(self.settings.auto_resolve_hours, "silence_timeout")
            .await?;
        if !resolved.is_empty() {
            tracing::info!(count = resolved.len(), "Auto-resolved stale incidents");
        }
        for incident in &resolved {
            self.sink.notify(incident, NotificationKind::Resolved).await;
        }
        Ok(resolved.len())
    }

    /// Promote resolving incidents whose quiet period has elapsed without
    /// a fresh firing event.
    pub async fn promote_quiet_resolving(&self) -> Result<usize> {
        let resolved = self
            .store
            .promote_quiet_resolving(
                self.settings.resolve_quiet_period_seconds,
                "explicit_clear",
            )
            .await?;
        for incident in &resolved {
            self.sink.notify(incident, NotificationKind::Resolved).await;
        }
        Ok(resolved.len())
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }
}

/// Content identity used for repeat-occurrence detection: state,
/// severity and the scrubbed signature.
fn event_content_hash(event: &NormalizedEvent) -> String {
    sha256_hex(&format!(
        "{}|{}|{}",
        event.state, event.severity, event.normalized_signature
    ))
}

fn incident_title(event: &NormalizedEvent) -> String {
    let mut parts = vec![format!("[{}]", event.severity.to_string().to_uppercase())];
    if let Some(host) = &event.host {
        parts.push(host.clone());
    }
    if let Some(check) = event.check_or_service() {
        parts.push(check.to_string());
    }
    if parts.len() == 1 {
        parts.push("Alert".to_string());
    }
    parts.push(format!("({})", event.source_tool));
    let title = parts.join(" ");
    title.chars().take(500).collect()
}
