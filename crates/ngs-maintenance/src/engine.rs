//! Window application: deciding whether an event or incident is
//! suppressed, downgraded or digested, and keeping incident maintenance
//! flags in step with window lifetimes.

use anyhow::Result;
use chrono::{DateTime, Utc};
use ngs_common::types::{NormalizedEvent, ParseStatus, SuppressMode, WindowSource};
use ngs_storage::{IncidentRow, MailStore, MatchTarget, WindowRow};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::detect::{scope_from_value, MaintenanceDetector, WindowDetection};
use crate::scope::ScopeSubject;

/// One window that matched an event, with the selector-level reason.
#[derive(Debug, Clone)]
pub struct WindowMatch {
    pub window: WindowRow,
    pub reason: serde_json::Value,
}

struct CachedWindows {
    windows: Vec<WindowRow>,
    fetched_at: Instant,
}

pub struct MaintenanceEngine {
    store: Arc<MailStore>,
    detector: MaintenanceDetector,
    cache: RwLock<Option<CachedWindows>>,
    cache_ttl: Duration,
}

impl MaintenanceEngine {
    pub fn new(store: Arc<MailStore>, detector: MaintenanceDetector, cache_ttl_secs: u64) -> Self {
        Self {
            store,
            detector,
            cache: RwLock::new(None),
            cache_ttl: Duration::from_secs(cache_ttl_secs),
        }
    }

    pub fn detector(&self) -> &MaintenanceDetector {
        &self.detector
    }

    /// Handle an email as a maintenance notification. Returns true when
    /// the email was consumed (window created/updated/cancelled).
    pub async fn process_email(&self, email: &ngs_storage::EmailRow) -> Result<bool> {
        let body = email.best_body();
        if !self
            .detector
            .is_maintenance_email(&email.subject, body, email.ics_content.is_some())
        {
            return Ok(false);
        }

        match self.detector.detect(email) {
            Some(WindowDetection::Window(new)) => {
                let window = self.store.upsert_maintenance_window(&new).await?;
                self.invalidate_cache().await;
                self.store
                    .set_parse_status(&email.id, ParseStatus::Parsed, None)
                    .await?;
                tracing::info!(
                    email_id = %email.id,
                    window_id = %window.id,
                    mode = %window.suppress_mode,
                    "Maintenance window created from email"
                );
                Ok(true)
            }
            Some(WindowDetection::Cancelled { external_event_id }) => {
                self.store
                    .deactivate_window_by_external_id(WindowSource::Email, &external_event_id)
                    .await?;
                self.invalidate_cache().await;
                self.store
                    .set_parse_status(&email.id, ParseStatus::Parsed, None)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Active windows, cached per worker with a TTL.
    pub async fn active_windows(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.windows.clone());
                }
            }
        }

        let windows = self.store.list_active_windows(now).await?;
        let mut cache = self.cache.write().await;
        *cache = Some(CachedWindows {
            windows: windows.clone(),
            fetched_at: Instant::now(),
        });
        Ok(windows)
    }

    /// Drop the cached window list (called on window create/update).
    pub async fn invalidate_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    /// Apply active windows to a freshly parsed event, mutating its
    /// suppression fields. Returns every matching window with its reason;
    /// the caller records MaintenanceMatch rows once the event has an id.
    ///
    /// When windows with different modes cover the same event, mute wins
    /// over digest, digest over downgrade.
    pub async fn apply_to_event(&self, event: &mut NormalizedEvent) -> Result<Vec<WindowMatch>> {
        let now = Utc::now();
        // Late replays look up activity at the event's own instant
        // instead of the cached now-window.
        let skew = (now - event.occurred_at).num_seconds().abs() as u64;
        let windows = if skew > self.cache_ttl.as_secs() {
            self.store.list_active_windows(event.occurred_at).await?
        } else {
            self.active_windows(now).await?
        };

        let mut matches = Vec::new();
        {
            let subject = ScopeSubject {
                host: event.host.as_deref(),
                service: event.check_or_service(),
                environment: event.environment.as_deref(),
                region: event.region.as_deref(),
                tags: &event.tags,
            };
            for window in windows {
                if event.occurred_at < window.start_ts || event.occurred_at > window.end_ts {
                    continue;
                }
                let scope = scope_from_value(&window.scope);
                if let Some(reason) = scope.matches(&subject) {
                    matches.push(WindowMatch { window, reason });
                }
            }
        }

        if matches.is_empty() {
            return Ok(matches);
        }

        let governing = matches
            .iter()
            .find(|m| m.window.suppress_mode == SuppressMode::Mute)
            .or_else(|| {
                matches
                    .iter()
                    .find(|m| m.window.suppress_mode == SuppressMode::Digest)
            })
            .or_else(|| matches.first())
            .expect("non-empty matches");

        match governing.window.suppress_mode {
            SuppressMode::Mute => {
                event.is_suppressed = true;
                event.suppression_reason =
                    Some(format!("mute:window:{}", governing.window.id));
            }
            SuppressMode::Digest => {
                event.is_suppressed = true;
                event.suppression_reason =
                    Some(format!("digest:window:{}", governing.window.id));
                event.payload["digest"] = json!(true);
            }
            SuppressMode::Downgrade => {
                let original = event.severity;
                event.severity = original.one_step_down();
                event.payload["original_severity"] = json!(original.to_string());
                event.suppression_reason =
                    Some(format!("downgrade:window:{}", governing.window.id));
            }
        }

        tracing::debug!(
            fingerprint = %event.fingerprint,
            window_id = %governing.window.id,
            mode = %governing.window.suppress_mode,
            "Event matched maintenance window"
        );

        Ok(matches)
    }

    /// The governing (suppressing) window among a match set, if any.
    pub fn governing_window_id(matches: &[WindowMatch]) -> Option<String> {
        matches
            .iter()
            .find(|m| m.window.suppress_mode != SuppressMode::Downgrade)
            .or_else(|| matches.first())
            .map(|m| m.window.id.clone())
    }

    /// Periodic evaluation tick: match live incidents to active windows
    /// and clear flags whose windows ended.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let windows = self.store.list_active_windows(now).await?;

        if !windows.is_empty() {
            let incidents = self.store.list_live_incidents_outside_maintenance().await?;
            for incident in &incidents {
                for window in &windows {
                    if let Some(reason) = match_incident(window, incident) {
                        self.store
                            .insert_maintenance_match(
                                &window.id,
                                &MatchTarget::Incident(incident.id.clone()),
                                &reason,
                            )
                            .await?;
                        self.store
                            .set_incident_maintenance(&incident.id, Some(&window.id))
                            .await?;
                        tracing::info!(
                            incident_id = %incident.id,
                            window_id = %window.id,
                            "Incident matched to maintenance window"
                        );
                        break;
                    }
                }
            }
        }

        let active_ids: Vec<String> = windows.iter().map(|w| w.id.clone()).collect();
        let cleared = self.store.clear_expired_maintenance(&active_ids).await?;
        if cleared > 0 {
            tracing::info!(cleared, "Cleared expired maintenance flags");
        }
        Ok(())
    }
}

fn match_incident(window: &WindowRow, incident: &IncidentRow) -> Option<serde_json::Value> {
    let scope = scope_from_value(&window.scope);
    let subject = ScopeSubject {
        host: incident.host.as_deref(),
        service: incident
            .check_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(incident.service.as_deref()),
        environment: incident.environment.as_deref(),
        region: incident.region.as_deref(),
        tags: &[],
    };
    scope.matches(&subject)
}
