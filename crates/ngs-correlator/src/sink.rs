use async_trait::async_trait;
use ngs_storage::IncidentRow;
use serde_json::json;

/// Incident transitions worth telling the outside world about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Opened,
    Escalated,
    Resolved,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Opened => "opened",
            NotificationKind::Escalated => "escalated",
            NotificationKind::Resolved => "resolved",
        }
    }
}

/// Narrow boundary toward whatever routes notifications. The correlator
/// never notifies for state changes caused by suppressed events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, incident: &IncidentRow, kind: NotificationKind);
}

/// Default sink: structured log lines only.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, incident: &IncidentRow, kind: NotificationKind) {
        tracing::info!(
            incident_id = %incident.id,
            fingerprint = %incident.fingerprint_v2,
            severity = %incident.severity_current,
            status = %incident.status,
            kind = kind.as_str(),
            "Incident notification"
        );
    }
}

/// Webhook sink: one POST per notification, fire-and-forget with errors
/// logged.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: String, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, incident: &IncidentRow, kind: NotificationKind) {
        let payload = json!({
            "kind": kind.as_str(),
            "incident_id": incident.id,
            "fingerprint": incident.fingerprint_v2,
            "title": incident.title,
            "severity": incident.severity_current.to_string(),
            "severity_max": incident.severity_max.to_string(),
            "status": incident.status.to_string(),
            "host": incident.host,
            "service": incident.service,
            "check_name": incident.check_name,
            "event_count": incident.event_count,
            "first_seen_at": incident.first_seen_at.to_rfc3339(),
            "last_seen_at": incident.last_seen_at.to_rfc3339(),
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::error!(
                    incident_id = %incident.id,
                    status = resp.status().as_u16(),
                    "Webhook notification rejected"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(incident_id = %incident.id, error = %e, "Webhook notification failed");
            }
        }
    }
}
