//! Per-email processing: maintenance detection, normalization,
//! suppression, correlation. This is the only place that decides
//! retry-vs-DLQ-vs-quarantine for a failing step.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use ngs_correlator::Correlator;
use ngs_ingest::EmailHandler;
use ngs_maintenance::MaintenanceEngine;
use ngs_parser::{EmailParser, ParseOutcome};
use ngs_storage::{DeadLetterRow, EmailRow, MailStore, MatchTarget};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DlqPolicy {
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub max_retries: i64,
}

pub struct PipelineHandler {
    store: Arc<MailStore>,
    parser: EmailParser,
    maintenance: Arc<MaintenanceEngine>,
    correlator: Arc<Correlator>,
    dlq: DlqPolicy,
}

impl PipelineHandler {
    pub fn new(
        store: Arc<MailStore>,
        parser: EmailParser,
        maintenance: Arc<MaintenanceEngine>,
        correlator: Arc<Correlator>,
        dlq: DlqPolicy,
    ) -> Self {
        Self {
            store,
            parser,
            maintenance,
            correlator,
            dlq,
        }
    }

    /// Run one email through the pipeline.
    pub async fn process(&self, email: &EmailRow) -> Result<()> {
        // Maintenance notifications are consumed whole; they produce a
        // window, not an alert event.
        if self.maintenance.process_email(email).await? {
            return Ok(());
        }

        let outcome = match self.parser.parse_email(email).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.push_dlq("parse_email", json!({ "email_id": email.id }), &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let mut event = match outcome {
            ParseOutcome::Event(event) => *event,
            ParseOutcome::Quarantined { reason } => {
                tracing::info!(email_id = %email.id, reason, "Email quarantined");
                return Ok(());
            }
        };

        let matches = self.maintenance.apply_to_event(&mut event).await?;
        let governing = MaintenanceEngine::governing_window_id(&matches);

        let result = match self
            .correlator
            .process_event(&event, governing.as_deref())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.push_dlq(
                    "correlate_event",
                    serde_json::to_value(&event).unwrap_or_default(),
                    &e.to_string(),
                )
                .await?;
                return Err(e);
            }
        };

        for m in &matches {
            self.store
                .insert_maintenance_match(
                    &m.window.id,
                    &MatchTarget::Event(result.event_id.clone()),
                    &m.reason,
                )
                .await?;
        }

        Ok(())
    }

    /// Re-dispatch one dead-letter entry to its originating handler.
    pub async fn dispatch_dead_letter(&self, entry: &DeadLetterRow) -> Result<()> {
        match entry.event_type.as_str() {
            "parse_email" => {
                let email_id = entry.payload["email_id"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("parse_email entry without email_id"))?;
                let email = self
                    .store
                    .get_raw_email(email_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("raw email {email_id} not found"))?;
                self.process(&email).await
            }
            "correlate_event" => {
                let event = serde_json::from_value(entry.payload.clone())?;
                self.correlator.process_event(&event, None).await?;
                Ok(())
            }
            other => anyhow::bail!("unknown dead-letter event type '{other}'"),
        }
    }

    async fn push_dlq(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<()> {
        let next_retry = Utc::now() + self.backoff(0);
        self.store
            .push_dead_letter(event_type, &payload, error, self.dlq.max_retries, next_retry)
            .await?;
        Ok(())
    }

    pub fn backoff(&self, retry_count: i64) -> Duration {
        dlq_backoff(&self.dlq, retry_count)
    }

    pub fn dlq_policy(&self) -> &DlqPolicy {
        &self.dlq
    }
}

/// min(cap, base * 2^retries) with ±20% jitter.
pub fn dlq_backoff(policy: &DlqPolicy, retry_count: i64) -> Duration {
    let exp = retry_count.clamp(0, 16) as u32;
    let secs = policy
        .backoff_base_secs
        .saturating_mul(1u64 << exp)
        .min(policy.backoff_cap_secs) as f64;
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    Duration::seconds((secs * (1.0 + jitter)).round().max(1.0) as i64)
}

#[async_trait]
impl EmailHandler for PipelineHandler {
    async fn handle(&self, email: &EmailRow) -> Result<()> {
        self.process(email).await
    }
}

/// Handler that feeds a bounded in-process queue instead of parsing
/// inline. Ingest tasks block on a full queue (backpressure), and a pool
/// of parser workers drains it.
pub struct QueueHandler {
    tx: tokio::sync::mpsc::Sender<EmailRow>,
}

impl QueueHandler {
    /// Returns the handler plus the worker pool's join handles.
    pub fn spawn_pool(
        pipeline: Arc<PipelineHandler>,
        workers: usize,
        capacity: usize,
    ) -> (Self, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = tokio::sync::mpsc::channel::<EmailRow>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::new();
        for worker_id in 0..workers.max(1) {
            let rx = rx.clone();
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let email = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(email) = email else {
                        break;
                    };
                    if let Err(e) = pipeline.process(&email).await {
                        tracing::error!(
                            worker_id,
                            email_id = %email.id,
                            error = %e,
                            "Parse worker failed; email stays pending"
                        );
                    }
                }
            }));
        }
        (Self { tx }, handles)
    }
}

#[async_trait]
impl EmailHandler for QueueHandler {
    async fn handle(&self, email: &EmailRow) -> Result<()> {
        self.tx
            .send(email.clone())
            .await
            .map_err(|_| anyhow::anyhow!("parser queue closed"))
    }
}
