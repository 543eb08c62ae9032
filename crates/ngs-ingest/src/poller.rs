//! The ingest loop: cursor -> provider -> idempotency -> raw storage ->
//! parser handoff -> cursor advance. At-least-once against the provider,
//! exactly-once into `raw_emails`.

use crate::{FetchedMail, MailProvider};
use anyhow::Result;
use async_trait::async_trait;
use ngs_common::hash::sha256_hex;
use ngs_storage::{EmailRow, IdempotencyOutcome, MailStore, NewEmail};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Ingest tunables.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub batch_size: usize,
    pub idempotency_ttl_hours: i64,
    pub idempotency_stale_minutes: i64,
    /// Poll backoff after provider errors: base * 2^errors, capped.
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idempotency_ttl_hours: 24,
            idempotency_stale_minutes: 5,
            backoff_base_secs: 5,
            backoff_cap_secs: 300,
        }
    }
}

/// Where stored emails go next (the worker's parse pipeline).
#[async_trait]
pub trait EmailHandler: Send + Sync {
    /// Process one stored email. Failures are logged and retried by the
    /// reprocess sweeper; they never roll back the raw email.
    async fn handle(&self, email: &EmailRow) -> Result<()>;
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    pub fetched: usize,
    pub stored: usize,
    pub skipped: usize,
}

pub struct Ingester {
    store: Arc<MailStore>,
    provider: Arc<dyn MailProvider>,
    handler: Arc<dyn EmailHandler>,
    settings: IngestSettings,
}

/// sha256(folder:uid:message_id) — the exactly-once reservation for one
/// message.
pub fn idempotency_key(folder: &str, uid: i64, message_id: &str) -> String {
    sha256_hex(&format!("{folder}:{uid}:{message_id}"))
}

impl Ingester {
    pub fn new(
        store: Arc<MailStore>,
        provider: Arc<dyn MailProvider>,
        handler: Arc<dyn EmailHandler>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            provider,
            handler,
            settings,
        }
    }

    pub fn provider(&self) -> &Arc<dyn MailProvider> {
        &self.provider
    }

    /// One poll of one folder. Provider errors are recorded on the
    /// cursor (error_count feeds the backoff) and surface to the caller;
    /// the cursor UID is never advanced on failure.
    pub async fn poll(&self, folder: &str) -> Result<PollStats> {
        let last_uid = self
            .store
            .get_cursor(folder)
            .await?
            .map(|c| c.last_uid)
            .unwrap_or(0);

        let mails = match self
            .provider
            .list(folder, last_uid, self.settings.batch_size)
            .await
        {
            Ok(mails) => mails,
            Err(e) => {
                self.store.record_poll_error(folder, &e.to_string()).await?;
                return Err(e.into());
            }
        };

        let mut stats = PollStats {
            fetched: mails.len(),
            ..Default::default()
        };
        let mut highest_committed = last_uid;

        for mail in mails {
            let key = idempotency_key(folder, mail.uid, &mail.message_id);
            match self
                .store
                .idempotency_begin(
                    &key,
                    self.settings.idempotency_ttl_hours,
                    self.settings.idempotency_stale_minutes,
                )
                .await?
            {
                IdempotencyOutcome::Completed(_) => {
                    stats.skipped += 1;
                    highest_committed = highest_committed.max(mail.uid);
                    continue;
                }
                IdempotencyOutcome::InProgress => {
                    // Another worker owns this message; stop here so the
                    // cursor does not run past it.
                    tracing::debug!(folder, uid = mail.uid, "Message reserved elsewhere, deferring");
                    break;
                }
                IdempotencyOutcome::Fresh => {}
            }

            match self.ingest_one(folder, &mail).await {
                Ok(email_id) => {
                    self.store
                        .idempotency_complete(&key, Some(&json!({ "email_id": email_id })))
                        .await?;
                    if let Err(e) = self.provider.ack(folder, mail.uid).await {
                        tracing::warn!(folder, uid = mail.uid, error = %e, "Provider ack failed");
                    }
                    stats.stored += 1;
                    highest_committed = highest_committed.max(mail.uid);
                }
                Err(e) => {
                    self.store.idempotency_fail(&key).await?;
                    self.store.record_poll_error(folder, &e.to_string()).await?;
                    return Err(e);
                }
            }
        }

        self.store
            .advance_cursor(folder, highest_committed, stats.stored as i64)
            .await?;

        tracing::info!(
            folder,
            fetched = stats.fetched,
            stored = stats.stored,
            skipped = stats.skipped,
            last_uid = highest_committed,
            "Folder polled"
        );
        Ok(stats)
    }

    /// Store the raw email, then hand it to the parser. The raw insert is
    /// audit state: a parse failure never undoes it.
    async fn ingest_one(&self, folder: &str, mail: &FetchedMail) -> Result<String> {
        let new = NewEmail {
            folder: folder.to_string(),
            uid: mail.uid,
            message_id: mail.message_id.clone(),
            subject: mail.subject.clone(),
            from_address: mail.from_address.clone(),
            to_addresses: mail.to_addresses.clone(),
            cc_addresses: mail.cc_addresses.clone(),
            date_header: mail.date_header,
            headers: mail.headers.clone(),
            body_text: mail.body_text.clone(),
            body_html: mail.body_html.clone(),
            ics_content: mail.ics_content.clone(),
            attachments: mail.attachments.clone(),
        };

        let email = match self.store.insert_raw_email(&new).await? {
            Some(row) => row,
            None => {
                // (folder, uid) already stored by an earlier run whose
                // idempotency key has expired. Nothing more to do.
                let existing = self
                    .store
                    .get_cursor(folder)
                    .await?
                    .map(|c| c.last_uid)
                    .unwrap_or(0);
                tracing::debug!(folder, uid = mail.uid, cursor = existing, "Raw email already stored");
                return Ok(String::new());
            }
        };
        let email_id = email.id.clone();

        if let Err(e) = self.handler.handle(&email).await {
            // Stays pending; the reprocess sweeper picks it up.
            tracing::error!(email_id = %email_id, error = %e, "Email handler failed");
        }

        Ok(email_id)
    }

    /// Exponential poll backoff from the cursor's error streak.
    pub fn backoff_after_errors(&self, error_count: i64) -> Duration {
        let exp = error_count.clamp(0, 16) as u32;
        let secs = self
            .settings
            .backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.settings.backoff_cap_secs);
        Duration::from_secs(secs.max(self.settings.backoff_base_secs))
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }
}
