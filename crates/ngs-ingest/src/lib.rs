//! Mail ingestion: providers behind a capability trait, resumable folder
//! cursors, and an idempotent poll loop that stores each message exactly
//! once before handing it to the parser.

pub mod error;
pub mod file;
pub mod graph;
pub mod imap_provider;
pub mod parse;
pub mod poller;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub use error::{ProviderError, Result};
pub use file::FileProvider;
pub use graph::GraphProvider;
pub use imap_provider::ImapProvider;
pub use poller::{EmailHandler, Ingester, IngestSettings, PollStats};

/// One message as fetched from a provider, before storage.
#[derive(Debug, Clone)]
pub struct FetchedMail {
    /// Folder-local UID: monotonically increasing and stable across
    /// reconnects.
    pub uid: i64,
    pub message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub date_header: Option<DateTime<Utc>>,
    pub headers: serde_json::Value,
    pub body_text: String,
    pub body_html: String,
    pub ics_content: Option<String>,
    pub attachments: serde_json::Value,
}

/// Capability boundary toward a mail source.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Suggested delay between polls.
    fn poll_interval(&self) -> Duration;

    /// Messages with UID > `since_uid`, in ascending UID order, at most
    /// `limit` of them.
    async fn list(&self, folder: &str, since_uid: i64, limit: usize) -> Result<Vec<FetchedMail>>;

    /// Acknowledge a stored message. Providers with no cleanup to do
    /// (IMAP, Graph) keep the default no-op; the drop-folder provider
    /// moves the file away. Deleting mail at the source before parse
    /// success is forbidden, so this only ever runs after storage.
    async fn ack(&self, _folder: &str, _uid: i64) -> Result<()> {
        Ok(())
    }
}
