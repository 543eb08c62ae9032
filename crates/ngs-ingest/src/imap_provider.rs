//! IMAP provider. The `imap` crate is synchronous, so every poll runs
//! the whole session inside `spawn_blocking`; connections are not kept
//! across polls, which makes the provider trivially restartable.

use crate::parse::parse_rfc822;
use crate::{FetchedMail, MailProvider, ProviderError, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub poll_interval_secs: u64,
    /// On a folder with no cursor yet, how far back to search.
    pub backfill_days: i64,
}

pub struct ImapProvider {
    config: ImapConfig,
}

impl ImapProvider {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    fn fetch_blocking(
        config: &ImapConfig,
        folder: &str,
        since_uid: i64,
        limit: usize,
    ) -> Result<Vec<(i64, Vec<u8>)>> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let client = imap::connect(
            (config.host.as_str(), config.port),
            config.host.as_str(),
            &tls,
        )
        .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let mut session = client
            .login(&config.user, &config.password)
            .map_err(|(e, _)| ProviderError::Auth(e.to_string()))?;

        let result = (|| {
            session
                .select(folder)
                .map_err(|e| ProviderError::Protocol(e.to_string()))?;

            let query = if since_uid > 0 {
                format!("UID {}:*", since_uid + 1)
            } else {
                let since = (Utc::now() - ChronoDuration::days(config.backfill_days))
                    .format("%d-%b-%Y")
                    .to_string();
                format!("SINCE {since}")
            };

            let uids = session
                .uid_search(&query)
                .map_err(|e| ProviderError::Protocol(e.to_string()))?;

            let mut wanted: Vec<u32> = uids
                .into_iter()
                .filter(|uid| i64::from(*uid) > since_uid)
                .collect();
            wanted.sort_unstable();
            wanted.truncate(limit);
            if wanted.is_empty() {
                return Ok(Vec::new());
            }

            let uid_set = wanted
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let fetches = session
                .uid_fetch(&uid_set, "(RFC822 UID)")
                .map_err(|e| ProviderError::Protocol(e.to_string()))?;

            let mut messages = Vec::new();
            for fetch in fetches.iter() {
                let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) else {
                    continue;
                };
                messages.push((i64::from(uid), body.to_vec()));
            }
            messages.sort_by_key(|(uid, _)| *uid);
            Ok(messages)
        })();

        let _ = session.logout();
        result
    }
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn name(&self) -> &str {
        "imap"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    async fn list(&self, folder: &str, since_uid: i64, limit: usize) -> Result<Vec<FetchedMail>> {
        let config = self.config.clone();
        let folder = folder.to_string();

        let raw = tokio::task::spawn_blocking(move || {
            Self::fetch_blocking(&config, &folder, since_uid, limit)
        })
        .await
        .map_err(|e| ProviderError::Connection(format!("blocking task failed: {e}")))??;

        let mut mails = Vec::with_capacity(raw.len());
        for (uid, body) in raw {
            match parse_rfc822(uid, &body) {
                Ok(mail) => mails.push(mail),
                Err(e) => {
                    // One undecodable message must not stall the folder.
                    tracing::warn!(uid, error = %e, "Skipping malformed IMAP message");
                }
            }
        }
        tracing::info!(count = mails.len(), "Fetched IMAP messages");
        Ok(mails)
    }
}
