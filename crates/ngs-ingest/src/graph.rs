//! Microsoft Graph provider: client-credential OAuth plus the messages
//! listing endpoint. Graph exposes no integer UIDs, so the folder-local
//! UID is derived from `receivedDateTime` epoch-milliseconds — monotonic
//! within a folder and stable across reconnects.

use crate::{FetchedMail, MailProvider, ProviderError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Mailbox to read from.
    pub user_email: String,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

struct CachedToken {
    token: String,
    fetched_at: Instant,
    expires_in: Duration,
}

pub struct GraphProvider {
    config: GraphConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
    login_base: String,
    graph_base: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Deserialize)]
struct MessageList {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    internet_message_id: Option<String>,
    #[serde(default)]
    received_date_time: Option<String>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    body: Option<GraphBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    #[serde(default)]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl GraphProvider {
    pub fn new(config: GraphConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
            login_base: "https://login.microsoftonline.com".to_string(),
            graph_base: "https://graph.microsoft.com/v1.0".to_string(),
        })
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.token.lock().await;
            if let Some(t) = cached.as_ref() {
                // Refresh a minute early.
                if t.fetched_at.elapsed() + Duration::from_secs(60) < t.expires_in {
                    return Ok(t.token.clone());
                }
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base, self.config.tenant_id
        );
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("bad token response: {e}")))?;

        let mut cached = self.token.lock().await;
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            fetched_at: Instant::now(),
            expires_in: Duration::from_secs(token.expires_in),
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn name(&self) -> &str {
        "graph"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    async fn list(&self, folder: &str, since_uid: i64, limit: usize) -> Result<Vec<FetchedMail>> {
        let token = self.access_token().await?;

        let since = DateTime::<Utc>::from_timestamp_millis(since_uid.max(0))
            .unwrap_or(DateTime::UNIX_EPOCH);
        let url = format!(
            "{}/users/{}/mailFolders/{}/messages",
            self.graph_base, self.config.user_email, folder
        );
        let filter = format!(
            "receivedDateTime gt {}",
            since.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[
                ("$top", limit.to_string().as_str()),
                ("$orderby", "receivedDateTime asc"),
                ("$filter", filter.as_str()),
                (
                    "$select",
                    "subject,internetMessageId,receivedDateTime,from,toRecipients,ccRecipients,body",
                ),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Protocol(format!(
                "messages endpoint returned {status}: {body}"
            )));
        }

        let list: MessageList = resp
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("bad message list: {e}")))?;

        let mut mails = Vec::new();
        for msg in list.value {
            let received = msg
                .received_date_time
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            let Some(received) = received else {
                tracing::warn!("Graph message without receivedDateTime skipped");
                continue;
            };
            let uid = received.timestamp_millis();
            if uid <= since_uid {
                continue;
            }

            let (body_text, body_html) = match &msg.body {
                Some(b) if b.content_type.as_deref().is_some_and(|t| t.eq_ignore_ascii_case("html")) => {
                    (String::new(), b.content.clone().unwrap_or_default())
                }
                Some(b) => (b.content.clone().unwrap_or_default(), String::new()),
                None => (String::new(), String::new()),
            };

            mails.push(FetchedMail {
                uid,
                message_id: msg.internet_message_id.clone().unwrap_or_default(),
                subject: msg.subject.clone().unwrap_or_default(),
                from_address: msg.from.as_ref().map(format_recipient).unwrap_or_default(),
                to_addresses: msg.to_recipients.iter().map(format_recipient).collect(),
                cc_addresses: msg.cc_recipients.iter().map(format_recipient).collect(),
                date_header: Some(received),
                headers: json!({}),
                body_text,
                body_html,
                ics_content: None,
                attachments: json!([]),
            });
        }

        mails.sort_by_key(|m| m.uid);
        tracing::info!(count = mails.len(), folder, "Fetched Graph messages");
        Ok(mails)
    }
}

fn format_recipient(r: &GraphRecipient) -> String {
    let Some(addr) = r.email_address.as_ref() else {
        return String::new();
    };
    let email = addr.address.as_deref().unwrap_or("");
    match addr.name.as_deref() {
        Some(name) if !name.is_empty() => format!("{name} <{email}>"),
        _ => email.to_string(),
    }
}
