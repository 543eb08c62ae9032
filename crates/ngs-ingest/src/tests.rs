use crate::poller::{idempotency_key, EmailHandler, Ingester, IngestSettings};
use crate::{FetchedMail, FileProvider, MailProvider, ProviderError};
use async_trait::async_trait;
use chrono::Utc;
use ngs_storage::{EmailRow, MailStore};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct ScriptedProvider {
    batches: Mutex<Vec<Result<Vec<FetchedMail>, ProviderError>>>,
    acks: Mutex<Vec<i64>>,
}

impl ScriptedProvider {
    fn new(batches: Vec<Result<Vec<FetchedMail>, ProviderError>>) -> Self {
        Self {
            batches: Mutex::new(batches),
            acks: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MailProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn list(
        &self,
        _folder: &str,
        since_uid: i64,
        _limit: usize,
    ) -> Result<Vec<FetchedMail>, ProviderError> {
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        batches.remove(0).map(|mails| {
            mails
                .into_iter()
                .filter(|m| m.uid > since_uid)
                .collect()
        })
    }

    async fn ack(&self, _folder: &str, uid: i64) -> Result<(), ProviderError> {
        self.acks.lock().unwrap().push(uid);
        Ok(())
    }
}

struct CountingHandler {
    handled: AtomicUsize,
}

#[async_trait]
impl EmailHandler for CountingHandler {
    async fn handle(&self, _email: &EmailRow) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn mail(uid: i64) -> FetchedMail {
    FetchedMail {
        uid,
        message_id: format!("<{uid}@mon.example.com>"),
        subject: format!("** PROBLEM ** Host: web-{uid:02} Service: http State: CRITICAL"),
        from_address: "op5@mon.example.com".to_string(),
        to_addresses: vec!["noc@example.com".to_string()],
        cc_addresses: vec![],
        date_header: Some(Utc::now()),
        headers: json!({}),
        body_text: "Service: http\nState: CRITICAL".to_string(),
        body_html: String::new(),
        ics_content: None,
        attachments: json!([]),
    }
}

async fn setup(
    batches: Vec<Result<Vec<FetchedMail>, ProviderError>>,
) -> (TempDir, Arc<MailStore>, Arc<CountingHandler>, Ingester) {
    ngs_common::id::init(1, 1);
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MailStore::new(dir.path()).await.unwrap());
    let handler = Arc::new(CountingHandler {
        handled: AtomicUsize::new(0),
    });
    let ingester = Ingester::new(
        store.clone(),
        Arc::new(ScriptedProvider::new(batches)),
        handler.clone(),
        IngestSettings::default(),
    );
    (dir, store, handler, ingester)
}

#[tokio::test]
async fn poll_stores_and_advances_cursor_in_uid_order() {
    let (_dir, store, handler, ingester) =
        setup(vec![Ok(vec![mail(1), mail(2), mail(3)])]).await;

    let stats = ingester.poll("INBOX").await.unwrap();
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.stored, 3);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 3);

    let cursor = store.get_cursor("INBOX").await.unwrap().unwrap();
    assert_eq!(cursor.last_uid, 3);
    assert_eq!(cursor.emails_processed, 3);
    assert!(cursor.last_success_at.is_some());
    assert_eq!(store.count_raw_emails(Some("INBOX")).await.unwrap(), 3);
}

#[tokio::test]
async fn replayed_batch_is_skipped_by_idempotency() {
    // The provider replays uid 1 and 2 in the second batch.
    let (_dir, store, handler, ingester) = setup(vec![
        Ok(vec![mail(1), mail(2)]),
        Ok(vec![mail(1), mail(2), mail(3)]),
    ])
    .await;

    ingester.poll("INBOX").await.unwrap();

    // The replayed UIDs stay behind the cursor; their idempotency keys
    // are completed and absorb any replay that does get through.
    let key = idempotency_key("INBOX", 1, "<1@mon.example.com>");
    match store.idempotency_begin(&key, 24, 5).await.unwrap() {
        ngs_storage::IdempotencyOutcome::Completed(_) => {}
        other => panic!("expected completed key, got {other:?}"),
    }

    let stats = ingester.poll("INBOX").await.unwrap();
    assert_eq!(stats.stored, 1, "only uid 3 is new");
    assert_eq!(store.count_raw_emails(Some("INBOX")).await.unwrap(), 3);
    assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn provider_error_records_cursor_error_and_keeps_uid() {
    let (_dir, store, _handler, ingester) = setup(vec![
        Ok(vec![mail(1)]),
        Err(ProviderError::Connection("reset by peer".to_string())),
    ])
    .await;

    ingester.poll("INBOX").await.unwrap();
    let err = ingester.poll("INBOX").await;
    assert!(err.is_err());

    let cursor = store.get_cursor("INBOX").await.unwrap().unwrap();
    assert_eq!(cursor.last_uid, 1, "cursor must not advance on failure");
    assert_eq!(cursor.error_count, 1);
    assert!(cursor.last_error.as_deref().unwrap_or("").contains("reset by peer"));
}

#[tokio::test]
async fn backoff_grows_exponentially_and_caps() {
    let (_dir, _store, _handler, ingester) = setup(vec![]).await;

    let b0 = ingester.backoff_after_errors(0);
    let b1 = ingester.backoff_after_errors(1);
    let b2 = ingester.backoff_after_errors(2);
    assert_eq!(b1, b0 * 2);
    assert_eq!(b2, b0 * 4);

    let capped = ingester.backoff_after_errors(30);
    assert_eq!(capped, Duration::from_secs(ingester.settings().backoff_cap_secs));
}

#[tokio::test]
async fn handler_failure_leaves_raw_email_for_reprocess() {
    struct FailingHandler;
    #[async_trait]
    impl EmailHandler for FailingHandler {
        async fn handle(&self, _email: &EmailRow) -> anyhow::Result<()> {
            anyhow::bail!("parser blew up")
        }
    }

    ngs_common::id::init(1, 1);
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MailStore::new(dir.path()).await.unwrap());
    let ingester = Ingester::new(
        store.clone(),
        Arc::new(ScriptedProvider::new(vec![Ok(vec![mail(1)])])),
        Arc::new(FailingHandler),
        IngestSettings::default(),
    );

    let stats = ingester.poll("INBOX").await.unwrap();
    assert_eq!(stats.stored, 1, "raw storage succeeds despite the handler");

    // Still pending: the reprocess sweeper will find it.
    let stuck = store.list_stuck_pending(0, 10).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].parse_status, "pending");
}

#[tokio::test]
async fn file_provider_lists_acks_and_moves() {
    let dir = TempDir::new().unwrap();
    let provider = FileProvider::new(dir.path(), 5).unwrap();

    let eml = b"Message-ID: <f1@x>\r\nFrom: a@b.c\r\nSubject: drop test\r\n\r\nbody\r\n";
    std::fs::write(dir.path().join("alert.eml"), eml).unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

    let mails = provider.list("INBOX", 0, 10).await.unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].subject, "drop test");
    let uid = mails[0].uid;
    assert!(uid > 0);

    provider.ack("INBOX", uid).await.unwrap();
    assert!(!dir.path().join("alert.eml").exists());
    assert!(dir.path().join("processed").join("alert.eml").exists());

    // Already-processed UIDs are not listed again.
    let again = provider.list("INBOX", uid, 10).await.unwrap();
    assert!(again.is_empty());
}
