use crate::store::incident::{find_live_by_fingerprint_on, insert_incident_on, NewIncident};
use crate::store::quarantine::QuarantineAction;
use crate::{IdempotencyOutcome, MailStore, MatchTarget, NewEmail, NewWindow};
use chrono::{Duration, Utc};
use ngs_common::types::{AlertState, ParseStatus, Severity, SuppressMode, WindowSource};
use serde_json::json;
use tempfile::TempDir;

async fn setup() -> (TempDir, MailStore) {
    ngs_common::id::init(1, 1);
    let dir = TempDir::new().unwrap();
    let store = MailStore::new(dir.path()).await.unwrap();
    (dir, store)
}

fn make_email(folder: &str, uid: i64) -> NewEmail {
    NewEmail {
        folder: folder.to_string(),
        uid,
        message_id: format!("<{uid}@mon.example.com>"),
        subject: "** PROBLEM ** Host: web-01 Service: http State: CRITICAL".to_string(),
        from_address: "op5@mon.example.com".to_string(),
        to_addresses: vec!["noc@example.com".to_string()],
        cc_addresses: vec![],
        date_header: Some(Utc::now()),
        headers: json!({"X-Mailer": "op5"}),
        body_text: "Service: http\nState: CRITICAL\nAdditional Info: timeout".to_string(),
        body_html: String::new(),
        ics_content: None,
        attachments: json!([]),
    }
}

fn make_incident(fingerprint: &str) -> NewIncident {
    NewIncident {
        fingerprint_v2: fingerprint.to_string(),
        title: "[CRITICAL] web-01 http".to_string(),
        source_tool: "op5".to_string(),
        environment: Some("prod".to_string()),
        region: None,
        host: Some("web-01".to_string()),
        check_name: Some("http".to_string()),
        service: None,
        severity: Severity::Critical,
        state: AlertState::Firing,
        first_seen_at: Utc::now(),
        is_in_maintenance: false,
        maintenance_window_id: None,
    }
}

#[tokio::test]
async fn raw_email_insert_is_exactly_once_per_folder_uid() {
    let (_dir, store) = setup().await;

    let first = store.insert_raw_email(&make_email("INBOX", 42)).await.unwrap();
    assert!(first.is_some());

    let second = store.insert_raw_email(&make_email("INBOX", 42)).await.unwrap();
    assert!(second.is_none(), "duplicate (folder, uid) must be skipped");

    // Same UID in a different folder is a different message.
    let other_folder = store.insert_raw_email(&make_email("ALERTS", 42)).await.unwrap();
    assert!(other_folder.is_some());

    assert_eq!(store.count_raw_emails(Some("INBOX")).await.unwrap(), 1);
}

#[tokio::test]
async fn parse_status_advances_and_requeue_is_explicit() {
    let (_dir, store) = setup().await;
    let row = store
        .insert_raw_email(&make_email("INBOX", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.parse_status, "pending");

    store
        .set_parse_status(&row.id, ParseStatus::Quarantined, None)
        .await
        .unwrap();
    let row = store.get_raw_email(&row.id).await.unwrap().unwrap();
    assert_eq!(row.parse_status, "quarantined");

    store.requeue_raw_email(&row.id).await.unwrap();
    let row = store.get_raw_email(&row.id).await.unwrap().unwrap();
    assert_eq!(row.parse_status, "pending");
    assert!(row.parse_error.is_none());
}

#[tokio::test]
async fn idempotency_begin_complete_and_replay() {
    let (_dir, store) = setup().await;

    let outcome = store.idempotency_begin("key-1", 24, 5).await.unwrap();
    assert_eq!(outcome, IdempotencyOutcome::Fresh);

    // A second begin while processing reports in-progress.
    let outcome = store.idempotency_begin("key-1", 24, 5).await.unwrap();
    assert_eq!(outcome, IdempotencyOutcome::InProgress);

    store
        .idempotency_complete("key-1", Some(&json!({"email_id": "abc"})))
        .await
        .unwrap();

    match store.idempotency_begin("key-1", 24, 5).await.unwrap() {
        IdempotencyOutcome::Completed(Some(v)) => assert_eq!(v["email_id"], "abc"),
        other => panic!("expected completed, got {other:?}"),
    }
}

#[tokio::test]
async fn idempotency_failed_reservation_is_reclaimed() {
    let (_dir, store) = setup().await;

    assert_eq!(
        store.idempotency_begin("key-2", 24, 5).await.unwrap(),
        IdempotencyOutcome::Fresh
    );
    store.idempotency_fail("key-2").await.unwrap();

    // The failed reservation is backdated past the stale threshold.
    assert_eq!(
        store.idempotency_begin("key-2", 24, 5).await.unwrap(),
        IdempotencyOutcome::Fresh
    );
}

#[tokio::test]
async fn partial_index_rejects_second_live_incident() {
    let (_dir, store) = setup().await;
    let fp = "feedfacefeedfacefeedfacefeedface";

    insert_incident_on(store.db(), &make_incident(fp)).await.unwrap();

    let dup = insert_incident_on(store.db(), &make_incident(fp)).await;
    assert!(dup.is_err(), "partial unique index must reject a second live incident");

    let live = find_live_by_fingerprint_on(store.db(), fp).await.unwrap();
    assert!(live.is_some());
}

#[tokio::test]
async fn resolved_incident_frees_the_fingerprint() {
    let (_dir, store) = setup().await;
    let fp = "cafebabecafebabecafebabecafebabe";

    let mut row = insert_incident_on(store.db(), &make_incident(fp)).await.unwrap();
    row.status = ngs_common::types::IncidentStatus::Resolved;
    row.resolved_at = Some(Utc::now());
    row.resolution_reason = Some("explicit_clear".to_string());
    crate::store::incident::update_incident_on(store.db(), &row)
        .await
        .unwrap();

    // Fingerprint is free again for a new open incident.
    insert_incident_on(store.db(), &make_incident(fp)).await.unwrap();
}

#[tokio::test]
async fn cursor_advance_never_regresses() {
    let (_dir, store) = setup().await;

    store.advance_cursor("INBOX", 10, 3).await.unwrap();
    let row = store.advance_cursor("INBOX", 7, 1).await.unwrap();
    assert_eq!(row.last_uid, 10, "cursor must keep the highest UID");
    assert_eq!(row.emails_processed, 4);

    let row = store.record_poll_error("INBOX", "connection reset").await.unwrap();
    assert_eq!(row.last_uid, 10);
    assert_eq!(row.error_count, 1);

    // Success clears the error streak.
    let row = store.advance_cursor("INBOX", 11, 1).await.unwrap();
    assert_eq!(row.error_count, 0);
    assert!(row.last_error.is_none());
}

#[tokio::test]
async fn pattern_success_rate_moves_by_ewma() {
    let (_dir, store) = setup().await;

    let pattern = store
        .insert_learned_pattern(&crate::NewPattern {
            signature_hash: "ab".repeat(32),
            from_domain: Some("mon.example.com".to_string()),
            subject_prefix: Some("splunk alert: *N*".to_string()),
            body_markers: vec!["severity".to_string(), "host:".to_string()],
            source_name: "Splunk Alert".to_string(),
            source_tool: "splunk".to_string(),
            extraction_rules: json!({"host": {"source": "body", "regex": "host=(\\S+)"}}),
            analysis_duration_ms: Some(1200),
            created_from_email_id: None,
        })
        .await
        .unwrap();
    assert_eq!(pattern.match_count, 1);
    assert!((pattern.success_rate - 100.0).abs() < f64::EPSILON);

    store.record_pattern_match(&pattern.id, false).await.unwrap();
    let row = store.find_pattern_by_signature(&pattern.signature_hash).await.unwrap().unwrap();
    assert!((row.success_rate - 95.0).abs() < 0.001);
    assert_eq!(row.match_count, 2);

    store.record_pattern_match(&pattern.id, true).await.unwrap();
    let row = store.find_pattern_by_signature(&pattern.signature_hash).await.unwrap().unwrap();
    assert!(row.success_rate > 95.0 && row.success_rate < 100.0);
}

#[tokio::test]
async fn learned_pattern_is_cached_once_per_signature() {
    let (_dir, store) = setup().await;
    let new = crate::NewPattern {
        signature_hash: "cd".repeat(32),
        from_domain: None,
        subject_prefix: None,
        body_markers: vec![],
        source_name: "Xymon".to_string(),
        source_tool: "xymon".to_string(),
        extraction_rules: json!({}),
        analysis_duration_ms: None,
        created_from_email_id: None,
    };
    let first = store.insert_learned_pattern(&new).await.unwrap();
    let second = store.insert_learned_pattern(&new).await.unwrap();
    assert_eq!(first.id, second.id);

    let row = store.find_pattern_by_signature(&new.signature_hash).await.unwrap().unwrap();
    assert_eq!(row.match_count, 2);
}

#[tokio::test]
async fn dlq_claim_is_single_shot_per_entry() {
    let (_dir, store) = setup().await;

    store
        .push_dead_letter(
            "parse_email",
            &json!({"email_id": "e1"}),
            "db timeout",
            3,
            Utc::now() - Duration::seconds(1),
        )
        .await
        .unwrap();

    let claimed = store.claim_due_dead_letters(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].retry_count, 1);

    // Already retrying: nothing left to claim.
    let again = store.claim_due_dead_letters(10).await.unwrap();
    assert!(again.is_empty());

    // Failure with retries left goes back to pending with a future slot.
    store
        .fail_dead_letter(&claimed[0].id, "still failing", Some(Utc::now() + Duration::minutes(1)))
        .await
        .unwrap();
    let stats = store.dlq_stats().await.unwrap();
    assert_eq!(stats.pending, 1);

    // Not due yet.
    assert!(store.claim_due_dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn dlq_exhausted_entry_fails_permanently() {
    let (_dir, store) = setup().await;

    store
        .push_dead_letter(
            "correlate_event",
            &json!({}),
            "boom",
            1,
            Utc::now() - Duration::seconds(1),
        )
        .await
        .unwrap();

    let claimed = store.claim_due_dead_letters(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    store.fail_dead_letter(&claimed[0].id, "boom again", None).await.unwrap();

    let stats = store.dlq_stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert!(store.claim_due_dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn quarantine_review_requeues_or_fails_the_email() {
    let (_dir, store) = setup().await;
    let email = store
        .insert_raw_email(&make_email("INBOX", 5))
        .await
        .unwrap()
        .unwrap();
    store
        .set_parse_status(&email.id, ParseStatus::Quarantined, None)
        .await
        .unwrap();

    let q = store
        .insert_quarantine(&email.id, &json!({"host": null}), 0.3, "low_confidence")
        .await
        .unwrap();
    assert_eq!(store.count_pending_quarantine().await.unwrap(), 1);

    let ok = store
        .review_quarantine(&q.id, QuarantineAction::Approved, "oncall", None)
        .await
        .unwrap();
    assert!(ok);
    let email = store.get_raw_email(&email.id).await.unwrap().unwrap();
    assert_eq!(email.parse_status, "pending");

    // Double review is rejected.
    let again = store
        .review_quarantine(&q.id, QuarantineAction::Rejected, "oncall", None)
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn maintenance_window_upserts_by_external_event_id() {
    let (_dir, store) = setup().await;
    let now = Utc::now();

    let mut new = NewWindow {
        source: WindowSource::Email,
        raw_email_id: None,
        external_event_id: Some("uid-123@cal.example.com".to_string()),
        title: "DB failover drill".to_string(),
        description: None,
        organizer: Some("DBA team".to_string()),
        organizer_email: Some("dba@example.com".to_string()),
        start_ts: now - Duration::hours(1),
        end_ts: now + Duration::hours(1),
        timezone: "UTC".to_string(),
        scope: json!({"hosts": ["db-01"]}),
        suppress_mode: SuppressMode::Mute,
        is_recurring: false,
        recurrence_rule: None,
    };

    let first = store.upsert_maintenance_window(&new).await.unwrap();
    new.end_ts = now + Duration::hours(3);
    let second = store.upsert_maintenance_window(&new).await.unwrap();
    assert_eq!(first.id, second.id, "same calendar UID must update in place");
    assert_eq!(second.end_ts, new.end_ts);

    let active = store.list_active_windows(now).await.unwrap();
    assert_eq!(active.len(), 1);

    store
        .deactivate_window_by_external_id(WindowSource::Email, "uid-123@cal.example.com")
        .await
        .unwrap();
    assert!(store.list_active_windows(now).await.unwrap().is_empty());
}

#[tokio::test]
async fn maintenance_window_rejects_inverted_interval() {
    let (_dir, store) = setup().await;
    let now = Utc::now();
    let res = store
        .upsert_maintenance_window(&NewWindow {
            source: WindowSource::Manual,
            raw_email_id: None,
            external_event_id: None,
            title: "bad".to_string(),
            description: None,
            organizer: None,
            organizer_email: None,
            start_ts: now,
            end_ts: now - Duration::hours(1),
            timezone: "UTC".to_string(),
            scope: json!({}),
            suppress_mode: SuppressMode::Mute,
            is_recurring: false,
            recurrence_rule: None,
        })
        .await;
    assert!(res.is_err());
}

#[tokio::test]
async fn maintenance_match_is_idempotent() {
    let (_dir, store) = setup().await;
    let now = Utc::now();
    let window = store
        .upsert_maintenance_window(&NewWindow {
            source: WindowSource::Manual,
            raw_email_id: None,
            external_event_id: None,
            title: "net".to_string(),
            description: None,
            organizer: None,
            organizer_email: None,
            start_ts: now - Duration::hours(1),
            end_ts: now + Duration::hours(1),
            timezone: "UTC".to_string(),
            scope: json!({"hosts": ["web-01"]}),
            suppress_mode: SuppressMode::Mute,
            is_recurring: false,
            recurrence_rule: None,
        })
        .await
        .unwrap();

    let target = MatchTarget::Event("evt-1".to_string());
    let reason = json!({"reasons": [{"field": "host", "value": "web-01"}]});
    store.insert_maintenance_match(&window.id, &target, &reason).await.unwrap();
    store.insert_maintenance_match(&window.id, &target, &reason).await.unwrap();

    assert_eq!(store.list_matches_for_window(&window.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn config_versions_dedup_and_rollback() {
    let (_dir, store) = setup().await;
    let v1 = json!({"parsers": ["op5"]});
    let v2 = json!({"parsers": ["op5", "zabbix"]});

    let first = store
        .save_config_version("parsers", &v1, "boot", None, true)
        .await
        .unwrap();
    let second = store
        .save_config_version("parsers", &v2, "reload", Some("add zabbix"), true)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    let active = store.active_config_version("parsers").await.unwrap().unwrap();
    assert_eq!(active.id, second.id);

    // Saving identical content reuses the version.
    let dup = store
        .save_config_version("parsers", &v2, "reload", None, true)
        .await
        .unwrap();
    assert_eq!(dup.id, second.id);

    // Rollback selects the prior version.
    store.activate_config_version("parsers", &first.id).await.unwrap();
    let active = store.active_config_version("parsers").await.unwrap().unwrap();
    assert_eq!(active.id, first.id);
}

#[tokio::test]
async fn auto_resolve_skips_firing_incidents() {
    let (_dir, store) = setup().await;

    let mut stale = make_incident("11".repeat(16).as_str());
    stale.first_seen_at = Utc::now() - Duration::hours(48);
    stale.state = AlertState::Resolved;
    let mut row = insert_incident_on(store.db(), &stale).await.unwrap();
    row.last_seen_at = Utc::now() - Duration::hours(30);
    row.last_state = AlertState::Resolved;
    crate::store::incident::update_incident_on(store.db(), &row).await.unwrap();

    let mut firing = make_incident("22".repeat(16).as_str());
    firing.first_seen_at = Utc::now() - Duration::hours(48);
    let mut row2 = insert_incident_on(store.db(), &firing).await.unwrap();
    row2.last_seen_at = Utc::now() - Duration::hours(30);
    crate::store::incident::update_incident_on(store.db(), &row2).await.unwrap();

    let resolved = store.auto_resolve_stale(24, "silence_timeout").await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].fingerprint_v2, "11".repeat(16));
    assert_eq!(resolved[0].resolution_reason.as_deref(), Some("silence_timeout"));

    // The firing one stays live.
    let live = store.find_live_incident(&"22".repeat(16)).await.unwrap();
    assert!(live.is_some());
}
