//! End-to-end pipeline flows: stored email in, incident state out.

use chrono::{DateTime, Duration, Utc};
use ngs_common::types::{AlertState, IncidentStatus, Severity};
use ngs_correlator::{Correlator, CorrelatorSettings, LogSink};
use ngs_llm::{
    ExtractedFields, ExtractionRule, LlmExtraction, RuleSource, ScriptedExtractor,
};
use ngs_maintenance::{MaintenanceDetector, MaintenanceEngine};
use ngs_parser::{compile_parsers, default_parsers, EmailParser, ParserSettings};
use ngs_storage::{EmailRow, MailStore, NewEmail};
use ngs_worker::pipeline::{DlqPolicy, PipelineHandler};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<MailStore>,
    pipeline: PipelineHandler,
    llm: Arc<ScriptedExtractor>,
}

async fn harness(llm_responses: Vec<ngs_llm::Result<LlmExtraction>>) -> Harness {
    ngs_common::id::init(1, 1);
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MailStore::new(dir.path()).await.unwrap());
    let llm = Arc::new(ScriptedExtractor::new(llm_responses));

    let parser = EmailParser::new(
        compile_parsers(default_parsers()).unwrap(),
        store.clone(),
        llm.clone(),
        ParserSettings::default(),
    );
    let maintenance = Arc::new(MaintenanceEngine::new(
        store.clone(),
        MaintenanceDetector::new(vec![]),
        30,
    ));
    let correlator = Arc::new(Correlator::new(
        store.clone(),
        CorrelatorSettings::default(),
        Arc::new(LogSink),
    ));
    let pipeline = PipelineHandler::new(
        store.clone(),
        parser,
        maintenance,
        correlator,
        DlqPolicy {
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
            max_retries: 3,
        },
    );

    Harness {
        _dir: dir,
        store,
        pipeline,
        llm,
    }
}

async fn ingest_email(
    store: &MailStore,
    uid: i64,
    subject: &str,
    body: &str,
    occurred_at: DateTime<Utc>,
) -> EmailRow {
    store
        .insert_raw_email(&NewEmail {
            folder: "INBOX".to_string(),
            uid,
            message_id: format!("<{uid}@mon.example.com>"),
            subject: subject.to_string(),
            from_address: "op5@mon.example.com".to_string(),
            to_addresses: vec!["noc@example.com".to_string()],
            cc_addresses: vec![],
            date_header: Some(occurred_at),
            headers: json!({}),
            body_text: body.to_string(),
            body_html: String::new(),
            ics_content: None,
            attachments: json!([]),
        })
        .await
        .unwrap()
        .unwrap()
}

const PROBLEM_SUBJECT: &str = "** PROBLEM ** Host: web-01 Service: http State: CRITICAL";
const PROBLEM_BODY: &str = "Service: http\nState: CRITICAL\nAdditional Info: timeout";
const RECOVERY_SUBJECT: &str = "** RECOVERY ** Host: web-01 Service: http State: OK";
const RECOVERY_BODY: &str = "Service: http\nState: OK";

#[tokio::test]
async fn scenario_new_alert_opens_incident() {
    let h = harness(vec![]).await;
    let email = ingest_email(&h.store, 1, PROBLEM_SUBJECT, PROBLEM_BODY, Utc::now()).await;

    h.pipeline.process(&email).await.unwrap();

    let incidents = h.store.list_incidents(None, 10, 0).await.unwrap();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.host.as_deref(), Some("web-01"));
    assert_eq!(incident.service.as_deref(), Some("http"));
    assert_eq!(incident.severity_current, Severity::Critical);
    assert_eq!(incident.last_state, AlertState::Firing);
    assert_eq!(incident.event_count, 1);
}

#[tokio::test]
async fn scenario_duplicate_is_linked_not_duplicated() {
    let h = harness(vec![]).await;
    let now = Utc::now();

    let first = ingest_email(&h.store, 1, PROBLEM_SUBJECT, PROBLEM_BODY, now).await;
    h.pipeline.process(&first).await.unwrap();
    let second = ingest_email(
        &h.store,
        2,
        PROBLEM_SUBJECT,
        PROBLEM_BODY,
        now + Duration::minutes(1),
    )
    .await;
    h.pipeline.process(&second).await.unwrap();

    let incidents = h.store.list_incidents(None, 10, 0).await.unwrap();
    assert_eq!(incidents.len(), 1, "no second incident");
    assert_eq!(incidents[0].event_count, 2);
    assert_eq!(
        h.store.count_linked_events(&incidents[0].id).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn scenario_escalation_tracks_severity() {
    let h = harness(vec![]).await;
    let now = Utc::now();

    let warn = ingest_email(
        &h.store,
        1,
        "** PROBLEM ** Host: web-01 Service: http State: WARNING",
        "Service: http\nState: WARNING",
        now,
    )
    .await;
    h.pipeline.process(&warn).await.unwrap();

    let crit = ingest_email(
        &h.store,
        2,
        PROBLEM_SUBJECT,
        PROBLEM_BODY,
        now + Duration::minutes(2),
    )
    .await;
    h.pipeline.process(&crit).await.unwrap();

    let incidents = h.store.list_incidents(None, 10, 0).await.unwrap();
    assert_eq!(incidents.len(), 1, "severity change must not split the incident");
    let incident = &incidents[0];
    assert_eq!(incident.severity_max, Severity::Critical);
    assert_eq!(incident.severity_current, Severity::Critical);
}

#[tokio::test]
async fn scenario_recovery_resolves_after_quiet_period() {
    let h = harness(vec![]).await;
    let now = Utc::now();

    let problem = ingest_email(
        &h.store,
        1,
        PROBLEM_SUBJECT,
        PROBLEM_BODY,
        now - Duration::minutes(10),
    )
    .await;
    h.pipeline.process(&problem).await.unwrap();

    let recovery = ingest_email(&h.store, 2, RECOVERY_SUBJECT, RECOVERY_BODY, now).await;
    h.pipeline.process(&recovery).await.unwrap();

    let incidents = h.store.list_incidents(None, 10, 0).await.unwrap();
    assert_eq!(incidents.len(), 1, "recovery must hit the same fingerprint");
    let incident = &incidents[0];
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert!(incident.resolved_at.is_some());
    assert_eq!(incident.event_count, 2);
}

#[tokio::test]
async fn scenario_maintenance_window_mutes_matching_alert() {
    let h = harness(vec![]).await;
    let now = Utc::now();

    let mw_body = format!(
        "Title: Web tier patching\nScope: host=web-*\nMode: mute\nStart: {}\nEnd: {}\n",
        (now - Duration::hours(1)).format("%Y-%m-%d %H:%M:%S"),
        (now + Duration::hours(1)).format("%Y-%m-%d %H:%M:%S"),
    );
    let mw_email = ingest_email(&h.store, 1, "[MW] web tier patching", &mw_body, now).await;
    h.pipeline.process(&mw_email).await.unwrap();

    // The maintenance email became a window, not an alert.
    assert_eq!(h.store.count_incidents(None).await.unwrap(), 0);
    let windows = h.store.list_active_windows(now).await.unwrap();
    assert_eq!(windows.len(), 1);

    let alert = ingest_email(&h.store, 2, PROBLEM_SUBJECT, PROBLEM_BODY, now).await;
    h.pipeline.process(&alert).await.unwrap();

    let incidents = h.store.list_incidents(None, 10, 0).await.unwrap();
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert!(incident.is_in_maintenance);
    assert_eq!(incident.maintenance_window_id.as_deref(), Some(windows[0].id.as_str()));

    let events = h.store.events_for_incident(&incident.id, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_suppressed);
    assert!(events[0]
        .suppression_reason
        .as_deref()
        .unwrap()
        .starts_with("mute:window:"));

    // The match record explains which selector fired.
    let matches = h.store.list_matches_for_window(&windows[0].id).await.unwrap();
    assert_eq!(matches.len(), 1);
    let (_, event_id, reason) = &matches[0];
    assert_eq!(event_id.as_deref(), Some(events[0].id.as_str()));
    assert_eq!(reason["reasons"][0]["field"], "host");
    assert_eq!(reason["reasons"][0]["pattern"], "web-*");
}

#[tokio::test]
async fn scenario_llm_learns_once_per_format() {
    let mut rules = HashMap::new();
    rules.insert(
        "host".to_string(),
        ExtractionRule {
            source: RuleSource::Body,
            regex: r"Device:\s*(\S+)".to_string(),
            group: Some(1),
            map: None,
            keywords: None,
        },
    );
    rules.insert(
        "service".to_string(),
        ExtractionRule {
            source: RuleSource::Body,
            regex: r"Impact:\s*(\S+)".to_string(),
            group: Some(1),
            map: None,
            keywords: None,
        },
    );
    let extraction = LlmExtraction {
        fields: ExtractedFields {
            host: Some("core-sw-12".to_string()),
            service: Some("bgp".to_string()),
            severity: Some("major".to_string()),
            state: Some("triggered".to_string()),
            summary: None,
        },
        source_name: "NetPulse".to_string(),
        confidence: 0.92,
        rules,
    };
    let h = harness(vec![Ok(extraction)]).await;
    let now = Utc::now();

    let subject = "NetPulse incident 4711 opened";
    let body = "Device: core-sw-12\nImpact: bgp peering degraded";

    let first = ingest_email(&h.store, 1, subject, body, now).await;
    h.pipeline.process(&first).await.unwrap();
    assert_eq!(h.llm.call_count(), 1);

    let second = ingest_email(&h.store, 2, subject, body, now + Duration::minutes(1)).await;
    h.pipeline.process(&second).await.unwrap();
    assert_eq!(h.llm.call_count(), 1, "second email must be served from cache");

    // Both events correlated into one incident for the same device.
    let incidents = h.store.list_incidents(None, 10, 0).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].event_count, 2);
    assert_eq!(incidents[0].host.as_deref(), Some("core-sw-12"));
}
