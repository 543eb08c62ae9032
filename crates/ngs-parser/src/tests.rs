use crate::pipeline::{EmailParser, ParseOutcome, ParserSettings};
use crate::rules::{compile_parsers, default_parsers};
use chrono::Utc;
use ngs_common::types::{AlertState, Severity};
use ngs_llm::{
    ExtractedFields, ExtractionRule, LlmError, LlmExtraction, RuleSource, ScriptedExtractor,
};
use ngs_storage::{MailStore, NewEmail};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

async fn setup(llm: Arc<ScriptedExtractor>) -> (TempDir, Arc<MailStore>, EmailParser) {
    ngs_common::id::init(1, 1);
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MailStore::new(dir.path()).await.unwrap());
    let parser = EmailParser::new(
        compile_parsers(default_parsers()).unwrap(),
        store.clone(),
        llm,
        ParserSettings::default(),
    );
    (dir, store, parser)
}

async fn store_email(
    store: &MailStore,
    uid: i64,
    subject: &str,
    from: &str,
    body: &str,
) -> ngs_storage::EmailRow {
    store
        .insert_raw_email(&NewEmail {
            folder: "INBOX".to_string(),
            uid,
            message_id: format!("<{uid}@test>"),
            subject: subject.to_string(),
            from_address: from.to_string(),
            to_addresses: vec![],
            cc_addresses: vec![],
            date_header: Some(Utc::now()),
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

fn novel_extraction(confidence: f64) -> LlmExtraction {
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
        "severity".to_string(),
        ExtractionRule {
            source: RuleSource::Subject,
            regex: r"\[(\w+)\]".to_string(),
            group: Some(1),
            map: Some(HashMap::from([("MAJOR".to_string(), "high".to_string())])),
            keywords: None,
        },
    );
    LlmExtraction {
        fields: ExtractedFields {
            host: Some("core-sw-12".to_string()),
            service: Some("bgp".to_string()),
            severity: Some("high".to_string()),
            state: Some("triggered".to_string()),
            summary: Some("BGP session down".to_string()),
        },
        source_name: "NetPulse".to_string(),
        confidence,
        rules,
    }
}

const NOVEL_SUBJECT: &str = "[MAJOR] BGP session down";
const NOVEL_BODY: &str = "Device: core-sw-12\nService impact: bgp peering";

#[tokio::test]
async fn static_rule_parses_op5_problem() {
    let llm = Arc::new(ScriptedExtractor::new(vec![]));
    let (_dir, store, parser) = setup(llm.clone()).await;

    let email = store_email(
        &store,
        1,
        "** PROBLEM ** Host: web-01 Service: http State: CRITICAL",
        "op5@mon.example.com",
        "Service: http\nState: CRITICAL",
    )
    .await;

    let outcome = parser.parse_email(&email).await.unwrap();
    let ParseOutcome::Event(event) = outcome else {
        panic!("expected event");
    };
    assert_eq!(event.host.as_deref(), Some("web-01"));
    assert_eq!(event.service.as_deref(), Some("http"));
    assert_eq!(event.severity, Severity::Critical);
    assert_eq!(event.state, AlertState::Firing);
    assert_eq!(event.source_tool, "op5");
    assert_eq!(event.fingerprint.len(), 32);
    assert_eq!(llm.call_count(), 0, "rule match must not consult the LLM");

    let stored = store.get_raw_email(&email.id).await.unwrap().unwrap();
    assert_eq!(stored.parse_status, "parsed");
}

#[tokio::test]
async fn reparsing_is_deterministic() {
    let llm = Arc::new(ScriptedExtractor::new(vec![]));
    let (_dir, store, parser) = setup(llm).await;

    let email = store_email(
        &store,
        2,
        "** PROBLEM ** Host: web-01 Service: http State: CRITICAL",
        "op5@mon.example.com",
        "Service: http\nState: CRITICAL",
    )
    .await;

    let first = parser.parse_email(&email).await.unwrap();
    let second = parser.parse_email(&email).await.unwrap();
    let (ParseOutcome::Event(a), ParseOutcome::Event(b)) = (first, second) else {
        panic!("expected events");
    };
    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(a.severity, b.severity);
    assert_eq!(a.normalized_signature, b.normalized_signature);
}

#[tokio::test]
async fn llm_learns_pattern_then_cache_answers() {
    let llm = Arc::new(ScriptedExtractor::new(vec![Ok(novel_extraction(0.95))]));
    let (_dir, store, parser) = setup(llm.clone()).await;

    // First novel email: no rule, no cache -> LLM learns a pattern.
    let first = store_email(&store, 3, NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY).await;
    let outcome = parser.parse_email(&first).await.unwrap();
    let ParseOutcome::Event(event) = outcome else {
        panic!("expected event");
    };
    assert_eq!(event.host.as_deref(), Some("core-sw-12"));
    assert_eq!(event.severity, Severity::High);
    assert_eq!(llm.call_count(), 1);

    // Second, similar email: answered from cache, LLM not called again.
    let second = store_email(&store, 4, NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY).await;
    let outcome = parser.parse_email(&second).await.unwrap();
    let ParseOutcome::Event(event) = outcome else {
        panic!("expected event");
    };
    assert_eq!(event.host.as_deref(), Some("core-sw-12"));
    assert_eq!(llm.call_count(), 1, "cache hit must not call the LLM");

    let sig = crate::signature::compute(NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY);
    let pattern = store.find_pattern_by_signature(&sig.hash()).await.unwrap().unwrap();
    assert_eq!(pattern.match_count, 2);
    assert!(!pattern.is_approved);
}

#[tokio::test]
async fn low_confidence_extraction_is_quarantined() {
    let llm = Arc::new(ScriptedExtractor::new(vec![Ok(novel_extraction(0.2))]));
    let (_dir, store, parser) = setup(llm).await;

    let email = store_email(&store, 5, NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY).await;
    let outcome = parser.parse_email(&email).await.unwrap();
    assert!(matches!(
        outcome,
        ParseOutcome::Quarantined { ref reason } if reason == "low_confidence"
    ));

    let stored = store.get_raw_email(&email.id).await.unwrap().unwrap();
    assert_eq!(stored.parse_status, "quarantined");
    assert_eq!(store.count_pending_quarantine().await.unwrap(), 1);

    // Nothing was cached for this format.
    let sig = crate::signature::compute(NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY);
    assert!(store.find_pattern_by_signature(&sig.hash()).await.unwrap().is_none());
}

#[tokio::test]
async fn inconsistent_llm_rules_are_quarantined() {
    // The rule regex will not reproduce the claimed host.
    let mut bad = novel_extraction(0.95);
    bad.fields.host = Some("some-other-host".to_string());
    let llm = Arc::new(ScriptedExtractor::new(vec![Ok(bad)]));
    let (_dir, store, parser) = setup(llm).await;

    let email = store_email(&store, 6, NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY).await;
    let outcome = parser.parse_email(&email).await.unwrap();
    assert!(matches!(
        outcome,
        ParseOutcome::Quarantined { ref reason } if reason == "validation_failed"
    ));
}

#[tokio::test]
async fn transient_llm_failure_leaves_email_pending() {
    let llm = Arc::new(ScriptedExtractor::new(vec![Err(LlmError::ApiError {
        status: 503,
        body: "overloaded".to_string(),
    })]));
    let (_dir, store, parser) = setup(llm).await;

    let email = store_email(&store, 7, NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY).await;
    let result = parser.parse_email(&email).await;
    assert!(result.is_err(), "transient faults must propagate to the scheduler");

    let stored = store.get_raw_email(&email.id).await.unwrap().unwrap();
    assert_eq!(stored.parse_status, "pending", "email stays pending for reprocess");
}

#[tokio::test]
async fn failing_cache_falls_back_to_llm_and_decays() {
    let llm = Arc::new(ScriptedExtractor::new(vec![Ok(novel_extraction(0.95))]));
    let (_dir, store, parser) = setup(llm.clone()).await;

    // Seed a cache row for this format whose rules do not match.
    let sig = crate::signature::compute(NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY);
    store
        .insert_learned_pattern(&ngs_storage::NewPattern {
            signature_hash: sig.hash(),
            from_domain: Some("netpulse.example.com".to_string()),
            subject_prefix: None,
            body_markers: vec![],
            source_name: "NetPulse".to_string(),
            source_tool: "netpulse".to_string(),
            extraction_rules: json!({
                "host": {"source": "body", "regex": "Router:\\s*(\\S+)", "group": 1}
            }),
            analysis_duration_ms: None,
            created_from_email_id: None,
        })
        .await
        .unwrap();

    let email = store_email(&store, 8, NOVEL_SUBJECT, "noc@netpulse.example.com", NOVEL_BODY).await;
    let outcome = parser.parse_email(&email).await.unwrap();
    assert!(matches!(outcome, ParseOutcome::Event(_)));
    assert_eq!(llm.call_count(), 1, "stale cache must fall through to the LLM");

    let pattern = store.find_pattern_by_signature(&sig.hash()).await.unwrap().unwrap();
    assert!(pattern.success_rate < 100.0, "failed application must decay success_rate");
}
