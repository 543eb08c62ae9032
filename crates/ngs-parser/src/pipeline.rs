//! The hybrid parse pipeline: static rules, then the learned-pattern
//! cache, then the LLM fallback with a quarantine path.

use anyhow::Result;
use ngs_common::fingerprint;
use ngs_common::normalize;
use ngs_common::types::{AlertState, NormalizedEvent, ParseStatus, Severity};
use ngs_llm::validate::{apply_rules, validate_extraction};
use ngs_llm::{utf8_excerpt, LlmExtractor};
use ngs_storage::{EmailRow, ExtractionLogEntry, IdempotencyOutcome, MailStore, NewPattern};
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use crate::rules::RuleParser;
use crate::signature;

/// Thresholds and bounds for the parse pipeline.
#[derive(Debug, Clone)]
pub struct ParserSettings {
    /// Minimum pattern-cache success rate (percent) to trust cached rules.
    pub cache_min_success: f64,
    /// Minimum LLM confidence to cache a newly learned pattern.
    pub llm_min_confidence: f64,
    /// Below this confidence the extraction is quarantined outright.
    pub quarantine_confidence: f64,
    /// Bound on the body excerpt sent to the model.
    pub body_excerpt_bytes: usize,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            cache_min_success: 70.0,
            llm_min_confidence: 0.60,
            quarantine_confidence: 0.60,
            body_excerpt_bytes: ngs_llm::DEFAULT_BODY_EXCERPT_BYTES,
        }
    }
}

/// What the pipeline did with one email.
#[derive(Debug, Clone)]
pub enum ParseOutcome {
    /// A normalized event, ready for maintenance matching and correlation.
    Event(Box<NormalizedEvent>),
    /// Held for human review; no event was produced.
    Quarantined { reason: String },
}

pub struct EmailParser {
    parsers: Vec<RuleParser>,
    store: Arc<MailStore>,
    llm: Arc<dyn LlmExtractor>,
    settings: ParserSettings,
}

fn tag_fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)tags?[=:]\s*([^\s,;]+)").unwrap())
}

impl EmailParser {
    pub fn new(
        parsers: Vec<RuleParser>,
        store: Arc<MailStore>,
        llm: Arc<dyn LlmExtractor>,
        settings: ParserSettings,
    ) -> Self {
        Self {
            parsers,
            store,
            llm,
            settings,
        }
    }

    /// Run the full pipeline for one stored email.
    ///
    /// Data problems terminate here (status quarantined/failed); only
    /// transient faults (LLM endpoint unreachable, database errors)
    /// propagate to the caller, which owns the retry-vs-DLQ decision.
    pub async fn parse_email(&self, email: &EmailRow) -> Result<ParseOutcome> {
        let subject = email.subject.as_str();
        let body = email.best_body().to_string();

        // 1. Static rule parsers, in configuration order.
        for parser in &self.parsers {
            if parser.matches(&email.from_address, subject) {
                let started = Instant::now();
                let fields = parser.extract(subject, &body);
                let event = self.build_event(email, parser, &fields);
                self.store
                    .log_extraction(&ExtractionLogEntry {
                        raw_email_id: email.id.clone(),
                        pattern_cache_id: None,
                        extraction_type: "rule".to_string(),
                        extracted_host: event.host.clone(),
                        extracted_service: event.service.clone(),
                        extracted_severity: Some(event.severity.to_string()),
                        extracted_state: Some(event.state.to_string()),
                        extraction_confidence: Some(1.0),
                        llm_response: None,
                        duration_ms: started.elapsed().as_millis() as i64,
                    })
                    .await?;
                self.store
                    .set_parse_status(&email.id, ParseStatus::Parsed, None)
                    .await?;
                tracing::debug!(
                    email_id = %email.id,
                    parser = %parser.config.name,
                    host = ?event.host,
                    "Email parsed by static rule"
                );
                return Ok(ParseOutcome::Event(Box::new(event)));
            }
        }

        // 2. Learned-pattern cache keyed by the format signature.
        let sig = signature::compute(subject, &email.from_address, &body);
        let sig_hash = sig.hash();

        if let Some(pattern) = self.store.find_pattern_by_signature(&sig_hash).await? {
            if pattern.success_rate >= self.settings.cache_min_success {
                let started = Instant::now();
                let rules: HashMap<String, ngs_llm::ExtractionRule> =
                    serde_json::from_value(pattern.extraction_rules.clone()).unwrap_or_default();
                let extracted = apply_rules(&rules, subject, &body);

                let host_ok = extracted
                    .get("host")
                    .map(|h| !h.trim().is_empty())
                    .unwrap_or(false);
                if host_ok {
                    self.store.record_pattern_match(&pattern.id, true).await?;
                    let event = self.build_event_from_map(
                        email,
                        &pattern.source_tool,
                        &extracted,
                        json!({"source_name": pattern.source_name, "pattern_id": pattern.id}),
                    );
                    self.store
                        .log_extraction(&ExtractionLogEntry {
                            raw_email_id: email.id.clone(),
                            pattern_cache_id: Some(pattern.id.clone()),
                            extraction_type: "cached".to_string(),
                            extracted_host: event.host.clone(),
                            extracted_service: event.service.clone(),
                            extracted_severity: Some(event.severity.to_string()),
                            extracted_state: Some(event.state.to_string()),
                            extraction_confidence: Some(0.9),
                            llm_response: None,
                            duration_ms: started.elapsed().as_millis() as i64,
                        })
                        .await?;
                    self.store
                        .set_parse_status(&email.id, ParseStatus::Parsed, None)
                        .await?;
                    tracing::debug!(
                        email_id = %email.id,
                        signature = %sig_hash,
                        source = %pattern.source_name,
                        "Email parsed from pattern cache"
                    );
                    return Ok(ParseOutcome::Event(Box::new(event)));
                }

                // Cached rules no longer fit this format.
                self.store.record_pattern_match(&pattern.id, false).await?;
                tracing::warn!(
                    email_id = %email.id,
                    signature = %sig_hash,
                    "Cached pattern failed validation, falling through to LLM"
                );
            }
        }

        // 3. LLM fallback.
        self.parse_with_llm(email, subject, &body, &sig, &sig_hash).await
    }

    async fn parse_with_llm(
        &self,
        email: &EmailRow,
        subject: &str,
        body: &str,
        sig: &signature::FormatSignature,
        sig_hash: &str,
    ) -> Result<ParseOutcome> {
        tracing::info!(email_id = %email.id, signature = %sig_hash, "No cached pattern, calling LLM");
        let started = Instant::now();
        let excerpt = utf8_excerpt(body, self.settings.body_excerpt_bytes);

        // The LLM call itself is reserved through the idempotency store,
        // keyed by the format: a reprocessed email or a concurrent worker
        // must not pay for the same extraction twice.
        let llm_key = ngs_common::hash::sha256_hex(&format!("llm:{sig_hash}"));
        let replayed: Option<ngs_llm::LlmExtraction> = match self
            .store
            .idempotency_begin(&llm_key, 24, 5)
            .await?
        {
            IdempotencyOutcome::Completed(Some(stored)) => serde_json::from_value(stored).ok(),
            IdempotencyOutcome::Completed(None) => None,
            IdempotencyOutcome::InProgress => {
                anyhow::bail!("LLM extraction for format {sig_hash} already in flight");
            }
            IdempotencyOutcome::Fresh => None,
        };

        let extraction = match replayed {
            Some(extraction) => extraction,
            None => match self.llm.extract(subject, excerpt).await {
                Ok(e) => {
                    self.store
                        .idempotency_complete(&llm_key, Some(&serde_json::to_value(&e)?))
                        .await?;
                    e
                }
                Err(e) if e.is_transient() => {
                    // Endpoint trouble: release the reservation and leave
                    // the email pending for the reprocess sweeper.
                    self.store.idempotency_fail(&llm_key).await?;
                    return Err(e.into());
                }
                Err(e) => {
                    self.store.idempotency_fail(&llm_key).await?;
                    return self
                        .quarantine(email, json!({"error": e.to_string()}), 0.0, "llm_error")
                        .await;
                }
            },
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let llm_response = serde_json::to_value(&extraction)?;

        if let Err(e) = validate_extraction(&extraction, subject, body) {
            self.store
                .log_extraction(&ExtractionLogEntry {
                    raw_email_id: email.id.clone(),
                    pattern_cache_id: None,
                    extraction_type: "llm_fallback".to_string(),
                    extracted_host: extraction.fields.host.clone(),
                    extracted_service: extraction.fields.service.clone(),
                    extracted_severity: extraction.fields.severity.clone(),
                    extracted_state: extraction.fields.state.clone(),
                    extraction_confidence: Some(extraction.confidence),
                    llm_response: Some(llm_response.clone()),
                    duration_ms,
                })
                .await?;
            return self
                .quarantine(
                    email,
                    json!({"extraction": llm_response, "error": e.to_string()}),
                    extraction.confidence,
                    "validation_failed",
                )
                .await;
        }

        if extraction.confidence < self.settings.quarantine_confidence {
            return self
                .quarantine(
                    email,
                    json!({"extraction": llm_response}),
                    extraction.confidence,
                    "low_confidence",
                )
                .await;
        }

        // Learn the pattern for next time (high confidence only).
        let mut pattern_id = None;
        let mut extraction_type = "llm_fallback";
        if extraction.confidence >= self.settings.llm_min_confidence {
            let pattern = self
                .store
                .insert_learned_pattern(&NewPattern {
                    signature_hash: sig_hash.to_string(),
                    from_domain: Some(sig.from_domain.clone()).filter(|d| !d.is_empty()),
                    subject_prefix: Some(sig.subject_prefix.clone()).filter(|p| !p.is_empty()),
                    body_markers: sig.body_markers.clone(),
                    source_name: extraction.source_name.clone(),
                    source_tool: source_tool_slug(&extraction.source_name),
                    extraction_rules: serde_json::to_value(&extraction.rules)?,
                    analysis_duration_ms: Some(duration_ms),
                    created_from_email_id: Some(email.id.clone()),
                })
                .await?;
            pattern_id = Some(pattern.id);
            extraction_type = "learned_new";
        }

        let mut extracted = HashMap::new();
        for (k, v) in [
            ("host", &extraction.fields.host),
            ("service", &extraction.fields.service),
            ("severity", &extraction.fields.severity),
            ("state", &extraction.fields.state),
            ("summary", &extraction.fields.summary),
        ] {
            if let Some(v) = v {
                extracted.insert(k.to_string(), v.clone());
            }
        }

        let event = self.build_event_from_map(
            email,
            &source_tool_slug(&extraction.source_name),
            &extracted,
            json!({
                "source_name": extraction.source_name,
                "confidence": extraction.confidence,
            }),
        );

        self.store
            .log_extraction(&ExtractionLogEntry {
                raw_email_id: email.id.clone(),
                pattern_cache_id: pattern_id,
                extraction_type: extraction_type.to_string(),
                extracted_host: event.host.clone(),
                extracted_service: event.service.clone(),
                extracted_severity: Some(event.severity.to_string()),
                extracted_state: Some(event.state.to_string()),
                extraction_confidence: Some(extraction.confidence),
                llm_response: Some(llm_response),
                duration_ms,
            })
            .await?;
        self.store
            .set_parse_status(&email.id, ParseStatus::Parsed, None)
            .await?;
        Ok(ParseOutcome::Event(Box::new(event)))
    }

    async fn quarantine(
        &self,
        email: &EmailRow,
        extraction_data: serde_json::Value,
        confidence: f64,
        reason: &str,
    ) -> Result<ParseOutcome> {
        self.store
            .insert_quarantine(&email.id, &extraction_data, confidence, reason)
            .await?;
        self.store
            .set_parse_status(&email.id, ParseStatus::Quarantined, None)
            .await?;
        Ok(ParseOutcome::Quarantined {
            reason: reason.to_string(),
        })
    }

    fn build_event(
        &self,
        email: &EmailRow,
        parser: &RuleParser,
        fields: &HashMap<String, String>,
    ) -> NormalizedEvent {
        let severity = parser.severity(fields.get("severity").map(|s| s.as_str()));
        let state = parser.state(fields.get("state").map(|s| s.as_str()));
        let mut payload = json!({
            "subject": email.subject,
            "from": email.from_address,
            "parser": parser.config.name,
        });
        for (k, v) in fields {
            if !matches!(k.as_str(), "host" | "check_name" | "service" | "severity" | "state") {
                payload[k] = json!(v);
            }
        }
        self.finish_event(
            email,
            &parser.config.source_tool,
            fields,
            severity,
            state,
            payload,
            &parser.config.static_tags,
        )
    }

    fn build_event_from_map(
        &self,
        email: &EmailRow,
        source_tool: &str,
        fields: &HashMap<String, String>,
        extra_payload: serde_json::Value,
    ) -> NormalizedEvent {
        let severity = fields
            .get("severity")
            .map(|s| normalize::severity_token(s))
            .unwrap_or(Severity::Medium);
        let state = fields
            .get("state")
            .map(|s| normalize::state_token(s))
            .unwrap_or(AlertState::Firing);
        let mut payload = json!({
            "subject": email.subject,
            "from": email.from_address,
        });
        if let Some(summary) = fields.get("summary") {
            payload["summary"] = json!(summary);
        }
        if let serde_json::Value::Object(extra) = extra_payload {
            for (k, v) in extra {
                payload[k] = v;
            }
        }
        self.finish_event(email, source_tool, fields, severity, state, payload, &[])
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_event(
        &self,
        email: &EmailRow,
        source_tool: &str,
        fields: &HashMap<String, String>,
        severity: Severity,
        state: AlertState,
        payload: serde_json::Value,
        static_tags: &[String],
    ) -> NormalizedEvent {
        let body = email.best_body();
        let host = fields.get("host").map(|h| normalize::host(h)).filter(|h| !h.is_empty());
        let check_name = fields
            .get("check_name")
            .or_else(|| fields.get("trigger"))
            .or_else(|| fields.get("alert_name"))
            .cloned();
        let service = fields.get("service").cloned();
        let environment = fields.get("environment").cloned();
        let region = fields.get("region").cloned();

        let normalized_signature = fingerprint::normalized_signature(&email.subject, body);
        let fp = fingerprint::fingerprint_v2(
            source_tool,
            environment.as_deref(),
            host.as_deref(),
            check_name.as_deref(),
            service.as_deref(),
            &normalized_signature,
        );

        let tags = extract_tags(body, environment.as_deref(), region.as_deref(), static_tags);

        NormalizedEvent {
            raw_email_id: Some(email.id.clone()),
            source_tool: source_tool.to_string(),
            environment,
            region,
            host,
            check_name,
            service,
            severity,
            state,
            occurred_at: email.date_header.unwrap_or(email.received_at),
            normalized_signature,
            fingerprint: fp,
            payload,
            tags,
            is_suppressed: false,
            suppression_reason: None,
        }
    }
}

/// Slug form of a source name ("Splunk Alert" -> "splunk_alert", with
/// well-known tools shortened).
pub fn source_tool_slug(source_name: &str) -> String {
    let slug = source_name.trim().to_lowercase().replace(' ', "_");
    for tool in ["xymon", "splunk", "nagios", "prometheus", "zabbix", "pagerduty", "datadog", "op5"] {
        if slug.contains(tool) {
            return tool.to_string();
        }
    }
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Tags: configured static tags plus env/region markers plus explicit
/// `tag=`/`tags:` fragments in the body. Deduplicated and sorted.
fn extract_tags(
    body: &str,
    environment: Option<&str>,
    region: Option<&str>,
    static_tags: &[String],
) -> Vec<String> {
    let mut tags: Vec<String> = static_tags.to_vec();
    if let Some(env) = environment {
        tags.push(format!("env:{env}"));
    }
    if let Some(region) = region {
        tags.push(format!("region:{region}"));
    }
    for caps in tag_fragment_re().captures_iter(body) {
        if let Some(m) = caps.get(1) {
            tags.push(m.as_str().to_string());
        }
    }
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tool_slug_shortens_known_tools() {
        assert_eq!(source_tool_slug("Splunk Alert"), "splunk");
        assert_eq!(source_tool_slug("Xymon"), "xymon");
        assert_eq!(source_tool_slug("NetScout Pulse"), "netscout_pulse");
        assert_eq!(source_tool_slug(""), "unknown");
    }

    #[test]
    fn tags_are_deduplicated_and_sorted() {
        let tags = extract_tags(
            "tags: db\ntag=db\ntag: cache",
            Some("prod"),
            None,
            &["team:sre".to_string()],
        );
        assert_eq!(tags, vec!["cache", "db", "env:prod", "team:sre"]);
    }
}
