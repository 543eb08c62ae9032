use crate::{ExtractionRule, LlmError, LlmExtraction, Result, RuleSource};
use ngs_common::normalize;
use regex::RegexBuilder;
use std::collections::HashMap;

/// Apply one extraction rule to the email text. Returns the captured and
/// map-normalized value, or `None` when the rule does not match.
pub fn apply_rule(rule: &ExtractionRule, subject: &str, body: &str) -> Option<String> {
    let re = RegexBuilder::new(&rule.regex)
        .case_insensitive(true)
        .build()
        .ok()?;
    let text = match rule.source {
        RuleSource::Subject => subject,
        RuleSource::Body => body,
    };
    let caps = re.captures(text)?;
    let group = rule.group.unwrap_or(1);
    let value = caps
        .get(group)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().trim().to_string())?;

    if value.is_empty() {
        return None;
    }

    if let Some(map) = &rule.map {
        for (token, normalized) in map {
            if token.eq_ignore_ascii_case(&value) {
                return Some(normalized.clone());
            }
        }
    }
    Some(value)
}

/// Apply a full rule set, producing field -> value.
pub fn apply_rules(
    rules: &HashMap<String, ExtractionRule>,
    subject: &str,
    body: &str,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (field, rule) in rules {
        if let Some(value) = apply_rule(rule, subject, body) {
            out.insert(field.clone(), value);
        }
    }
    out
}

/// Full validation of a model response against the source text.
///
/// Rejects when: the severity/state tokens fall outside the known
/// vocabulary, the host is empty, confidence is out of range, any
/// proposed regex fails to compile, or a rule applied to the original
/// text does not reproduce the returned value.
pub fn validate_extraction(
    extraction: &LlmExtraction,
    subject: &str,
    body: &str,
) -> Result<()> {
    if !(0.0..=1.0).contains(&extraction.confidence) {
        return Err(LlmError::Validation(format!(
            "confidence {} outside [0,1]",
            extraction.confidence
        )));
    }

    let host_ok = extraction
        .fields
        .host
        .as_deref()
        .map(|h| !h.trim().is_empty())
        .unwrap_or(false);
    if !host_ok {
        return Err(LlmError::Validation("host is empty".to_string()));
    }

    if let Some(sev) = extraction.fields.severity.as_deref() {
        if !normalize::is_known_severity_token(sev) {
            return Err(LlmError::Validation(format!(
                "severity token '{sev}' not in vocabulary"
            )));
        }
    }

    if let Some(state) = extraction.fields.state.as_deref() {
        let mapped = normalize::state_token(state);
        if mapped == ngs_common::types::AlertState::Unknown
            && !state.trim().eq_ignore_ascii_case("unknown")
        {
            return Err(LlmError::Validation(format!(
                "state token '{state}' not in vocabulary"
            )));
        }
    }

    // Every proposed regex must compile.
    for (field, rule) in &extraction.rules {
        if let Err(e) = RegexBuilder::new(&rule.regex).case_insensitive(true).build() {
            return Err(LlmError::Validation(format!(
                "regex for '{field}' does not compile: {e}"
            )));
        }
    }

    // Self-consistency: rules applied to the original text must reproduce
    // the values the model claims it extracted.
    let produced = apply_rules(&extraction.rules, subject, body);
    let claims: [(&str, Option<&str>); 4] = [
        ("host", extraction.fields.host.as_deref()),
        ("service", extraction.fields.service.as_deref()),
        ("severity", extraction.fields.severity.as_deref()),
        ("state", extraction.fields.state.as_deref()),
    ];
    for (field, claimed) in claims {
        let Some(claimed) = claimed else { continue };
        let Some(rule) = extraction.rules.get(field) else {
            continue;
        };
        match produced.get(field) {
            Some(value) if values_agree(value, claimed, rule) => {}
            Some(value) => {
                return Err(LlmError::Validation(format!(
                    "rule for '{field}' produced '{value}' but model claimed '{claimed}'"
                )));
            }
            None => {
                return Err(LlmError::Validation(format!(
                    "rule for '{field}' does not match the source text"
                )));
            }
        }
    }

    Ok(())
}

/// A rule agrees with a claim when the produced value equals it, or when
/// the claim is the map-normalized form of the produced value.
fn values_agree(produced: &str, claimed: &str, rule: &ExtractionRule) -> bool {
    if produced.eq_ignore_ascii_case(claimed) {
        return true;
    }
    if let Some(map) = &rule.map {
        for (token, normalized) in map {
            if token.eq_ignore_ascii_case(claimed) && normalized.eq_ignore_ascii_case(produced) {
                return true;
            }
            if token.eq_ignore_ascii_case(produced) && normalized.eq_ignore_ascii_case(claimed) {
                return true;
            }
        }
    }
    false
}
