//! Config-driven rule parsers: the fast path of normalization.
//!
//! Each parser is keyed by a subject pattern and an optional from-domain
//! filter; named capture groups pull fields out of the subject and body.

use anyhow::{Context, Result};
use ngs_common::normalize;
use ngs_common::types::{AlertState, Severity};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One rule parser as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleParserConfig {
    pub name: String,
    pub source_tool: String,
    pub subject_pattern: String,
    #[serde(default)]
    pub from_domain: Option<String>,
    #[serde(default)]
    pub body_patterns: Vec<String>,
    /// Source-native severity tokens -> core tokens.
    #[serde(default)]
    pub severity_map: HashMap<String, String>,
    /// Source-native state tokens -> firing/resolved/unknown.
    #[serde(default)]
    pub state_map: HashMap<String, String>,
    #[serde(default)]
    pub static_tags: Vec<String>,
}

/// A compiled rule parser. Compilation failures are configuration errors
/// and reject the whole parser set (fail-fast at load).
pub struct RuleParser {
    pub config: RuleParserConfig,
    subject_re: Regex,
    body_res: Vec<Regex>,
}

impl RuleParser {
    pub fn compile(config: RuleParserConfig) -> Result<Self> {
        let subject_re = RegexBuilder::new(&config.subject_pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("parser '{}': bad subject pattern", config.name))?;
        let body_res = config
            .body_patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()
                    .with_context(|| format!("parser '{}': bad body pattern", config.name))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            subject_re,
            body_res,
        })
    }

    /// Whether this parser claims the message.
    pub fn matches(&self, from_address: &str, subject: &str) -> bool {
        if let Some(domain) = &self.config.from_domain {
            if !from_address.to_lowercase().contains(&domain.to_lowercase()) {
                return false;
            }
        }
        self.subject_re.is_match(subject)
    }

    /// Extract every named capture group from subject and body patterns.
    pub fn extract(&self, subject: &str, body: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        collect_named_captures(&self.subject_re, subject, &mut fields);
        for re in &self.body_res {
            collect_named_captures(re, body, &mut fields);
        }
        fields
    }

    /// Map an extracted severity token through the parser's own map, then
    /// the shared vocabulary. Unknown stays medium.
    pub fn severity(&self, token: Option<&str>) -> Severity {
        let Some(token) = token else {
            return Severity::Medium;
        };
        let mapped = lookup_ci(&self.config.severity_map, token);
        normalize::severity_token(mapped.as_deref().unwrap_or(token))
    }

    /// Map an extracted state token; missing tokens default to firing
    /// (a monitoring system that says nothing is reporting a problem).
    pub fn state(&self, token: Option<&str>) -> AlertState {
        let Some(token) = token else {
            return AlertState::Firing;
        };
        let mapped = lookup_ci(&self.config.state_map, token);
        normalize::state_token(mapped.as_deref().unwrap_or(token))
    }
}

fn lookup_ci(map: &HashMap<String, String>, token: &str) -> Option<String> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(token))
        .map(|(_, v)| v.clone())
}

fn collect_named_captures(re: &Regex, text: &str, out: &mut HashMap<String, String>) {
    let Some(caps) = re.captures(text) else {
        return;
    };
    for name in re.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            let value = m.as_str().trim();
            if !value.is_empty() {
                out.entry(name.to_string()).or_insert_with(|| value.to_string());
            }
        }
    }
}

/// Compile a parser list, rejecting the whole set on the first bad rule.
pub fn compile_parsers(configs: Vec<RuleParserConfig>) -> Result<Vec<RuleParser>> {
    configs.into_iter().map(RuleParser::compile).collect()
}

/// Built-in parser set for common monitoring sources, used when the
/// configuration does not define any.
pub fn default_parsers() -> Vec<RuleParserConfig> {
    vec![
        RuleParserConfig {
            name: "OP5 Monitor".to_string(),
            source_tool: "op5".to_string(),
            subject_pattern:
                r"\*\*\s*(?P<state>PROBLEM|RECOVERY|ACKNOWLEDGEMENT)\s*\*\*.*Host:\s*(?P<host>\S+)"
                    .to_string(),
            from_domain: None,
            body_patterns: vec![
                r"Service:\s*(?P<service>.+)".to_string(),
                r"State:\s*(?P<severity>CRITICAL|WARNING|OK|UNKNOWN)".to_string(),
                r"Additional Info:\s*(?P<info>.+)".to_string(),
            ],
            severity_map: HashMap::new(),
            state_map: HashMap::new(),
            static_tags: vec![],
        },
        RuleParserConfig {
            name: "Nagios".to_string(),
            source_tool: "nagios".to_string(),
            subject_pattern: r"\*\*\s*(?P<state>PROBLEM|RECOVERY)\s*\*\*.*Host:\s*(?P<host>\S+)"
                .to_string(),
            from_domain: None,
            body_patterns: vec![
                r"Service:\s*(?P<service>.+)".to_string(),
                r"State:\s*(?P<severity>CRITICAL|WARNING|OK|UNKNOWN)".to_string(),
            ],
            severity_map: HashMap::new(),
            state_map: HashMap::new(),
            static_tags: vec![],
        },
        RuleParserConfig {
            name: "Xymon".to_string(),
            source_tool: "xymon".to_string(),
            subject_pattern: r"(?P<host>\S+)\.(?P<service>\S+)\s+(?P<severity>red|yellow|green)"
                .to_string(),
            from_domain: None,
            body_patterns: vec![],
            severity_map: HashMap::from([
                ("red".to_string(), "critical".to_string()),
                ("yellow".to_string(), "warning".to_string()),
                ("green".to_string(), "info".to_string()),
            ]),
            state_map: HashMap::from([
                ("red".to_string(), "firing".to_string()),
                ("yellow".to_string(), "firing".to_string()),
                ("green".to_string(), "resolved".to_string()),
            ]),
            static_tags: vec![],
        },
        RuleParserConfig {
            name: "Splunk Alert".to_string(),
            source_tool: "splunk".to_string(),
            subject_pattern: r"Splunk Alert:\s*(?P<check_name>.+)".to_string(),
            from_domain: None,
            body_patterns: vec![
                r"host=(?P<host>\S+)".to_string(),
                r"severity=(?P<severity>\w+)".to_string(),
            ],
            severity_map: HashMap::new(),
            state_map: HashMap::new(),
            static_tags: vec![],
        },
        RuleParserConfig {
            name: "Prometheus AlertManager".to_string(),
            source_tool: "prometheus".to_string(),
            subject_pattern: r"\[(?P<state>FIRING|RESOLVED)(?::\d+)?\]\s*(?P<check_name>.+)"
                .to_string(),
            from_domain: None,
            body_patterns: vec![
                r"instance:\s*(?P<host>\S+)".to_string(),
                r"alertname:\s*(?P<check_name>\S+)".to_string(),
                r"severity:\s*(?P<severity>\w+)".to_string(),
            ],
            severity_map: HashMap::new(),
            state_map: HashMap::new(),
            static_tags: vec![],
        },
        RuleParserConfig {
            name: "Zabbix".to_string(),
            source_tool: "zabbix".to_string(),
            subject_pattern: r"(?P<state>PROBLEM|OK):\s*(?P<check_name>.+)".to_string(),
            from_domain: None,
            body_patterns: vec![
                r"Host:\s*(?P<host>\S+)".to_string(),
                r"Severity:\s*(?P<severity>\w+)".to_string(),
            ],
            severity_map: HashMap::new(),
            state_map: HashMap::new(),
            static_tags: vec![],
        },
    ]
}
