//! Maintenance scope: which hosts/services/environments a window covers.
//!
//! Selectors of different keys combine with AND, values within a key
//! with OR. Hosts and services accept exact values, `*`/`?` globs and an
//! optional regex alternative. An empty scope matches nothing — a window
//! without scope never suppresses.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub host_regex: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub service_regex: Option<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The thing being matched: an alert event or an incident, reduced to
/// the fields scope selectors can see.
#[derive(Debug, Clone, Default)]
pub struct ScopeSubject<'a> {
    pub host: Option<&'a str>,
    pub service: Option<&'a str>,
    pub environment: Option<&'a str>,
    pub region: Option<&'a str>,
    pub tags: &'a [String],
}

impl Scope {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
            && self.host_regex.is_none()
            && self.services.is_empty()
            && self.service_regex.is_none()
            && self.environments.is_empty()
            && self.regions.is_empty()
            && self.tags.is_empty()
    }

    /// Match a subject against this scope. `Some(reason)` carries one
    /// entry per selector that matched, for the MaintenanceMatch record.
    pub fn matches(&self, subject: &ScopeSubject<'_>) -> Option<serde_json::Value> {
        if self.is_empty() {
            return None;
        }

        let mut reasons = Vec::new();

        if !self.hosts.is_empty() || self.host_regex.is_some() {
            let host = subject.host?;
            let value = match_value(&self.hosts, self.host_regex.as_deref(), host)?;
            reasons.push(json!({"field": "host", "pattern": value, "value": host}));
        }

        if !self.services.is_empty() || self.service_regex.is_some() {
            let service = subject.service?;
            let value = match_value(&self.services, self.service_regex.as_deref(), service)?;
            reasons.push(json!({"field": "service", "pattern": value, "value": service}));
        }

        if !self.environments.is_empty() {
            let env = subject.environment?;
            if !self.environments.iter().any(|e| e.eq_ignore_ascii_case(env)) {
                return None;
            }
            reasons.push(json!({"field": "environment", "pattern": self.environments, "value": env}));
        }

        if !self.regions.is_empty() {
            let region = subject.region?;
            if !self.regions.iter().any(|r| r.eq_ignore_ascii_case(region)) {
                return None;
            }
            reasons.push(json!({"field": "region", "pattern": self.regions, "value": region}));
        }

        if !self.tags.is_empty() {
            let hit = self
                .tags
                .iter()
                .find(|t| subject.tags.iter().any(|st| st.eq_ignore_ascii_case(t)))?;
            reasons.push(json!({"field": "tag", "pattern": self.tags, "value": hit}));
        }

        Some(json!({ "reasons": reasons }))
    }
}

/// OR across listed values (exact or glob), falling back to the regex
/// alternative. Returns the pattern that matched.
fn match_value(values: &[String], regex: Option<&str>, candidate: &str) -> Option<String> {
    let lowered = candidate.to_lowercase();
    for v in values {
        let pattern = v.to_lowercase();
        if pattern == lowered || glob_match::glob_match(&pattern, &lowered) {
            return Some(v.clone());
        }
    }
    if let Some(re_str) = regex {
        let re = RegexBuilder::new(re_str).case_insensitive(true).build().ok()?;
        if re.is_match(candidate) {
            return Some(re_str.to_string());
        }
    }
    None
}

/// Parse a selector list (`host=web-*;env=prod,staging`) into a Scope.
/// Glob-looking host/service values land in the list (globs are first
/// class there); comma splits multiple values for one key.
pub fn parse_selector_list(input: &str) -> Scope {
    let mut scope = Scope::default();
    for part in input.split(';') {
        let part = part.trim();
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let values: Vec<String> = value
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            continue;
        }
        match key.trim().to_lowercase().as_str() {
            "host" | "hosts" => scope.hosts.extend(values),
            "service" | "services" => scope.services.extend(values),
            "env" | "environment" => scope.environments.extend(values),
            "region" => scope.regions.extend(values),
            "tag" | "tags" => scope.tags.extend(values),
            _ => {}
        }
    }
    scope
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject<'a>(host: &'a str, service: &'a str) -> ScopeSubject<'a> {
        ScopeSubject {
            host: Some(host),
            service: Some(service),
            environment: Some("prod"),
            region: None,
            tags: &[],
        }
    }

    #[test]
    fn empty_scope_matches_nothing() {
        let scope = Scope::default();
        assert!(scope.matches(&subject("web-01", "http")).is_none());
    }

    #[test]
    fn glob_matches_host() {
        let scope = Scope {
            hosts: vec!["web-*".to_string()],
            ..Default::default()
        };
        let reason = scope.matches(&subject("web-01", "http")).unwrap();
        assert_eq!(reason["reasons"][0]["field"], "host");
        assert_eq!(reason["reasons"][0]["pattern"], "web-*");
        assert!(scope.matches(&subject("db-01", "http")).is_none());
    }

    #[test]
    fn question_mark_glob() {
        let scope = Scope {
            hosts: vec!["web-0?".to_string()],
            ..Default::default()
        };
        assert!(scope.matches(&subject("web-01", "x")).is_some());
        assert!(scope.matches(&subject("web-123", "x")).is_none());
    }

    #[test]
    fn selectors_combine_with_and() {
        let scope = Scope {
            hosts: vec!["web-*".to_string()],
            environments: vec!["staging".to_string()],
            ..Default::default()
        };
        // Host matches but environment does not.
        assert!(scope.matches(&subject("web-01", "http")).is_none());

        let scope = Scope {
            hosts: vec!["web-*".to_string()],
            environments: vec!["prod".to_string()],
            ..Default::default()
        };
        assert!(scope.matches(&subject("web-01", "http")).is_some());
    }

    #[test]
    fn values_within_a_key_combine_with_or() {
        let scope = Scope {
            hosts: vec!["db-01".to_string(), "web-01".to_string()],
            ..Default::default()
        };
        assert!(scope.matches(&subject("web-01", "http")).is_some());
        assert!(scope.matches(&subject("db-01", "http")).is_some());
        assert!(scope.matches(&subject("cache-01", "http")).is_none());
    }

    #[test]
    fn regex_alternative_for_services() {
        let scope = Scope {
            service_regex: Some(r"^http(s)?$".to_string()),
            ..Default::default()
        };
        assert!(scope.matches(&subject("any", "https")).is_some());
        assert!(scope.matches(&subject("any", "ftp")).is_none());
    }

    #[test]
    fn missing_subject_field_fails_that_selector() {
        let scope = Scope {
            hosts: vec!["web-*".to_string()],
            ..Default::default()
        };
        let s = ScopeSubject {
            host: None,
            service: Some("http"),
            environment: None,
            region: None,
            tags: &[],
        };
        assert!(scope.matches(&s).is_none());
    }

    #[test]
    fn tag_selector_matches_any_overlap() {
        let tags = vec!["team:db".to_string(), "tier:1".to_string()];
        let scope = Scope {
            tags: vec!["team:db".to_string()],
            ..Default::default()
        };
        let s = ScopeSubject {
            host: None,
            service: None,
            environment: None,
            region: None,
            tags: &tags,
        };
        assert!(scope.matches(&s).is_some());
    }

    #[test]
    fn selector_list_parses_keys_and_multi_values() {
        let scope = parse_selector_list("host=web-*; env=prod,staging; service=http");
        assert_eq!(scope.hosts, vec!["web-*"]);
        assert_eq!(scope.environments, vec!["prod", "staging"]);
        assert_eq!(scope.services, vec!["http"]);
        assert!(scope.tags.is_empty());
    }
}
