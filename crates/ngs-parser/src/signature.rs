//! Format signature: identity for the *shape* of an email.
//!
//! Distinct from the alert fingerprint — the signature clusters novel
//! email formats so the LLM is consulted at most once per format. Two
//! alerts about different hosts from the same monitoring system share a
//! signature but not a fingerprint.

use ngs_common::hash::sha256_hex;
use regex::Regex;
use std::sync::OnceLock;

/// Fixed marker vocabulary scanned in the body (first 2 KB, lowercased).
const BODY_MARKERS: &[&str] = &[
    "severity", "status", "alert", "host:", "service:", "check", "critical", "warning",
    "problem", "recovery", "resolved", "impact", "duration", "opened", "closed",
];

/// Signature components, persisted alongside the cache row for
/// explainability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSignature {
    pub from_domain: String,
    pub subject_prefix: String,
    pub body_markers: Vec<String>,
}

impl FormatSignature {
    /// 64-hex SHA-256 over the signature tuple.
    pub fn hash(&self) -> String {
        let tuple = format!(
            "{}|{}|{}",
            self.from_domain,
            self.subject_prefix,
            self.body_markers.join(",")
        );
        sha256_hex(&tuple)
    }
}

fn from_domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([\w.-]+)").unwrap())
}

fn bracket_num_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\d+\]").unwrap())
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap())
}

fn digit_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

/// Compute the format signature of an email.
pub fn compute(subject: &str, from_address: &str, body: &str) -> FormatSignature {
    let from_domain = from_domain_re()
        .captures(from_address)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();

    let subject_prefix = {
        let normalized = bracket_num_re().replace_all(subject, "[*]");
        let normalized = iso_date_re().replace_all(&normalized, "*DATE*");
        let normalized = digit_run_re().replace_all(&normalized, "*N*");
        normalized.chars().take(50).collect::<String>().trim().to_string()
    };

    let body_head: String = body.chars().take(2000).collect::<String>().to_lowercase();
    let mut body_markers: Vec<String> = BODY_MARKERS
        .iter()
        .filter(|m| body_head.contains(*m))
        .map(|m| m.to_string())
        .collect();
    body_markers.sort();

    FormatSignature {
        from_domain,
        subject_prefix,
        body_markers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_format_same_hash_across_instances() {
        let a = compute(
            "Splunk Alert: disk usage on web-01 [4711]",
            "alerts@splunk.example.com",
            "severity=high host=web-01",
        );
        let b = compute(
            "Splunk Alert: disk usage on web-02 [9832]",
            "alerts@splunk.example.com",
            "severity=low host=web-02",
        );
        assert_eq!(a.subject_prefix, b.subject_prefix);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn different_sender_domain_changes_hash() {
        let a = compute("Alert", "x@one.example.com", "");
        let b = compute("Alert", "x@two.example.com", "");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn dates_and_numbers_are_normalized() {
        let sig = compute(
            "Maintenance 2024-03-01 window 42",
            "ops@example.com",
            "",
        );
        assert!(sig.subject_prefix.contains("*DATE*"));
        assert!(sig.subject_prefix.contains("*N*"));
        assert!(!sig.subject_prefix.contains("42"));
    }

    #[test]
    fn body_markers_are_sorted_subset_of_vocabulary() {
        let sig = compute(
            "x",
            "x@example.com",
            "Host: a\nSeverity: critical\nstatus closed",
        );
        let mut sorted = sig.body_markers.clone();
        sorted.sort();
        assert_eq!(sig.body_markers, sorted);
        assert!(sig.body_markers.contains(&"severity".to_string()));
        assert!(sig.body_markers.contains(&"critical".to_string()));
    }

    #[test]
    fn hash_is_64_hex() {
        let sig = compute("a", "b@c.d", "e");
        assert_eq!(sig.hash().len(), 64);
    }
}
