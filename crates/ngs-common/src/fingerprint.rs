//! Fingerprint v2: stable identity for "the same alert" across time.
//!
//! The fingerprint is derived only from fields that describe what the
//! alert is about. Severity and firing/resolved state are never inputs,
//! so escalations and recoveries correlate to the same incident.

use crate::hash::sha256_hex_truncated;
use regex::Regex;
use std::sync::OnceLock;

/// Output length of the fingerprint in hex characters (128 bits).
pub const FINGERPRINT_LEN: usize = 32;

/// How much of the normalized signature participates in the fingerprint.
const SIGNATURE_PREFIX_CHARS: usize = 80;

fn guid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
    })
}

fn correlation_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(request[_-]?id|req[_-]?id|trace[_-]?id)[=:]\s*\S+").unwrap())
}

fn iso_ts_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?Z?").unwrap()
    })
}

fn slash_ts_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\s+\d{1,2}:\d{2}(:\d{2})?").unwrap()
    })
}

fn labelled_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(pid|port|count|duration|latency|uptime)[=:]\s*\d+").unwrap()
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

fn digit_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").unwrap())
}

fn status_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Severity and state words are transient: PROBLEM and RECOVERY mail
    // for the same condition must collide, as must WARNING vs CRITICAL.
    RE.get_or_init(|| {
        Regex::new(
            r"\b(problem|recovery|acknowledgement|resolved|firing|triggered|closed|clear(ed)?|ok|up|down|critical|warning|unknown|high|medium|low|info(rmational)?|major|minor|emergency|red|yellow|green)\b",
        )
        .unwrap()
    })
}

/// Human-readable signature with volatile tokens scrubbed: GUIDs,
/// correlation IDs, timestamps, labelled counters and IPv4 addresses are
/// replaced by placeholders so repeated occurrences of the same alert
/// produce the same signature.
pub fn normalized_signature(subject: &str, body: &str) -> String {
    let body_head: String = body.chars().take(500).collect();
    let mut content = format!("{subject} {body_head}").to_lowercase();

    content = guid_re().replace_all(&content, "<guid>").into_owned();
    content = correlation_id_re().replace_all(&content, "<id>").into_owned();
    content = iso_ts_re().replace_all(&content, "<ts>").into_owned();
    content = slash_ts_re().replace_all(&content, "<ts>").into_owned();
    content = labelled_number_re()
        .replace_all(&content, "$1=<n>")
        .into_owned();
    content = ipv4_re().replace_all(&content, "<ip>").into_owned();
    content = whitespace_re().replace_all(&content, " ").into_owned();

    content.trim().to_string()
}

/// Canonical host: lowercase with the trailing dot stripped. Numeric
/// suffixes after the last `-` are identity-bearing (web-01 vs web-02)
/// and are preserved.
pub fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

/// Canonical check identity: first non-empty of check-name or service,
/// lowercased, with digit runs collapsed so transient counters inside
/// check names do not split incidents.
pub fn canonical_check(check_name: Option<&str>, service: Option<&str>) -> String {
    let raw = check_name
        .filter(|s| !s.trim().is_empty())
        .or(service.filter(|s| !s.trim().is_empty()))
        .unwrap_or("");
    let lowered = raw.trim().to_lowercase();
    digit_run_re().replace_all(&lowered, "*").into_owned()
}

/// Signature prefix used by the fingerprint: the first 80 characters of
/// the normalized signature with remaining digit runs and severity/state
/// words replaced. A ticket number or an escalation in the subject must
/// not split an incident; neither may a PROBLEM -> RECOVERY flip.
fn signature_prefix(signature: &str) -> String {
    let scrubbed = status_token_re().replace_all(signature, "~");
    let scrubbed = digit_run_re().replace_all(&scrubbed, "#");
    scrubbed.chars().take(SIGNATURE_PREFIX_CHARS).collect()
}

/// Compute fingerprint v2: lowercase hex SHA-256 of the identity tuple,
/// truncated to 32 characters.
pub fn fingerprint_v2(
    source_tool: &str,
    environment: Option<&str>,
    host: Option<&str>,
    check_name: Option<&str>,
    service: Option<&str>,
    normalized_signature: &str,
) -> String {
    let check = canonical_check(check_name, service);
    // The signature prefix is the identity tail only when no check or
    // service identity exists. Problem and recovery mail describe the
    // same condition with different prose, so once host+check pin the
    // identity the free text must not split it.
    let prefix = if check.is_empty() {
        signature_prefix(normalized_signature)
    } else {
        String::new()
    };
    let components = [
        source_tool.trim().to_lowercase(),
        environment.unwrap_or("").trim().to_lowercase(),
        canonical_host(host.unwrap_or("")),
        check,
        prefix,
    ];
    sha256_hex_truncated(&components.join("|"), FINGERPRINT_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_scrubs_volatile_tokens() {
        let sig = normalized_signature(
            "** PROBLEM ** disk full",
            "request_id: abc-123 at 2024-01-15T12:00:00Z from 10.1.2.3 port: 8080",
        );
        assert!(sig.contains("<id>"), "{sig}");
        assert!(sig.contains("<ts>"), "{sig}");
        assert!(sig.contains("<ip>"), "{sig}");
        assert!(sig.contains("port=<n>"), "{sig}");
        assert!(!sig.contains("2024-01-15"));
    }

    #[test]
    fn signature_scrubs_guids() {
        let sig = normalized_signature(
            "alert",
            "incident 6f9619ff-8b86-4d01-b42d-00cf4fc964ff opened",
        );
        assert!(sig.contains("<guid>"), "{sig}");
    }

    #[test]
    fn fingerprint_ignores_severity_bearing_fields() {
        // Severity is not an input at all; identical identity tuples must
        // collide regardless of how the caller labelled the event.
        let sig = normalized_signature("Host down", "check failed");
        let a = fingerprint_v2("op5", Some("prod"), Some("web-01"), Some("http"), None, &sig);
        let b = fingerprint_v2("op5", Some("prod"), Some("web-01"), Some("http"), None, &sig);
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn fingerprint_collapses_numeric_correlation_ids() {
        // No check identity: the scrubbed signature prefix is the tail,
        // and a ticket counter inside it must not matter.
        let sig_a = normalized_signature("ticket #123 gateway check failed", "");
        let sig_b = normalized_signature("ticket #124 gateway check failed", "");
        let a = fingerprint_v2("op5", Some("prod"), Some("web-01"), None, None, &sig_a);
        let b = fingerprint_v2("op5", Some("prod"), Some("web-01"), None, None, &sig_b);
        assert_eq!(a, b);

        let sig_c = normalized_signature("ticket #123 disk check failed", "");
        let c = fingerprint_v2("op5", Some("prod"), Some("web-01"), None, None, &sig_c);
        assert_ne!(a, c, "different failure text still separates incidents");
    }

    #[test]
    fn firing_and_resolved_share_a_fingerprint() {
        let firing = normalized_signature(
            "** PROBLEM ** Host: web-01 Service: http State: CRITICAL",
            "Service: http\nState: CRITICAL",
        );
        let resolved = normalized_signature(
            "** RECOVERY ** Host: web-01 Service: http State: OK",
            "Service: http\nState: OK",
        );
        let a = fingerprint_v2("op5", None, Some("web-01"), None, Some("http"), &firing);
        let b = fingerprint_v2("op5", None, Some("web-01"), None, Some("http"), &resolved);
        assert_eq!(a, b);
    }

    #[test]
    fn severity_change_does_not_change_the_fingerprint() {
        let warn = normalized_signature(
            "** PROBLEM ** Host: web-01 Service: http State: WARNING",
            "State: WARNING",
        );
        let crit = normalized_signature(
            "** PROBLEM ** Host: web-01 Service: http State: CRITICAL",
            "State: CRITICAL",
        );
        let a = fingerprint_v2("op5", Some("prod"), Some("web-01"), None, Some("http"), &warn);
        let b = fingerprint_v2("op5", Some("prod"), Some("web-01"), None, Some("http"), &crit);
        assert_eq!(a, b);
    }

    #[test]
    fn different_hosts_differ() {
        let sig = normalized_signature("disk full", "");
        let a = fingerprint_v2("op5", Some("prod"), Some("web-01"), Some("disk"), None, &sig);
        let b = fingerprint_v2("op5", Some("prod"), Some("web-02"), Some("disk"), None, &sig);
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_host_strips_trailing_dot() {
        assert_eq!(canonical_host("Web-01.example.COM."), "web-01.example.com");
    }

    #[test]
    fn canonical_check_prefers_check_name() {
        assert_eq!(canonical_check(Some("HTTP-200"), Some("web")), "http-*");
        assert_eq!(canonical_check(None, Some("Web")), "web");
        assert_eq!(canonical_check(Some(""), Some("web")), "web");
        assert_eq!(canonical_check(None, None), "");
    }
}
