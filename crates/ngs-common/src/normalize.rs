//! Token normalization shared by the rule parsers and LLM validation.

use crate::types::{AlertState, Severity};

/// Map a source-native severity token onto the core enum. Unknown tokens
/// become `medium` so an unmapped source never drops below triage.
pub fn severity_token(token: &str) -> Severity {
    match token.trim().to_lowercase().as_str() {
        "critical" | "crit" | "emergency" | "alert" | "red" | "p1" | "sev1" => Severity::Critical,
        "high" | "major" | "error" | "excessive" | "firing" | "p2" | "sev2" => Severity::High,
        "warning" | "warn" | "medium" | "yellow" | "p3" | "sev3" => Severity::Medium,
        "minor" | "low" | "p4" | "sev4" => Severity::Low,
        "info" | "informational" | "ok" | "resolved" | "recovery" | "green" => Severity::Info,
        _ => Severity::Medium,
    }
}

/// True when the token names a severity level this pipeline understands,
/// natively or via the token map. Used to validate LLM output.
pub fn is_known_severity_token(token: &str) -> bool {
    matches!(
        token.trim().to_lowercase().as_str(),
        "critical"
            | "crit"
            | "emergency"
            | "alert"
            | "red"
            | "p1"
            | "sev1"
            | "high"
            | "major"
            | "error"
            | "excessive"
            | "firing"
            | "p2"
            | "sev2"
            | "warning"
            | "warn"
            | "medium"
            | "yellow"
            | "p3"
            | "sev3"
            | "minor"
            | "low"
            | "p4"
            | "sev4"
            | "info"
            | "informational"
            | "ok"
            | "resolved"
            | "recovery"
            | "green"
    )
}

/// Map a source-native state token onto firing/resolved/unknown.
/// Explicit OK/RECOVERY always means resolved.
pub fn state_token(token: &str) -> AlertState {
    match token.trim().to_lowercase().as_str() {
        "ok" | "resolved" | "recovery" | "green" | "closed" | "clear" | "up" => {
            AlertState::Resolved
        }
        "problem" | "critical" | "warning" | "firing" | "red" | "yellow" | "triggered" | "open"
        | "down" | "alert" => AlertState::Firing,
        _ => AlertState::Unknown,
    }
}

/// Canonical host form: lowercase, trailing dot stripped.
pub fn host(host: &str) -> String {
    crate::fingerprint::canonical_host(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_tokens_cover_vendor_vocabularies() {
        assert_eq!(severity_token("CRITICAL"), Severity::Critical);
        assert_eq!(severity_token("RED"), Severity::Critical);
        assert_eq!(severity_token("P1"), Severity::Critical);
        assert_eq!(severity_token("Major"), Severity::High);
        assert_eq!(severity_token("warning"), Severity::Medium);
        assert_eq!(severity_token("minor"), Severity::Low);
        assert_eq!(severity_token("OK"), Severity::Info);
    }

    #[test]
    fn unknown_severity_defaults_to_medium() {
        assert_eq!(severity_token("purple"), Severity::Medium);
        assert!(!is_known_severity_token("purple"));
        assert!(is_known_severity_token("SEV2"));
    }

    #[test]
    fn explicit_ok_and_recovery_mean_resolved() {
        assert_eq!(state_token("OK"), AlertState::Resolved);
        assert_eq!(state_token("RECOVERY"), AlertState::Resolved);
        assert_eq!(state_token("PROBLEM"), AlertState::Firing);
        assert_eq!(state_token("???"), AlertState::Unknown);
    }
}
