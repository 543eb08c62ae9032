use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One step less severe, used by maintenance downgrade mode.
    /// `info` has no lower step and stays `info`.
    pub fn one_step_down(self) -> Severity {
        match self {
            Severity::Critical => Severity::High,
            Severity::High => Severity::Medium,
            Severity::Medium => Severity::Low,
            Severity::Low | Severity::Info => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Alert lifecycle state as reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Firing,
    Resolved,
    Unknown,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Firing => "firing",
            AlertState::Resolved => "resolved",
            AlertState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "firing" => Ok(AlertState::Firing),
            "resolved" => Ok(AlertState::Resolved),
            "unknown" => Ok(AlertState::Unknown),
            _ => Err(format!("unknown alert state: {s}")),
        }
    }
}

/// Incident status. At most one incident per fingerprint may be in a
/// live status (open / acknowledged / resolving) at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolving,
    Resolved,
    Suppressed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolving => "resolving",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Suppressed => "suppressed",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            IncidentStatus::Open | IncidentStatus::Acknowledged | IncidentStatus::Resolving
        )
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(IncidentStatus::Open),
            "acknowledged" => Ok(IncidentStatus::Acknowledged),
            "resolving" => Ok(IncidentStatus::Resolving),
            "resolved" => Ok(IncidentStatus::Resolved),
            "suppressed" => Ok(IncidentStatus::Suppressed),
            _ => Err(format!("unknown incident status: {s}")),
        }
    }
}

/// Parse lifecycle of a stored raw email. Advances monotonically
/// pending -> {parsed, failed, quarantined}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Pending,
    Parsed,
    Failed,
    Quarantined,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Parsed => "parsed",
            ParseStatus::Failed => "failed",
            ParseStatus::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ParseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ParseStatus::Pending),
            "parsed" => Ok(ParseStatus::Parsed),
            "failed" => Ok(ParseStatus::Failed),
            "quarantined" => Ok(ParseStatus::Quarantined),
            _ => Err(format!("unknown parse status: {s}")),
        }
    }
}

/// How a maintenance window suppresses matching alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuppressMode {
    Mute,
    Downgrade,
    Digest,
}

impl SuppressMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressMode::Mute => "mute",
            SuppressMode::Downgrade => "downgrade",
            SuppressMode::Digest => "digest",
        }
    }
}

impl std::fmt::Display for SuppressMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SuppressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mute" => Ok(SuppressMode::Mute),
            "downgrade" => Ok(SuppressMode::Downgrade),
            "digest" => Ok(SuppressMode::Digest),
            _ => Err(format!("unknown suppress mode: {s}")),
        }
    }
}

/// Where a maintenance window was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowSource {
    Email,
    Manual,
    Graph,
}

impl WindowSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSource::Email => "email",
            WindowSource::Manual => "manual",
            WindowSource::Graph => "graph",
        }
    }
}

impl std::fmt::Display for WindowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized alert occurrence, produced by the parser and consumed
/// by the maintenance matcher and the correlator. Never mutated after
/// the suppression pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub raw_email_id: Option<String>,
    pub source_tool: String,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub check_name: Option<String>,
    pub service: Option<String>,
    pub severity: Severity,
    pub state: AlertState,
    pub occurred_at: DateTime<Utc>,
    pub normalized_signature: String,
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub tags: Vec<String>,
    pub is_suppressed: bool,
    pub suppression_reason: Option<String>,
}

impl NormalizedEvent {
    /// Effective severity for routing. Under a downgrade window the
    /// payload carries `original_severity` and this field is already
    /// one step down.
    pub fn check_or_service(&self) -> Option<&str> {
        self.check_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.service.as_deref().filter(|s| !s.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_enum_order() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_round_trips_through_str() {
        for s in ["info", "low", "medium", "high", "critical"] {
            let sev: Severity = s.parse().unwrap();
            assert_eq!(sev.to_string(), s);
        }
        assert!("warning".parse::<Severity>().is_err());
    }

    #[test]
    fn one_step_down_saturates_at_info() {
        assert_eq!(Severity::Critical.one_step_down(), Severity::High);
        assert_eq!(Severity::Info.one_step_down(), Severity::Info);
    }

    #[test]
    fn live_statuses() {
        assert!(IncidentStatus::Open.is_live());
        assert!(IncidentStatus::Acknowledged.is_live());
        assert!(IncidentStatus::Resolving.is_live());
        assert!(!IncidentStatus::Resolved.is_live());
        assert!(!IncidentStatus::Suppressed.is_live());
    }
}
