use ngs_parser::RuleParserConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub imap: Option<ImapSection>,
    #[serde(default)]
    pub graph: Option<GraphSection>,
    #[serde(default)]
    pub file: Option<FileSection>,
    #[serde(default)]
    pub parsers: Vec<RuleParserConfig>,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub quarantine: QuarantineConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// "imap", "graph" or "file".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_folders")]
    pub folders: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_parser_workers")]
    pub parser_workers: usize,
    #[serde(default = "default_parser_queue_capacity")]
    pub parser_queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            folders: default_folders(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            parser_workers: default_parser_workers(),
            parser_queue_capacity: default_parser_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImapSection {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphSection {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub user_email: String,
    #[serde(default = "default_graph_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSection {
    #[serde(default = "default_watch_path")]
    pub watch_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_dedup_window_minutes")]
    pub dedup_window_minutes: i64,
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: i64,
    #[serde(default = "default_flap_window_minutes")]
    pub flap_window_minutes: i64,
    #[serde(default = "default_resolve_quiet_period_seconds")]
    pub resolve_quiet_period_seconds: i64,
    #[serde(default = "default_auto_resolve_hours")]
    pub auto_resolve_hours: i64,
    /// Always true; present so a config that tries to turn it off fails
    /// loudly instead of silently racing.
    #[serde(default = "default_true")]
    pub single_open_per_fingerprint: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            dedup_window_minutes: default_dedup_window_minutes(),
            flap_threshold: default_flap_threshold(),
            flap_window_minutes: default_flap_window_minutes(),
            resolve_quiet_period_seconds: default_resolve_quiet_period_seconds(),
            auto_resolve_hours: default_auto_resolve_hours(),
            single_open_per_fingerprint: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub subject_prefixes: Vec<String>,
    #[serde(default = "default_maintenance_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_window_cache_ttl_secs")]
    pub window_cache_ttl_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            subject_prefixes: Vec::new(),
            tick_secs: default_maintenance_tick_secs(),
            window_cache_ttl_secs: default_window_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_rpm")]
    pub requests_per_minute: usize,
    #[serde(default = "default_llm_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_llm_body_excerpt_bytes")]
    pub body_excerpt_bytes: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            min_confidence: default_llm_min_confidence(),
            timeout_secs: default_llm_timeout_secs(),
            requests_per_minute: default_llm_rpm(),
            max_in_flight: default_llm_max_in_flight(),
            body_excerpt_bytes: default_llm_body_excerpt_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuarantineConfig {
    #[serde(default = "default_quarantine_confidence")]
    pub confidence_threshold: f64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_quarantine_confidence(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_dlq_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_dlq_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_dlq_base_secs(),
            backoff_cap_secs: default_dlq_cap_secs(),
            max_retries: default_dlq_max_retries(),
            sweep_interval_secs: default_dlq_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweeperConfig {
    #[serde(default = "default_auto_resolve_interval_secs")]
    pub auto_resolve_interval_secs: u64,
    #[serde(default = "default_idempotency_cleanup_secs")]
    pub idempotency_cleanup_interval_secs: u64,
    #[serde(default = "default_reprocess_interval_secs")]
    pub reprocess_interval_secs: u64,
    #[serde(default = "default_reprocess_stuck_minutes")]
    pub reprocess_stuck_minutes: i64,
    #[serde(default = "default_raw_email_retention_days")]
    pub raw_email_retention_days: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            auto_resolve_interval_secs: default_auto_resolve_interval_secs(),
            idempotency_cleanup_interval_secs: default_idempotency_cleanup_secs(),
            reprocess_interval_secs: default_reprocess_interval_secs(),
            reprocess_stuck_minutes: default_reprocess_stuck_minutes(),
            raw_email_retention_days: default_raw_email_retention_days(),
        }
    }
}

fn default_data_dir() -> String {
    "data".to_string()
}
fn default_provider() -> String {
    "imap".to_string()
}
fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    100
}
fn default_parser_workers() -> usize {
    4
}
fn default_parser_queue_capacity() -> usize {
    256
}
fn default_imap_port() -> u16 {
    993
}
fn default_backfill_days() -> i64 {
    7
}
fn default_graph_timeout_secs() -> u64 {
    30
}
fn default_watch_path() -> String {
    "./watch".to_string()
}
fn default_dedup_window_minutes() -> i64 {
    10
}
fn default_flap_threshold() -> i64 {
    5
}
fn default_flap_window_minutes() -> i64 {
    30
}
fn default_resolve_quiet_period_seconds() -> i64 {
    120
}
fn default_auto_resolve_hours() -> i64 {
    24
}
fn default_true() -> bool {
    true
}
fn default_maintenance_tick_secs() -> u64 {
    60
}
fn default_window_cache_ttl_secs() -> u64 {
    30
}
fn default_llm_endpoint() -> String {
    "http://localhost:8001/v1".to_string()
}
fn default_llm_model() -> String {
    "extraction".to_string()
}
fn default_llm_min_confidence() -> f64 {
    0.60
}
fn default_llm_timeout_secs() -> u64 {
    15
}
fn default_llm_rpm() -> usize {
    60
}
fn default_llm_max_in_flight() -> usize {
    4
}
fn default_llm_body_excerpt_bytes() -> usize {
    8 * 1024
}
fn default_quarantine_confidence() -> f64 {
    0.60
}
fn default_dlq_base_secs() -> u64 {
    30
}
fn default_dlq_cap_secs() -> u64 {
    3600
}
fn default_dlq_max_retries() -> i64 {
    3
}
fn default_dlq_sweep_secs() -> u64 {
    60
}
fn default_notify_timeout_secs() -> u64 {
    10
}
fn default_auto_resolve_interval_secs() -> u64 {
    300
}
fn default_idempotency_cleanup_secs() -> u64 {
    3600
}
fn default_reprocess_interval_secs() -> u64 {
    600
}
fn default_reprocess_stuck_minutes() -> i64 {
    10
}
fn default_raw_email_retention_days() -> i64 {
    90
}

impl WorkerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation: a bad config never replaces a running one.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.correlation.single_open_per_fingerprint {
            anyhow::bail!("correlation.single_open_per_fingerprint cannot be disabled");
        }
        if !(0.0..=1.0).contains(&self.llm.min_confidence) {
            anyhow::bail!("llm.min_confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.quarantine.confidence_threshold) {
            anyhow::bail!("quarantine.confidence_threshold must be within [0, 1]");
        }
        if self.dlq.backoff_base_secs == 0 || self.dlq.backoff_cap_secs < self.dlq.backoff_base_secs
        {
            anyhow::bail!("dlq backoff must satisfy 0 < base <= cap");
        }
        match self.ingest.provider.as_str() {
            "imap" => {
                if self.imap.is_none() {
                    anyhow::bail!("ingest.provider = imap requires an [imap] section");
                }
            }
            "graph" => {
                if self.graph.is_none() {
                    anyhow::bail!("ingest.provider = graph requires a [graph] section");
                }
            }
            "file" => {}
            other => anyhow::bail!("unknown ingest provider '{other}'"),
        }
        // Every parser rule must compile.
        ngs_parser::compile_parsers(self.effective_parsers())?;
        Ok(())
    }

    /// Configured parser rules, or the built-in set when none are given.
    pub fn effective_parsers(&self) -> Vec<RuleParserConfig> {
        if self.parsers.is_empty() {
            ngs_parser::default_parsers()
        } else {
            self.parsers.clone()
        }
    }

    /// The snapshot persisted into config_versions before activation.
    pub fn version_snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ingest: IngestConfig::default(),
            imap: None,
            graph: None,
            file: None,
            parsers: Vec::new(),
            correlation: CorrelationConfig::default(),
            maintenance: MaintenanceConfig::default(),
            llm: LlmConfig::default(),
            quarantine: QuarantineConfig::default(),
            dlq: DlqConfig::default(),
            notify: NotifyConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: WorkerConfig = toml::from_str("").unwrap();
        assert_eq!(config.ingest.batch_size, 100);
        assert_eq!(config.correlation.flap_threshold, 5);
        assert_eq!(config.correlation.resolve_quiet_period_seconds, 120);
        assert_eq!(config.llm.timeout_secs, 15);
        assert_eq!(config.dlq.backoff_base_secs, 30);
        assert!(config.correlation.single_open_per_fingerprint);
    }

    #[test]
    fn disabling_single_open_is_rejected() {
        let config: WorkerConfig = toml::from_str(
            "[correlation]\nsingle_open_per_fingerprint = false\n[ingest]\nprovider = \"file\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_sections_are_required() {
        let config: WorkerConfig =
            toml::from_str("[ingest]\nprovider = \"imap\"\n").unwrap();
        assert!(config.validate().is_err());

        let config: WorkerConfig =
            toml::from_str("[ingest]\nprovider = \"file\"\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_parser_rule_fails_validation() {
        let toml_str = r#"
[ingest]
provider = "file"

[[parsers]]
name = "broken"
source_tool = "broken"
subject_pattern = "(unclosed"
"#;
        let config: WorkerConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn snapshot_round_trips() {
        let config = WorkerConfig::default();
        let snapshot = config.version_snapshot();
        assert!(snapshot["correlation"]["flap_threshold"].is_number());
    }
}
