//! LLM extraction client for novel alert formats.
//!
//! The language model is an unreliable external collaborator: every
//! response is schema-validated and self-consistency-checked against the
//! source text before anything downstream may trust it. The model only
//! proposes extraction rules; it never executes anything.

pub mod error;
pub mod models;
pub mod provider;
pub mod ratelimit;
pub mod scripted;
pub mod validate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use error::{LlmError, Result};
pub use provider::ChatProvider;
pub use scripted::ScriptedExtractor;

/// Default request timeout (seconds).
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Default bound on the body excerpt sent to the model (bytes).
pub const DEFAULT_BODY_EXCERPT_BYTES: usize = 8 * 1024;

/// Where an extraction rule reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Subject,
    Body,
}

/// One proposed extraction rule for a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub source: RuleSource,
    pub regex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
    /// Token normalization map, e.g. {"RED": "critical"}.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

/// Field values the model extracted from one email.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Complete model response: field values, a confidence estimate and the
/// reusable rules that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmExtraction {
    #[serde(alias = "extracted")]
    pub fields: ExtractedFields,
    #[serde(default = "default_source_name")]
    pub source_name: String,
    pub confidence: f64,
    #[serde(default, alias = "extraction_rules")]
    pub rules: HashMap<String, ExtractionRule>,
}

fn default_source_name() -> String {
    "Unknown".to_string()
}

/// Capability boundary toward the language model.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    /// Provider name (for extraction audit logs).
    fn provider(&self) -> &str;

    /// Model name.
    fn model_name(&self) -> &str;

    /// Extract structured fields and candidate rules from one email.
    /// `body_excerpt` is already bounded by the caller.
    async fn extract(&self, subject: &str, body_excerpt: &str) -> Result<LlmExtraction>;
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 sequence.
pub fn utf8_excerpt(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
