use crate::models::{ChatMessage, ChatRequest, ChatResponse};
use crate::ratelimit::RateLimiter;
use crate::{LlmError, LlmExtraction, LlmExtractor, Result, DEFAULT_TIMEOUT_SECS};
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::sync::OnceLock;

const SYSTEM_PROMPT: &str = "You are an expert alert email parser. Extract structured data and respond only with valid JSON.";

const EXTRACTION_PROMPT: &str = r#"You are an alert email parser. Analyze this monitoring alert email and extract structured information.

EMAIL SUBJECT:
{subject}

EMAIL BODY:
{body}

Extract the fields and provide extraction rules for similar emails.

Respond ONLY with valid JSON in this exact format:
{
  "fields": {
    "host": "hostname or null if not found",
    "service": "service or check name or null",
    "severity": "severity word or null",
    "state": "state word or null",
    "summary": "brief description or null"
  },
  "source_name": "Name of the monitoring system",
  "rules": {
    "host":     {"source": "subject or body", "regex": "pattern with one capture group", "group": 1},
    "service":  {"source": "subject or body", "regex": "pattern with one capture group", "group": 1},
    "severity": {"source": "subject or body", "regex": "pattern", "group": 1, "map": {"WORD": "critical"}},
    "state":    {"source": "subject or body", "regex": "pattern", "group": 1, "map": {"WORD": "firing"}}
  },
  "confidence": 0.95
}

Important:
- In JSON, escape backslashes as \\ (e.g. "\\d+" for digits)
- If a field cannot be determined, set it to null and omit its rule
- The map converts extracted words to standard values
- For "state", map alert words to "firing" and recovery words to "resolved"
"#;

fn json_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[\s\S]*\}").unwrap())
}

/// OpenAI 兼容 Chat Provider。任何暴露 /chat/completions 的端点均可用。
pub struct ChatProvider {
    base_url: String,
    api_key: Option<String>,
    model: String,
    client: Client,
    limiter: RateLimiter,
}

impl ChatProvider {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout_secs: Option<u64>,
        rpm: usize,
        max_in_flight: usize,
    ) -> anyhow::Result<Self> {
        let timeout = timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            client,
            limiter: RateLimiter::new(rpm, max_in_flight),
        })
    }

    async fn call_api(&self, prompt: &str) -> Result<String> {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: Some(0.0),
            max_tokens: None,
        };

        tracing::debug!(
            model = %self.model,
            prompt_length = prompt.len(),
            "Calling LLM endpoint"
        );

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&req);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let resp = request.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(status, body = %body.chars().take(200).collect::<String>(), "LLM request failed");
            return Err(LlmError::ApiError { status, body });
        }

        let chat_resp: ChatResponse = resp.json().await?;

        tracing::debug!(usage = ?chat_resp.usage, "LLM response received");

        chat_resp
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

/// Recover the JSON object embedded in a completion. Models wrap their
/// answer in prose or code fences often enough that a plain parse is not
/// enough.
pub(crate) fn extract_json_object(answer: &str) -> Result<LlmExtraction> {
    let block = json_block_re()
        .find(answer)
        .ok_or_else(|| LlmError::MalformedResponse("no JSON object in response".to_string()))?;
    serde_json::from_str(block.as_str())
        .map_err(|e| LlmError::MalformedResponse(format!("JSON parse error: {e}")))
}

#[async_trait]
impl LlmExtractor for ChatProvider {
    fn provider(&self) -> &str {
        "chat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn extract(&self, subject: &str, body_excerpt: &str) -> Result<LlmExtraction> {
        let _permit = self.limiter.acquire().await;

        let body = if body_excerpt.trim().is_empty() {
            "(no body)"
        } else {
            body_excerpt
        };
        let prompt = EXTRACTION_PROMPT
            .replacen("{subject}", subject, 1)
            .replacen("{body}", body, 1);

        let answer = self.call_api(&prompt).await?;
        let extraction = extract_json_object(&answer)?;

        if !(0.0..=1.0).contains(&extraction.confidence) {
            return Err(LlmError::Validation(format!(
                "confidence {} outside [0,1]",
                extraction.confidence
            )));
        }

        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_recovered_from_prose() {
        let answer = r#"Sure! Here is the extraction:
{"fields": {"host": "db-01"}, "source_name": "Zabbix", "rules": {}, "confidence": 0.8}
Hope that helps."#;
        let ex = extract_json_object(answer).unwrap();
        assert_eq!(ex.fields.host.as_deref(), Some("db-01"));
        assert_eq!(ex.source_name, "Zabbix");
    }

    #[test]
    fn missing_json_is_an_error() {
        assert!(matches!(
            extract_json_object("no structured data here"),
            Err(LlmError::MalformedResponse(_))
        ));
    }
}
