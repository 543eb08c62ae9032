use crate::{LlmError, LlmExtraction, LlmExtractor, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scripted extractor for tests: answers from a fixed queue and counts
/// calls, so pipelines can assert the LLM was consulted exactly once per
/// format.
pub struct ScriptedExtractor {
    responses: Mutex<Vec<Result<LlmExtraction>>>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(responses: Vec<Result<LlmExtraction>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmExtractor for ScriptedExtractor {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn extract(&self, _subject: &str, _body_excerpt: &str) -> Result<LlmExtraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        responses.remove(0)
    }
}
