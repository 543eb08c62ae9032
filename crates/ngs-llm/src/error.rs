/// Errors from the LLM extraction path.
///
/// Transport and protocol failures are transient (retry / DLQ);
/// validation failures are data errors and route to quarantine.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP transport failure (includes client-side timeouts).
    #[error("LLM: HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("LLM: API error: status={status}, body={body}")]
    ApiError { status: u16, body: String },

    /// The response carried no usable completion.
    #[error("LLM: empty response")]
    EmptyResponse,

    /// No JSON object could be recovered from the completion text.
    #[error("LLM: malformed response: {0}")]
    MalformedResponse(String),

    /// The recovered object failed schema or self-consistency validation.
    #[error("LLM: validation failed: {0}")]
    Validation(String),
}

impl LlmError {
    /// True for failures worth retrying; validation failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Http(_) | LlmError::ApiError { .. })
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
