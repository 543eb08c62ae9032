/// Errors raised by mail providers.
///
/// Connection/protocol/throttling failures are transient and feed the
/// poll backoff; malformed messages are data errors handled per message.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Could not reach or talk to the mail source.
    #[error("Provider: connection failed: {0}")]
    Connection(String),

    /// The source rejected our credentials.
    #[error("Provider: authentication failed: {0}")]
    Auth(String),

    /// The source answered with something unexpected.
    #[error("Provider: protocol error: {0}")]
    Protocol(String),

    /// Local I/O (drop-folder provider).
    #[error("Provider: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport (Graph provider).
    #[error("Provider: HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single message could not be decoded.
    #[error("Provider: malformed message: {0}")]
    MalformedMessage(String),
}

impl ProviderError {
    /// Whether the poll loop should back off and retry (true), or the
    /// condition needs operator attention per message (false).
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::MalformedMessage(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
