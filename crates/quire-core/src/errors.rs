use std::time::Duration;

/// Failure reported by an LLM provider, either when opening a stream or
/// in-band as a `ProviderEvent::Error`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("model not supported by provider {provider}: {model}")]
    UnsupportedModel { provider: String, model: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Upstream { .. } | Self::Overloaded | Self::StreamInterrupted(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnsupportedModel { .. } => "unsupported_model",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream",
            Self::Overloaded => "overloaded",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Map an upstream HTTP status into the matching variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            _ => Self::Upstream { status, body },
        }
    }
}
