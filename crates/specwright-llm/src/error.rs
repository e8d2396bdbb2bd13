//! Error types for specwright-llm
//!
//! Every variant maps to a stable string reason code so callers can branch
//! on cause without matching variants across crate versions.

use thiserror::Error;

/// LLM layer error type
#[derive(Debug, Error)]
pub enum Error {
    /// No route or provider settings available for the request
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// The provider's circuit breaker is open; the call was not attempted
    #[error("circuit open for provider: {0}")]
    CircuitOpen(String),

    /// Provider returned an error response
    #[error("api error: {0}")]
    Api(String),

    /// Transport-level failure
    #[error("network error: {0}")]
    Network(String),

    /// The call exceeded its timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// The provider returned a response with no textual content
    #[error("empty content in response")]
    EmptyContent,

    /// No repair candidate parsed as JSON
    #[error("unparsable content: {0}")]
    Unparsable(String),

    /// The response body did not match the wire contract
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Stable reason code for branching on cause
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotConfigured(_) => "not_configured",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Api(_) => "api_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::EmptyContent => "empty_content",
            Self::Unparsable(_) => "unparsable_content",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
