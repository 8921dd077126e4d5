//! Error types for vela-ai

use thiserror::Error;

/// Result type alias using vela-ai Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors a model client can surface while opening or reading a stream
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a local resource (e.g. a replay file) failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Invalid API key
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// The connection dropped or the stream could not be decoded
    #[error("Stream error: {0}")]
    Stream(String),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is worth resubmitting the same request for.
    ///
    /// Authentication and configuration problems never heal on their own,
    /// so automatic retry escalates those to the user instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::Stream(_) | Error::Io(_) => true,
            Error::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                if et.contains("authentication") || et.contains("permission") {
                    return false;
                }
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || et.contains("server")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
                    || msg.contains("timeout")
                    || msg.contains("529")
                    || msg.contains("503")
            }
            _ => false,
        }
    }
}
