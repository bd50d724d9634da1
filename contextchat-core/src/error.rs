//! Error types for contextchat-core.

use thiserror::Error;

use crate::session::Generation;

/// Result type alias using contextchat-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the content-to-context pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// External markup converter failed (non-zero exit, missing binary, timeout)
    #[error("Content conversion failed: {message}")]
    Conversion {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No provider credentials were detected when the backend was selected
    #[error("No LLM backend configured: set ANTHROPIC_API_KEY, OPENAI_API_KEY or GOOGLE_API_KEY")]
    NoBackend,

    /// Chat operation attempted while no backend is usable
    #[error("LLM backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Network failure after a streamed reply had started
    #[error("Response stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Result produced under a superseded generation
    #[error("Stale result for generation {generation} (current is {current})")]
    StaleResult {
        generation: Generation,
        current: Generation,
    },

    /// User input arrived before a context was loaded
    #[error("Session is not ready for chat (state: {state})")]
    ContextNotReady { state: String },

    /// A reply is already streaming for the current conversation
    #[error("A response is already in progress")]
    Busy,

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Markup retrieval from the viewer failed
    #[error("Markup retrieval failed: {0}")]
    Markup(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session actor has shut down
    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Create a conversion error.
    pub fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
            source: None,
        }
    }

    /// Create a conversion error with source.
    pub fn conversion_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Conversion {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a not-ready error for the given state.
    pub fn not_ready(state: impl std::fmt::Display) -> Self {
        Self::ContextNotReady {
            state: state.to_string(),
        }
    }

    /// Whether this error means no backend can serve chat requests.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::NoBackend | Self::BackendUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "pandoc");
        let err = Error::conversion_with_source("failed to spawn converter", io);

        assert_eq!(
            err.to_string(),
            "Content conversion failed: failed to spawn converter"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_backend_unavailable_classification() {
        assert!(Error::NoBackend.is_backend_unavailable());
        assert!(Error::BackendUnavailable("no key".into()).is_backend_unavailable());
        assert!(!Error::Busy.is_backend_unavailable());
        assert!(!Error::timeout(10).is_backend_unavailable());
    }
}
