//! Error types shared across review-forge subsystems.
//!
//! Subsystems with a narrow surface (queue, store, rate limiter, GitHub)
//! define their own error enums next to the code that raises them. The
//! text-generation error lives here because it crosses the LLM client, the
//! stage executor and the pipeline runner.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for service '{0}'")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Context length exceeded: {message}")]
    ContextLengthExceeded { message: String },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether a later attempt of the same call may succeed.
    ///
    /// Network failures, timeouts, throttling and server-side errors are
    /// transient. Malformed responses, client errors and oversized prompts
    /// will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(_) | LlmError::Timeout(_) | LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code == 408 || *code == 429 || *code >= 500,
            LlmError::MissingApiKey(_)
            | LlmError::ParseError(_)
            | LlmError::ContextLengthExceeded { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::RequestFailed("connection reset".to_string()).is_transient());
        assert!(LlmError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(LlmError::RateLimited("slow down".to_string()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(LlmError::ApiError {
            code: 429,
            message: "quota".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(!LlmError::ParseError("no choices".to_string()).is_transient());
        assert!(!LlmError::MissingApiKey("openai".to_string()).is_transient());
        assert!(!LlmError::ContextLengthExceeded {
            message: "128000 tokens".to_string()
        }
        .is_transient());
        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = LlmError::ApiError {
            code: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "API error (502): bad gateway");

        let err = LlmError::MissingApiKey("anthropic".to_string());
        assert!(err.to_string().contains("anthropic"));
    }
}
