//! Error types for the rewrite-proxy application.
//!
//! This module defines all error types used throughout the application,
//! covering configuration loading as well as the per-request error kinds
//! surfaced to the error hooks.

use std::time::Duration;

use thiserror::Error;

/// Boxed error type accepted from host mappers and middleware hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the rewrite-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed. Also raised when a resolved
    /// `HostConfig` violates the origin-triple invariants.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// The host mapper rejected the request.
    ///
    /// Displays as the mapper's own message so error hooks observe it
    /// unchanged.
    #[error("{0}")]
    HostMapper(BoxError),

    /// The request middleware returned an error.
    #[error("{0}")]
    RequestMiddleware(BoxError),

    /// The response middleware returned an error.
    #[error("{0}")]
    ResponseMiddleware(BoxError),

    /// Upstream I/O failed.
    #[error("Upstream request failed: {message}")]
    Transport { message: String },

    /// Upstream did not answer within the configured deadline.
    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    /// A buffered body exceeded the configured limit.
    #[error("Body of {size} bytes exceeds the configured limit of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    /// The client went away before a response could be produced.
    #[error("Request cancelled")]
    Cancelled,

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProxyError::ConfigNotFound {
            path: "/etc/proxy.yaml".to_string(),
        };
        assert!(err.to_string().contains("/etc/proxy.yaml"));

        let err = ProxyError::config_parse("invalid yaml");
        assert!(err.to_string().contains("invalid yaml"));

        let err = ProxyError::transport("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_hook_errors_display_verbatim() {
        // Hooks assert on the exact message the mapper or middleware produced.
        let err = ProxyError::HostMapper("some host mapper error occurred".into());
        assert_eq!(err.to_string(), "some host mapper error occurred");

        let err = ProxyError::ResponseMiddleware("some response middleware error".into());
        assert_eq!(err.to_string(), "some response middleware error");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }
}
