//! # Crossroad Common
//!
//! Common error types and logging configuration for the Crossroad Navigator
//! offline cache.
//!
//! ## Features
//!
//! - Unified error type with optional sources
//! - Logging configuration and setup
//! - Result and Option extension traits

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};

/// Unified error type for configuration loading and tooling.
#[derive(Error, Debug)]
pub enum CrossroadError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON input.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CrossroadError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error with source.
    pub fn cache_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for reports.
    pub fn category(&self) -> &'static str {
        match self {
            CrossroadError::Config { .. } => "config",
            CrossroadError::Network { .. } => "network",
            CrossroadError::Cache { .. } => "cache",
            CrossroadError::Io(_) => "io",
            CrossroadError::Json(_) => "json",
            CrossroadError::NotFound(_) => "not_found",
            CrossroadError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Result type alias for Crossroad operations.
pub type Result<T> = std::result::Result<T, CrossroadError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Wrap an error as a config error with context.
    fn config_context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn config_context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CrossroadError::config_with_source(message, e))
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CrossroadError::NotFound(resource.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_categories() {
        assert_eq!(CrossroadError::config("test").category(), "config");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "refused");
        assert_eq!(
            CrossroadError::network_with_source("test", io).category(),
            "network"
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(CrossroadError::cache_with_source("test", io).category(), "cache");
        assert_eq!(
            CrossroadError::InvalidArgument("x".into()).category(),
            "invalid_argument"
        );
    }

    #[test]
    fn test_config_context_keeps_source() {
        let parsed: std::result::Result<u32, _> = "nope".parse::<u32>();
        let err = parsed.config_context("version must be numeric").unwrap_err();

        assert_eq!(err.category(), "config");
        assert!(err.to_string().contains("version must be numeric"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_json_error_conversion() {
        let err: CrossroadError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.category(), "json");
    }

    #[test]
    fn test_option_ext() {
        let some: Option<i32> = Some(42);
        assert_eq!(some.ok_or_not_found("test").unwrap(), 42);

        let none: Option<i32> = None;
        assert!(matches!(
            none.ok_or_not_found("test"),
            Err(CrossroadError::NotFound(_))
        ));
    }
}
