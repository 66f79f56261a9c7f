//! Error types for quota-pacer.
//!
//! Failures of the tasks themselves never appear here: a scheduled task's
//! output is handed back to its caller as-is.

use thiserror::Error;

/// Main error type for limiter setup and configuration.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Invalid limiter or application configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was requested by a name that is not configured
    #[error("Unknown limiter: {0}")]
    UnknownLimiter(String),

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

impl ThrottleError {
    /// Prefix a configuration error with the limiter it came from.
    pub(crate) fn for_limiter(self, name: &str) -> Self {
        match self {
            ThrottleError::Config(reason) => {
                ThrottleError::Config(format!("limiter '{}': {}", name, reason))
            }
            other => other,
        }
    }
}

/// Result type alias for quota-pacer operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
