//! Error types for the Tollgate service.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Invalid rules or settings, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be loaded
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// No usable client address for a request
    #[error("Address resolution error: {0}")]
    AddressResolution(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
