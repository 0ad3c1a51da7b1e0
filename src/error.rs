// src/error.rs

//! Unified error handling for the poller.
//!
//! Two families live here:
//!
//! - [`AppError`] covers setup and configuration failures. These are
//!   returned to the caller (the CLI, or whoever embeds the coordinator).
//! - [`FetchError`] classifies what went wrong while fetching a dataset.
//!   These never leave the coordinator's tick; they are logged and fed to
//!   the dataset's barrier as a failure.

use std::fmt;

use thiserror::Error;

/// Result type alias for application operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Why a dataset fetch failed.
///
/// Every variant counts as a failure for the dataset's barrier. The variants
/// only differ in how loudly the coordinator reports them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeout, connection refused, DNS, TLS...
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered but rejected the request
    #[error("protocol error{}: {message}", status_suffix(.status))]
    Protocol {
        status: Option<u16>,
        message: String,
    },

    /// Upstream answered with something we could not parse
    #[error("decoding error: {0}")]
    Decoding(String),

    /// Anything else, including a panicking fetch function
    #[error("unclassified error: {0}")]
    Unclassified(String),
}

impl FetchError {
    /// Create a transport error.
    pub fn transport(message: impl fmt::Display) -> Self {
        Self::Transport(message.to_string())
    }

    /// Create a protocol error with an optional HTTP status.
    pub fn protocol(status: Option<u16>, message: impl fmt::Display) -> Self {
        Self::Protocol {
            status,
            message: message.to_string(),
        }
    }

    /// Create a decoding error.
    pub fn decoding(message: impl fmt::Display) -> Self {
        Self::Decoding(message.to_string())
    }

    /// Create an unclassified error.
    pub fn unclassified(message: impl fmt::Display) -> Self {
        Self::Unclassified(message.to_string())
    }

    /// Short class name used in log lines.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Decoding(_) => "decoding",
            Self::Unclassified(_) => "unclassified",
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::decoding(&error)
        } else if error.is_status() {
            Self::protocol(error.status().map(|s| s.as_u16()), &error)
        } else if error.is_timeout() || error.is_connect() || error.is_request() {
            Self::transport(&error)
        } else if error.is_body() {
            Self::transport(&error)
        } else {
            Self::unclassified(&error)
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self::decoding(error)
    }
}
