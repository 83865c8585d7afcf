//! Error types for intempt-core

use std::fmt;

use thiserror::Error;

/// Whether a failed delivery may be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Timeout, connectivity loss or a 5xx response
    Transient,
    /// 4xx response: bad credentials or a malformed payload
    Permanent,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::Transient => f.write_str("transient"),
            NetworkErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Main error type for the intempt-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or empty input to a public operation
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid credentials/configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Location or bluetooth permission denied or not yet granted
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Delivery to the collection endpoint failed
    #[error("{kind} network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Durable storage unavailable
    #[error("storage error: {0}")]
    Storage(String),

    /// Event dropped from a full queue before it could be sent
    #[error("event evicted from full queue ({collection})")]
    Evicted { collection: String },

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn transient(message: impl Into<String>) -> Self {
        Error::Network {
            kind: NetworkErrorKind::Transient,
            message: message.into(),
        }
    }

    pub(crate) fn permanent(message: impl Into<String>) -> Self {
        Error::Network {
            kind: NetworkErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// True for network failures that were eligible for retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network {
                kind: NetworkErrorKind::Transient,
                ..
            }
        )
    }
}

/// Result type alias for intempt-core
pub type Result<T> = std::result::Result<T, Error>;
