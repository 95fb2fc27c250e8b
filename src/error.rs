//! Error types for db-relay.
//!
//! Defines the main error enum used throughout the runtime. Driver errors
//! (sqlx, reqwest, object_store) are converted into this enum at the adapter
//! and store boundaries; the executor's taxonomy layer then classifies it.

use thiserror::Error;

/// Main error type for db-relay operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Vendor syntax/compile error carrying a position relative to the statement.
    #[error("Syntax error at line {line}, column {column}: {message}")]
    Syntax {
        message: String,
        line: usize,
        column: usize,
    },

    /// Any other error raised by an engine or its driver.
    #[error("Engine error: {0}")]
    Engine(String),

    /// Driver-level connectivity failure (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Result store failure while persisting rows.
    #[error("Upload error: {0}")]
    Upload(String),

    /// Result store failure while reading a stored result.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors (unknown engine family, malformed connection string, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller-enforced deadline elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Byte stream ended in the middle of a UTF-8 sequence or was not UTF-8.
    #[error("Invalid UTF-8 stream: {0}")]
    Utf8(String),

    /// Attempted state transition is not allowed.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Internal errors (contract violations, unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Creates a syntax error with a statement-relative position.
    pub fn syntax(msg: impl Into<String>, line: usize, column: usize) -> Self {
        Self::Syntax {
            message: msg.into(),
            line,
            column,
        }
    }

    /// Creates an engine error with the given message.
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates an upload error with the given message.
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    /// Creates a storage error with the given message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a timeout error with the given message.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a UTF-8 stream error with the given message.
    pub fn utf8(msg: impl Into<String>) -> Self {
        Self::Utf8(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if the error originated in an engine driver.
    pub fn is_driver_error(&self) -> bool {
        matches!(
            self,
            Self::Syntax { .. } | Self::Engine(_) | Self::Connection(_)
        )
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "Syntax Error",
            Self::Engine(_) => "Engine Error",
            Self::Connection(_) => "Connection Error",
            Self::Upload(_) => "Upload Error",
            Self::Storage(_) => "Storage Error",
            Self::Config(_) => "Configuration Error",
            Self::Timeout(_) => "Timeout",
            Self::Utf8(_) => "Encoding Error",
            Self::InvalidTransition { .. } => "State Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
