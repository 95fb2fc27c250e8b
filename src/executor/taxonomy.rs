//! Exception taxonomy.
//!
//! Collapses every failure into one of three kinds so callers can tell a
//! user's SQL mistake from an engine problem from a fault in the runtime:
//!
//! 1. vendor syntax/compile errors carrying a line/column → `Syntax`
//! 2. any other driver-originated error → `Engine`
//! 3. everything else (timeouts, contract violations, store failures) → `Internal`

use crate::error::RelayError;
use crate::statements::{Position, StatementRange};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static SYNTAX_POSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bline\s+(\d+)(?::|,?\s+(?:at\s+)?(?:position|column|char|col)\s+)(\d+)")
        .expect("syntax position pattern is valid")
});

/// Coarse failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Internal,
    Engine,
    Syntax,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Engine => "engine",
            Self::Syntax => "syntax",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure normalized across engines, attached to a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub kind: ErrorKind,
    pub message: String,
    /// Line/column of the failure, when the engine reported one.
    pub position: Option<Position>,
    /// The engine succeeded but persisting the result failed.
    pub upload_failed: bool,
    pub retryable: bool,
}

impl NormalizedError {
    /// Translates a statement-relative position into document coordinates.
    pub fn with_range(mut self, range: &StatementRange) -> Self {
        self.position = self.position.map(|p| range.map_position(p));
        self
    }

    /// An error that was not produced by the engine or the store.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            position: None,
            upload_failed: false,
            retryable: true,
        }
    }
}

impl fmt::Display for NormalizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => write!(f, "[{}] {} (at {})", self.kind, self.message, position),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Classifies an error. First matching rule wins.
pub fn normalize_error(error: &RelayError) -> NormalizedError {
    if let RelayError::Syntax {
        message,
        line,
        column,
    } = error
    {
        return NormalizedError {
            kind: ErrorKind::Syntax,
            message: message.clone(),
            position: Some(Position::new(*line, *column)),
            upload_failed: false,
            retryable: false,
        };
    }

    if error.is_driver_error() {
        let message = match error {
            RelayError::Engine(message) | RelayError::Connection(message) => message.clone(),
            other => other.to_string(),
        };
        return NormalizedError {
            kind: ErrorKind::Engine,
            message,
            position: None,
            upload_failed: false,
            retryable: matches!(error, RelayError::Connection(_)),
        };
    }

    match error {
        RelayError::Upload(_) => NormalizedError {
            upload_failed: true,
            ..NormalizedError::internal(error.to_string())
        },
        RelayError::Config(_) => NormalizedError {
            retryable: false,
            ..NormalizedError::internal(error.to_string())
        },
        _ => NormalizedError::internal(error.to_string()),
    }
}

/// Extracts a `(line, column)` pair from a vendor error message.
///
/// Recognizes `line 3:10`, `Line 3, column 10`, `line 3 at position 10` and
/// `line 3, char 10`.
pub fn parse_syntax_position(message: &str) -> Option<Position> {
    let caps = SYNTAX_POSITION_RE.captures(message)?;
    let line = caps[1].parse().ok()?;
    let column = caps[2].parse().ok()?;
    Some(Position::new(line, column))
}

/// Builds a `Syntax` error when the message carries a position, else `Engine`.
pub fn syntax_or_engine(message: impl Into<String>) -> RelayError {
    let message = message.into();
    match parse_syntax_position(&message) {
        Some(position) => RelayError::syntax(message, position.line, position.column),
        None => RelayError::engine(message),
    }
}
