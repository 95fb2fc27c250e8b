//! Query and statement execution state machines.
//!
//! A query owns an ordered list of statement executions split from its text.
//! Transitions are validated; terminal states are sticky.

pub mod runner;

pub use runner::{ExecutionListener, NoopListener, QueryRunner, RunnerSettings};

use crate::error::{RelayError, Result};
use crate::executor::NormalizedError;
use crate::statements::{split_statements, StatementRange};
use crate::store::ResultStoreEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle of a whole query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Initialized,
    Delivered,
    Running,
    Done,
    Error,
    Cancel,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Delivered => "DELIVERED",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Cancel => "CANCEL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancel)
    }

    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Initialized, Delivered)
                | (Delivered, Running)
                | (Running, Done)
                | (Initialized | Delivered | Running, Error | Cancel)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementState {
    Initialized,
    Running,
    Uploading,
    Done,
    Error,
    Cancel,
}

impl StatementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Running => "RUNNING",
            Self::Uploading => "UPLOADING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
            Self::Cancel => "CANCEL",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancel)
    }

    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use StatementState::*;
        matches!(
            (self, next),
            (Initialized, Running)
                | (Running, Uploading)
                | (Uploading, Done)
                | (Running | Uploading, Error | Cancel)
        )
    }
}

impl fmt::Display for StatementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a statement ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementOutcome {
    Done,
    Error,
    Cancel,
    /// Never started because an earlier statement failed or was cancelled.
    Skipped,
    /// Still in progress.
    Pending,
}

/// One statement of a query.
#[derive(Debug, Clone, Serialize)]
pub struct StatementExecution {
    pub index: usize,
    pub range: StatementRange,
    pub state: StatementState,
    pub progress: u8,
    pub tracking_url: Option<String>,
    pub result: Option<ResultStoreEntry>,
    pub row_count: u64,
    /// Rows were dropped because of the row or byte cap.
    pub truncated: bool,
    pub error: Option<NormalizedError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatementExecution {
    fn new(index: usize, range: StatementRange) -> Self {
        Self {
            index,
            range,
            state: StatementState::Initialized,
            progress: 0,
            tracking_url: None,
            result: None,
            row_count: 0,
            truncated: false,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves to `next`, recording timestamps.
    pub fn transition(&mut self, next: StatementState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Statement {}: {} -> {}", self.index, self.state, next);
        if next == StatementState::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Marks the statement failed with an error already mapped to document coordinates.
    pub fn fail(&mut self, error: NormalizedError) -> Result<()> {
        self.transition(StatementState::Error)?;
        self.error = Some(error);
        Ok(())
    }

    pub fn outcome(&self) -> StatementOutcome {
        match self.state {
            StatementState::Done => StatementOutcome::Done,
            StatementState::Error => StatementOutcome::Error,
            StatementState::Cancel => StatementOutcome::Cancel,
            StatementState::Initialized => StatementOutcome::Skipped,
            StatementState::Running | StatementState::Uploading => StatementOutcome::Pending,
        }
    }
}

/// One query: the text submitted by a user and its statements.
#[derive(Debug, Clone, Serialize)]
pub struct QueryExecution {
    pub id: String,
    pub query: String,
    pub engine: String,
    pub user: String,
    pub state: ExecutionState,
    pub statements: Vec<StatementExecution>,
    pub error: Option<NormalizedError>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueryExecution {
    /// Creates a query execution with a fresh id, splitting the text into statements.
    pub fn new(query: impl Into<String>, engine: impl Into<String>, user: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), query, engine, user)
    }

    pub fn with_id(
        id: impl Into<String>,
        query: impl Into<String>,
        engine: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        let query = query.into();
        let statements = split_statements(&query)
            .into_iter()
            .enumerate()
            .map(|(index, range)| StatementExecution::new(index, range))
            .collect();
        Self {
            id: id.into(),
            query,
            engine: engine.into(),
            user: user.into(),
            state: ExecutionState::Initialized,
            statements,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Text of statement `index`.
    pub fn statement_text(&self, index: usize) -> Option<&str> {
        self.statements
            .get(index)
            .map(|s| s.range.text(&self.query))
    }

    /// Moves the query to `next`.
    pub fn transition(&mut self, next: ExecutionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Query {}: {} -> {}", self.id, self.state, next);
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Marks the query failed.
    pub fn fail(&mut self, error: NormalizedError) -> Result<()> {
        self.transition(ExecutionState::Error)?;
        self.error = Some(error);
        Ok(())
    }

    /// Outcome of every statement, in order.
    pub fn statement_outcomes(&self) -> Vec<StatementOutcome> {
        self.statements.iter().map(|s| s.outcome()).collect()
    }
}
