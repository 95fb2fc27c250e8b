//! Mock engine for testing.
//!
//! Provides a scripted in-process engine for headless testing and the CLI
//! `--mock` mode. Scripts are matched by statement substring; unmatched
//! statements get a single canned row.

use super::{Cursor, EngineClient, Row, RowBuffer, Value};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Scripted behaviour for one statement.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Number of `poll` calls returning false before completion. `None` never completes.
    pub polls_until_done: Option<usize>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Error surfaced by `poll` once the statement "finishes".
    pub failure: Option<RelayError>,
    /// Error surfaced by the first row fetch.
    pub fail_on_fetch: Option<RelayError>,
    pub tracking_url: Option<String>,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            polls_until_done: Some(0),
            columns: Vec::new(),
            rows: Vec::new(),
            failure: None,
            fail_on_fetch: None,
            tracking_url: None,
        }
    }
}

impl MockScript {
    /// A statement that succeeds with the given result.
    pub fn rows(columns: &[&str], rows: Vec<Row>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            ..Self::default()
        }
    }

    /// A statement whose `poll` fails with `error`.
    pub fn failing(error: RelayError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    /// A statement that never completes on its own.
    pub fn never_finishes() -> Self {
        Self {
            polls_until_done: None,
            ..Self::default()
        }
    }

    pub fn with_polls(mut self, polls: usize) -> Self {
        self.polls_until_done = Some(polls);
        self
    }

    pub fn with_fetch_failure(mut self, error: RelayError) -> Self {
        self.fail_on_fetch = Some(error);
        self
    }

    pub fn with_tracking_url(mut self, url: impl Into<String>) -> Self {
        self.tracking_url = Some(url.into());
        self
    }

    fn canned(statement: &str) -> Self {
        Self::rows(
            &["result"],
            vec![vec![Value::String(format!("Mock result for: {statement}"))]],
        )
    }
}

/// Cursor calls recorded by the mock engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorEvent {
    Run(String),
    Cancel(String),
}

/// A mock engine that returns scripted results.
#[derive(Debug, Clone)]
pub struct MockEngine {
    family: String,
    scripts: Vec<(String, MockScript)>,
    events: Arc<Mutex<Vec<CursorEvent>>>,
}

impl MockEngine {
    /// Creates a mock engine with no scripts.
    pub fn new() -> Self {
        Self {
            family: "mock".to_string(),
            scripts: Vec::new(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Adds a script for statements containing `pattern`. First match wins.
    pub fn with_script(mut self, pattern: impl Into<String>, script: MockScript) -> Self {
        self.scripts.push((pattern.into(), script));
        self
    }

    /// Returns a snapshot of recorded cursor calls.
    pub async fn events(&self) -> Vec<CursorEvent> {
        self.events.lock().await.clone()
    }

    fn script_for(&self, statement: &str) -> MockScript {
        self.scripts
            .iter()
            .find(|(pattern, _)| statement.contains(pattern.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| MockScript::canned(statement))
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    fn family(&self) -> &str {
        &self.family
    }

    async fn cursor(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(MockCursor {
            engine: self.clone(),
            statement: String::new(),
            script: None,
            polls: 0,
            progress: 0,
            cancelled: false,
            buffer: RowBuffer::new(),
            columns: None,
        }))
    }
}

struct MockCursor {
    engine: MockEngine,
    statement: String,
    script: Option<MockScript>,
    polls: usize,
    progress: u8,
    cancelled: bool,
    buffer: RowBuffer,
    columns: Option<Vec<String>>,
}

#[async_trait]
impl Cursor for MockCursor {
    async fn run(&mut self, statement: &str) -> Result<()> {
        self.engine
            .events
            .lock()
            .await
            .push(CursorEvent::Run(statement.to_string()));
        self.statement = statement.to_string();
        self.script = Some(self.engine.script_for(statement));
        Ok(())
    }

    async fn poll(&mut self) -> Result<bool> {
        if self.buffer.is_ready() {
            return Ok(true);
        }
        if self.cancelled {
            return Err(RelayError::engine("Statement was cancelled"));
        }
        let script = self
            .script
            .as_ref()
            .ok_or_else(|| RelayError::internal("poll() called before run()"))?;

        let finished = match script.polls_until_done {
            Some(limit) => self.polls >= limit,
            None => false,
        };
        self.polls += 1;

        if !finished {
            self.progress = match script.polls_until_done {
                Some(limit) => (self.polls * 100 / (limit + 1)).min(99) as u8,
                None => self.polls.min(99) as u8,
            };
            return Ok(false);
        }

        if let Some(error) = &script.failure {
            return Err(error.clone());
        }
        self.columns = Some(script.columns.clone());
        self.buffer.extend(script.rows.clone());
        self.buffer.mark_ready();
        self.progress = 100;
        Ok(true)
    }

    async fn cancel(&mut self) {
        self.cancelled = true;
        self.engine
            .events
            .lock()
            .await
            .push(CursorEvent::Cancel(self.statement.clone()));
    }

    async fn get_n_rows(&mut self, n: usize) -> Result<Vec<Row>> {
        self.buffer.ensure_ready()?;
        if let Some(error) = self.script.as_mut().and_then(|s| s.fail_on_fetch.take()) {
            return Err(error);
        }
        Ok(self.buffer.take(n))
    }

    fn get_columns(&self) -> Option<Vec<String>> {
        self.columns.clone()
    }

    fn percent_complete(&self) -> u8 {
        self.progress
    }

    fn tracking_url(&self) -> Option<String> {
        self.script.as_ref().and_then(|s| s.tracking_url.clone())
    }
}
