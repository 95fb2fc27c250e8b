//! Query runner: drives a [`QueryExecution`] from submission to a terminal state.
//!
//! Statements run strictly one after another on fresh cursors. Each finished
//! statement is streamed as CSV into the result store. The first failing or
//! cancelled statement ends the query; the statements after it are never started.

use super::{ExecutionState, QueryExecution, StatementOutcome, StatementState};
use crate::config::{Config, EngineConfiguration};
use crate::engine::Cursor;
use crate::error::{RelayError, Result};
use crate::executor::{normalize_error, Completion, Executor, NormalizedError};
use crate::store::csv::{csv_line, row_to_csv};
use crate::store::{open_uploader, result_key, ResultStore, ResultUploader};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every state change of a running query.
///
/// Implementations persist executions or notify users. Calls are awaited in
/// order on the runner's task, so slow listeners slow the query down.
#[async_trait]
pub trait ExecutionListener: Send + Sync {
    async fn query_changed(&self, _query: &QueryExecution) {}

    async fn statement_changed(&self, _query: &QueryExecution, _index: usize) {}

    async fn progress(&self, _query_id: &str, _index: usize, _percent: u8) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ExecutionListener for NoopListener {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Prefix of every result key.
    pub key_prefix: String,
    /// Rows kept per statement. 0 means unlimited.
    pub max_result_rows: u64,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            key_prefix: config.store.key_prefix.clone(),
            max_result_rows: config.executor.max_result_rows,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What streaming one statement's rows produced.
#[derive(Debug, Default)]
struct Streamed {
    rows: u64,
    truncated: bool,
    cancelled: bool,
}

pub struct QueryRunner {
    executor: Executor,
    store: Arc<dyn ResultStore>,
    listener: Arc<dyn ExecutionListener>,
    settings: RunnerSettings,
}

impl QueryRunner {
    pub fn new(executor: Executor, store: Arc<dyn ResultStore>) -> Self {
        Self {
            executor,
            store,
            listener: Arc::new(NoopListener),
            settings: RunnerSettings::default(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Runs every statement of `query` on `engine`.
    ///
    /// Statement failures are recorded on the execution, not returned. An
    /// `Err` means the execution was not in a runnable state.
    pub async fn run(
        &self,
        query: &mut QueryExecution,
        engine: &EngineConfiguration,
        cancel: CancellationToken,
    ) -> Result<()> {
        if query.state.is_terminal() {
            return Err(RelayError::InvalidTransition {
                from: query.state.to_string(),
                to: ExecutionState::Running.to_string(),
            });
        }
        if query.state == ExecutionState::Initialized {
            self.transition_query(query, ExecutionState::Delivered).await?;
        }
        info!(
            "Running query {} ({} statements) on '{}'",
            query.id,
            query.statements.len(),
            engine.name
        );

        for index in 0..query.statements.len() {
            if cancel.is_cancelled() {
                info!("Query {} cancelled before statement {}", query.id, index);
                return self.transition_query(query, ExecutionState::Cancel).await;
            }
            if query.state == ExecutionState::Delivered {
                self.transition_query(query, ExecutionState::Running).await?;
            }

            match self.run_statement(query, index, engine, &cancel).await? {
                StatementOutcome::Error => {
                    let error = query.statements[index]
                        .error
                        .clone()
                        .unwrap_or_else(|| NormalizedError::internal("statement failed"));
                    query.fail(error)?;
                    self.listener.query_changed(query).await;
                    return Ok(());
                }
                StatementOutcome::Cancel => {
                    return self.transition_query(query, ExecutionState::Cancel).await;
                }
                _ => {}
            }
        }

        if query.state == ExecutionState::Delivered {
            self.transition_query(query, ExecutionState::Running).await?;
        }
        info!("Query {} finished", query.id);
        self.transition_query(query, ExecutionState::Done).await
    }

    async fn transition_query(&self, query: &mut QueryExecution, next: ExecutionState) -> Result<()> {
        query.transition(next)?;
        self.listener.query_changed(query).await;
        Ok(())
    }

    async fn transition_statement(
        &self,
        query: &mut QueryExecution,
        index: usize,
        next: StatementState,
    ) -> Result<()> {
        query.statements[index].transition(next)?;
        self.listener.statement_changed(query, index).await;
        Ok(())
    }

    /// Records `error` on statement `index`, positioned in document coordinates.
    async fn fail_statement(
        &self,
        query: &mut QueryExecution,
        index: usize,
        error: &RelayError,
    ) -> Result<StatementOutcome> {
        let range = query.statements[index].range;
        let normalized = normalize_error(error).with_range(&range);
        warn!("Query {} statement {} failed: {}", query.id, index, normalized);
        query.statements[index].fail(normalized)?;
        self.listener.statement_changed(query, index).await;
        Ok(StatementOutcome::Error)
    }

    async fn run_statement(
        &self,
        query: &mut QueryExecution,
        index: usize,
        engine: &EngineConfiguration,
        cancel: &CancellationToken,
    ) -> Result<StatementOutcome> {
        let text = query
            .statement_text(index)
            .ok_or_else(|| RelayError::internal(format!("no statement at index {index}")))?
            .to_string();
        self.transition_statement(query, index, StatementState::Running)
            .await?;
        debug!("Query {} statement {}: {}", query.id, index, text);

        let mut cursor = match self.executor.execute(&text, engine).await {
            Ok(cursor) => cursor,
            Err(e) => return self.fail_statement(query, index, &e).await,
        };
        query.statements[index].tracking_url = cursor.tracking_url();

        let listener = self.listener.clone();
        let query_id = query.id.clone();
        let completion = self
            .executor
            .wait_for_completion(cursor.as_mut(), cancel, move |percent| {
                let listener = listener.clone();
                let query_id = query_id.clone();
                async move { listener.progress(&query_id, index, percent).await }
            })
            .await;

        let statement = &mut query.statements[index];
        statement.progress = cursor.percent_complete();
        if statement.tracking_url.is_none() {
            statement.tracking_url = cursor.tracking_url();
        }

        match completion {
            Err(e) => return self.fail_statement(query, index, &e).await,
            Ok(Completion::Cancelled) => {
                info!("Query {} statement {} cancelled", query.id, index);
                self.transition_statement(query, index, StatementState::Cancel)
                    .await?;
                return Ok(StatementOutcome::Cancel);
            }
            Ok(Completion::Finished) => {}
        }

        self.transition_statement(query, index, StatementState::Uploading)
            .await?;
        let key = result_key(&self.settings.key_prefix, &query.id, index);
        let mut uploader = open_uploader(&self.store, &key);
        let streamed = self
            .stream_rows(cursor.as_mut(), uploader.as_mut(), cancel)
            .await;
        let ended = uploader.end().await;

        let (streamed, entry) = match (streamed, ended) {
            (Err(e), _) => return self.fail_statement(query, index, &e).await,
            (Ok(_), Err(e)) => return self.fail_statement(query, index, &as_upload_error(e)).await,
            (Ok(streamed), Ok(entry)) => (streamed, entry),
        };

        let truncated = streamed.truncated || entry.truncated;
        if truncated {
            warn!(
                "Query {} statement {}: result truncated after {} rows",
                query.id, index, streamed.rows
            );
        }
        let statement = &mut query.statements[index];
        statement.row_count = streamed.rows;
        statement.truncated = truncated;
        statement.result = Some(entry);

        if streamed.cancelled {
            info!("Query {} statement {} cancelled while uploading", query.id, index);
            self.transition_statement(query, index, StatementState::Cancel)
                .await?;
            return Ok(StatementOutcome::Cancel);
        }

        info!(
            "Query {} statement {} done ({} rows)",
            query.id, index, streamed.rows
        );
        self.transition_statement(query, index, StatementState::Done)
            .await?;
        Ok(StatementOutcome::Done)
    }

    /// Copies the cursor's result into the uploader: a header line, then one
    /// line per row, until the rows run out, a cap is hit or `cancel` fires.
    async fn stream_rows(
        &self,
        cursor: &mut dyn Cursor,
        uploader: &mut dyn ResultUploader,
        cancel: &CancellationToken,
    ) -> Result<Streamed> {
        let mut streamed = Streamed::default();
        uploader.start().await.map_err(as_upload_error)?;

        if let Some(columns) = cursor.get_columns().filter(|c| !c.is_empty()) {
            if !uploader
                .write(&csv_line(&columns))
                .await
                .map_err(as_upload_error)?
            {
                streamed.truncated = true;
                return Ok(streamed);
            }
        }

        let batch_size = self.executor.settings().fetch_batch_size;
        let max_rows = self.settings.max_result_rows;

        'fetch: loop {
            if cancel.is_cancelled() {
                cursor.cancel().await;
                streamed.cancelled = true;
                break;
            }

            let rows = self.executor.fetch_rows(cursor, batch_size).await?;
            let exhausted = rows.len() < batch_size;
            for row in rows {
                if max_rows > 0 && streamed.rows >= max_rows {
                    streamed.truncated = true;
                    break 'fetch;
                }
                if !uploader
                    .write(&row_to_csv(&row))
                    .await
                    .map_err(as_upload_error)?
                {
                    streamed.truncated = true;
                    break 'fetch;
                }
                streamed.rows += 1;
            }
            if exhausted {
                break;
            }
        }

        Ok(streamed)
    }
}

/// Store-side failures are reported as upload failures whatever their origin.
fn as_upload_error(error: RelayError) -> RelayError {
    match error {
        RelayError::Upload(_) => error,
        other => RelayError::upload(other.to_string()),
    }
}
