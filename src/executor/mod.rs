//! Executor: resolves engine clients and drives cursors.
//!
//! The executor owns the engine registry and the shared [`EngineContext`].
//! Polling is an explicit caller-driven loop; [`Executor::wait_for_completion`]
//! is that loop with cancellation, progress reporting and an optional
//! statement deadline.

pub mod health;
pub mod taxonomy;

pub use health::{check_connectivity, ConnectivityReport, ConnectivityStatus};
pub use taxonomy::{normalize_error, ErrorKind, NormalizedError};

use crate::config::{EngineConfiguration, ExecutorConfig};
use crate::engine::{Cursor, EngineClient, EngineContext, EngineRegistry, Row};
use crate::error::{RelayError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime settings derived from [`ExecutorConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    pub fetch_batch_size: usize,
    pub connectivity_timeout: Duration,
    pub slow_connectivity: Duration,
    pub statement_timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecutorSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            fetch_batch_size: config.fetch_batch_size.max(1),
            connectivity_timeout: Duration::from_secs(config.connectivity_timeout_secs),
            slow_connectivity: Duration::from_millis(config.slow_connectivity_ms),
            statement_timeout: (config.statement_timeout_secs > 0)
                .then(|| Duration::from_secs(config.statement_timeout_secs)),
        }
    }
}

/// How a wait on a cursor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// `poll` reported a successful terminal state.
    Finished,
    /// The cancellation token fired; the cursor has been cancelled.
    Cancelled,
}

/// Resolves engine clients and drives cursors.
#[derive(Debug, Clone)]
pub struct Executor {
    registry: EngineRegistry,
    context: EngineContext,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(registry: EngineRegistry, context: EngineContext, settings: ExecutorSettings) -> Self {
        Self {
            registry,
            context,
            settings,
        }
    }

    /// Creates an executor with every built-in engine family.
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            EngineRegistry::builtin(),
            EngineContext::with_pool_ttl(Duration::from_secs(config.pool_idle_secs)),
            ExecutorSettings::from(config),
        )
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Resolves the client for an engine configuration.
    pub fn client(&self, config: &EngineConfiguration) -> Result<Arc<dyn EngineClient>> {
        self.registry.create(config, &self.context)
    }

    /// Opens a cursor and issues one statement on it.
    pub async fn execute(
        &self,
        statement: &str,
        config: &EngineConfiguration,
    ) -> Result<Box<dyn Cursor>> {
        let client = self.client(config)?;
        let mut cursor = client.cursor().await?;
        info!("Running statement on engine '{}' ({})", config.name, config.family);
        cursor.run(statement).await?;
        Ok(cursor)
    }

    /// Polls a cursor once.
    pub async fn poll(&self, cursor: &mut dyn Cursor) -> Result<bool> {
        let done = cursor.poll().await?;
        debug!("poll: done={} progress={}%", done, cursor.percent_complete());
        Ok(done)
    }

    /// Fetches up to `n` rows from a completed cursor.
    pub async fn fetch_rows(&self, cursor: &mut dyn Cursor, n: usize) -> Result<Vec<Row>> {
        cursor.get_n_rows(n).await
    }

    /// Polls until the cursor completes, the token is cancelled, or the
    /// statement deadline passes.
    ///
    /// `on_progress` is called whenever the progress estimate changes.
    /// Cancellation and timeouts cancel the cursor before returning.
    pub async fn wait_for_completion<F, Fut>(
        &self,
        cursor: &mut dyn Cursor,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<Completion>
    where
        F: FnMut(u8) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let Some(limit) = self.settings.statement_timeout else {
            return self.poll_loop(cursor, cancel, on_progress).await;
        };

        match tokio::time::timeout(limit, self.poll_loop(cursor, cancel, on_progress)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Statement exceeded {:?}, cancelling", limit);
                cursor.cancel().await;
                Err(RelayError::timeout(format!(
                    "Statement did not finish within {} seconds",
                    limit.as_secs()
                )))
            }
        }
    }

    async fn poll_loop<F, Fut>(
        &self,
        cursor: &mut dyn Cursor,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<Completion>
    where
        F: FnMut(u8) -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let mut last_progress = None;

        loop {
            let polled = tokio::select! {
                biased;

                _ = cancel.cancelled() => None,
                result = self.poll(cursor) => Some(result),
            };
            let Some(result) = polled else {
                info!("Cancellation requested, cancelling cursor");
                cursor.cancel().await;
                return Ok(Completion::Cancelled);
            };
            let done = result?;

            let percent = cursor.percent_complete();
            if last_progress != Some(percent) {
                last_progress = Some(percent);
                on_progress(percent).await;
            }
            if done {
                return Ok(Completion::Finished);
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CursorEvent, MockEngine, MockScript, Value};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn executor_with(engine: MockEngine, settings: ExecutorSettings) -> Executor {
        let mut registry = EngineRegistry::empty();
        registry.register("mock", move |_config, _context| {
            Ok(Arc::new(engine.clone()) as Arc<dyn EngineClient>)
        });
        Executor::new(registry, EngineContext::default(), settings)
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            poll_interval: Duration::from_millis(1),
            ..ExecutorSettings::default()
        }
    }

    fn mock_config() -> EngineConfiguration {
        EngineConfiguration::new("test", "mock", "mock://")
    }

    #[test]
    fn test_settings_from_config() {
        let config = ExecutorConfig {
            statement_timeout_secs: 30,
            fetch_batch_size: 0,
            ..ExecutorConfig::default()
        };
        let settings = ExecutorSettings::from(&config);
        assert_eq!(settings.statement_timeout, Some(Duration::from_secs(30)));
        assert_eq!(settings.fetch_batch_size, 1);
        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(ExecutorSettings::default().statement_timeout, None);
    }

    #[tokio::test]
    async fn test_execute_unknown_family_is_config_error() {
        let executor = executor_with(MockEngine::new(), fast_settings());
        let config = EngineConfiguration::new("x", "oracle", "oracle://h");
        let err = executor.execute("SELECT 1", &config).await.err().unwrap();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[tokio::test]
    async fn test_wait_reports_progress_and_finishes() {
        let engine = MockEngine::new().with_script(
            "slow",
            MockScript::rows(&["n"], vec![vec![Value::Int(7)]]).with_polls(3),
        );
        let executor = executor_with(engine, fast_settings());
        let mut cursor = executor.execute("SELECT slow", &mock_config()).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let completion = executor
            .wait_for_completion(cursor.as_mut(), &CancellationToken::new(), move |p| {
                sink.lock().unwrap().push(p);
                async {}
            })
            .await
            .unwrap();

        assert_eq!(completion, Completion::Finished);
        assert_eq!(*seen.lock().unwrap(), vec![25, 50, 75, 100]);
        assert_eq!(
            executor.fetch_rows(cursor.as_mut(), 10).await.unwrap(),
            vec![vec![Value::Int(7)]]
        );
    }

    #[tokio::test]
    async fn test_wait_propagates_engine_error() {
        let engine = MockEngine::new()
            .with_script("bad", MockScript::failing(RelayError::engine("no such table")));
        let executor = executor_with(engine, fast_settings());
        let mut cursor = executor.execute("SELECT bad", &mock_config()).await.unwrap();

        let err = executor
            .wait_for_completion(cursor.as_mut(), &CancellationToken::new(), |_| async {})
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::engine("no such table"));
    }

    #[tokio::test]
    async fn test_wait_cancelled_cancels_cursor() {
        let engine = MockEngine::new().with_script("forever", MockScript::never_finishes());
        let executor = executor_with(engine.clone(), fast_settings());
        let mut cursor = executor
            .execute("SELECT forever", &mock_config())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let completion = executor
            .wait_for_completion(cursor.as_mut(), &cancel, |_| async {})
            .await
            .unwrap();
        assert_eq!(completion, Completion::Cancelled);
        assert!(engine
            .events()
            .await
            .contains(&CursorEvent::Cancel("SELECT forever".to_string())));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let engine = MockEngine::new().with_script("forever", MockScript::never_finishes());
        let settings = ExecutorSettings {
            statement_timeout: Some(Duration::from_millis(30)),
            ..fast_settings()
        };
        let executor = executor_with(engine.clone(), settings);
        let mut cursor = executor
            .execute("SELECT forever", &mock_config())
            .await
            .unwrap();

        let err = executor
            .wait_for_completion(cursor.as_mut(), &CancellationToken::new(), |_| async {})
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout(_)));
        assert_eq!(engine.events().await.len(), 2);
    }
}
