//! Query runner integration tests.
//!
//! Runs queries end to end against the mock engine with real result stores.

use super::common::{executor_with_mock, fast_settings, stored_text};
use async_trait::async_trait;
use db_relay::config::EngineConfiguration;
use db_relay::engine::{CursorEvent, EngineRegistry, EngineContext, MockEngine, MockScript, Value};
use db_relay::execution::{ExecutionListener, QueryExecution, QueryRunner, RunnerSettings};
use db_relay::execution::{ExecutionState, StatementOutcome};
use db_relay::executor::{ErrorKind, Executor, ExecutorSettings};
use db_relay::store::{open_reader, ObjectResultStore, ResultStore, StoreBackend};
use db_relay::RelayError;
use futures::TryStreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn mock_engine_config() -> EngineConfiguration {
    EngineConfiguration::new("warehouse", "mock", "mock://")
}

#[derive(Default)]
struct ProgressListener {
    percents: Mutex<Vec<(usize, u8)>>,
    states: Mutex<Vec<String>>,
}

#[async_trait]
impl ExecutionListener for ProgressListener {
    async fn query_changed(&self, query: &QueryExecution) {
        self.states.lock().unwrap().push(query.state.to_string());
    }

    async fn progress(&self, _query_id: &str, index: usize, percent: u8) {
        self.percents.lock().unwrap().push((index, percent));
    }
}

/// Scenario: Query results land in an object store
/// Given a two-statement query on the mock engine
/// When it runs with an in-memory object store
/// Then each statement's CSV is stored under its own key and readable
#[tokio::test]
async fn test_query_into_object_store() {
    let engine = MockEngine::new().with_script(
        "FROM orders",
        MockScript::rows(
            &["id", "note"],
            vec![
                vec![Value::Int(7), Value::String("line one\nline two".into())],
                vec![Value::Int(8), Value::Float(1.5)],
            ],
        )
        .with_tracking_url("http://coordinator/ui/query/abc"),
    );
    let store: Arc<dyn ResultStore> = Arc::new(ObjectResultStore::in_memory().with_part_size(4));
    let runner = QueryRunner::new(executor_with_mock(engine), store.clone());

    let mut query = QueryExecution::with_id(
        "q42",
        "SELECT 1;\nSELECT id, note FROM orders",
        "warehouse",
        "alice",
    );
    runner
        .run(&mut query, &mock_engine_config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(query.state, ExecutionState::Done);
    let second = &query.statements[1];
    assert_eq!(
        second.tracking_url.as_deref(),
        Some("http://coordinator/ui/query/abc")
    );
    let entry = second.result.as_ref().unwrap();
    assert_eq!(entry.backend, StoreBackend::ObjectMultipart);
    assert_eq!(entry.uri, "memory:///results/q42/1/result.csv");
    assert_eq!(
        stored_text(&store, &entry.key).await,
        "id,note\n7,\"line one\nline two\"\n8,1.5\n"
    );

    let mut reader = open_reader(&store, &entry.key);
    reader.start().await.unwrap();
    let records: Vec<Vec<String>> = reader.get_csv_iter(None).try_collect().await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1], vec!["7".to_string(), "line one\nline two".to_string()]);
}

/// Scenario: Progress is reported while polling
/// Given a statement that needs three polls to finish
/// When the query runs
/// Then the listener sees rising progress ending at 100
#[tokio::test]
async fn test_progress_reaches_listener() {
    let engine = MockEngine::new().with_script(
        "slow",
        MockScript::rows(&["x"], vec![vec![Value::Int(1)]]).with_polls(3),
    );
    let listener = Arc::new(ProgressListener::default());
    let runner = QueryRunner::new(executor_with_mock(engine), Arc::new(ObjectResultStore::in_memory()))
        .with_listener(listener.clone());

    let mut query = QueryExecution::new("SELECT x FROM slow", "warehouse", "alice");
    runner
        .run(&mut query, &mock_engine_config(), CancellationToken::new())
        .await
        .unwrap();

    let percents = listener.percents.lock().unwrap().clone();
    assert_eq!(percents, vec![(0, 25), (0, 50), (0, 75), (0, 100)]);
    assert_eq!(
        listener.states.lock().unwrap().clone(),
        vec!["DELIVERED", "RUNNING", "DONE"]
    );
    assert_eq!(query.statements[0].progress, 100);
}

/// Scenario: Cancelling a long statement
/// Given a statement that never finishes
/// When the cancellation token fires
/// Then the engine cursor is cancelled and later statements never run
#[tokio::test]
async fn test_cancel_reaches_engine() {
    let engine = MockEngine::new().with_script("forever", MockScript::never_finishes());
    let runner = QueryRunner::new(
        executor_with_mock(engine.clone()),
        Arc::new(ObjectResultStore::in_memory()),
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let mut query = QueryExecution::new("SELECT forever; SELECT 2", "warehouse", "alice");
    runner.run(&mut query, &mock_engine_config(), cancel).await.unwrap();

    assert_eq!(query.state, ExecutionState::Cancel);
    assert_eq!(
        query.statement_outcomes(),
        vec![StatementOutcome::Cancel, StatementOutcome::Skipped]
    );
    assert!(query.statements[0].result.is_none());
    assert_eq!(
        engine.events().await,
        vec![
            CursorEvent::Run("SELECT forever".to_string()),
            CursorEvent::Cancel("SELECT forever".to_string()),
        ]
    );
}

/// Scenario: A statement exceeds the statement timeout
/// Given an executor with a short statement timeout
/// When a statement never finishes
/// Then the statement fails with a retryable internal error
#[tokio::test]
async fn test_statement_timeout_fails_statement() {
    let engine = MockEngine::new().with_script("forever", MockScript::never_finishes());
    let mut registry = EngineRegistry::empty();
    registry.register("mock", move |_config, _context| {
        Ok(Arc::new(engine.clone()) as Arc<dyn db_relay::engine::EngineClient>)
    });
    let settings = ExecutorSettings {
        statement_timeout: Some(Duration::from_millis(40)),
        ..fast_settings()
    };
    let executor = Executor::new(registry, EngineContext::default(), settings);
    let runner = QueryRunner::new(executor, Arc::new(ObjectResultStore::in_memory()));

    let mut query = QueryExecution::new("SELECT forever", "warehouse", "alice");
    runner
        .run(&mut query, &mock_engine_config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(query.state, ExecutionState::Error);
    let error = query.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.retryable);
}

/// Scenario: Engine errors carry document positions
/// Given a three-line query whose last statement fails at line 1 column 8
/// When the query runs
/// Then the error position is reported in document coordinates
#[tokio::test]
async fn test_engine_error_position_in_document() {
    let engine = MockEngine::new().with_script(
        "FROM missing",
        MockScript::failing(RelayError::syntax("Table missing does not exist", 1, 8)),
    );
    let runner = QueryRunner::new(executor_with_mock(engine), Arc::new(ObjectResultStore::in_memory()));

    let mut query = QueryExecution::new(
        "SELECT 1;\n  SELECT * FROM missing",
        "warehouse",
        "alice",
    );
    runner
        .run(&mut query, &mock_engine_config(), CancellationToken::new())
        .await
        .unwrap();

    let error = query.statements[1].error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Syntax);
    let position = error.position.unwrap();
    assert_eq!((position.line, position.column), (2, 10));
}

/// Scenario: Row cap with object storage
/// Given runner settings that keep two rows per statement
/// When a statement returns five rows
/// Then two rows are stored and the statement is marked truncated
#[tokio::test]
async fn test_row_cap_with_object_store() {
    let rows = (0..5).map(|i| vec![Value::Int(i)]).collect();
    let engine = MockEngine::new().with_script("nums", MockScript::rows(&["n"], rows));
    let store: Arc<dyn ResultStore> = Arc::new(ObjectResultStore::in_memory());
    let runner = QueryRunner::new(executor_with_mock(engine), store.clone()).with_settings(
        RunnerSettings {
            key_prefix: "capped".to_string(),
            max_result_rows: 2,
        },
    );

    let mut query = QueryExecution::with_id("q", "SELECT n FROM nums", "warehouse", "alice");
    runner
        .run(&mut query, &mock_engine_config(), CancellationToken::new())
        .await
        .unwrap();

    let statement = &query.statements[0];
    assert!(statement.truncated);
    assert_eq!(statement.row_count, 2);
    assert_eq!(stored_text(&store, "capped/q/0/result.csv").await, "n\n0\n1\n");
}
