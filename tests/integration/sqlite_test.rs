//! SQLite engine integration tests.
//!
//! Runs whole queries through the sqlx adapter against a temporary database file.

use super::common::{builtin_executor, stored_text};
use db_relay::config::EngineConfiguration;
use db_relay::execution::{ExecutionState, QueryExecution, QueryRunner, StatementOutcome};
use db_relay::executor::{check_connectivity, ConnectivityStatus, ErrorKind};
use db_relay::store::{InlineStore, ResultStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn sqlite_engine(dir: &tempfile::TempDir) -> EngineConfiguration {
    let path = dir.path().join("warehouse.db");
    EngineConfiguration::new(
        "lite",
        "sqlite",
        format!("sqlite://{}?mode=rwc", path.display()),
    )
}

async fn inline_store() -> Arc<dyn ResultStore> {
    Arc::new(InlineStore::open(None, 0).await.unwrap())
}

/// Scenario: Multi-statement script
/// Given a script that creates, fills and reads a table
/// When the runner executes it
/// Then every statement is DONE
/// And the SELECT result is stored as CSV with a header
#[tokio::test]
async fn test_script_creates_and_reads_table() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir);
    let store = inline_store().await;
    let runner = QueryRunner::new(builtin_executor(), store.clone());

    let sql = "CREATE TABLE people (id INTEGER, name TEXT);\n\
               INSERT INTO people VALUES (1, 'ann'), (2, 'bob, jr'), (3, NULL), (4, 'dé');\n\
               SELECT id, name FROM people ORDER BY id";
    let mut query = QueryExecution::with_id("script", sql, "lite", "tester");
    runner
        .run(&mut query, &engine, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(query.state, ExecutionState::Done);
    assert_eq!(
        query.statement_outcomes(),
        vec![StatementOutcome::Done; 3]
    );

    let select = &query.statements[2];
    assert_eq!(select.row_count, 4);
    assert_eq!(
        stored_text(&store, &select.result.as_ref().unwrap().key).await,
        "id,name\n1,ann\n2,\"bob, jr\"\n3,\n4,dé\n"
    );

    let create = &query.statements[0];
    assert_eq!(create.row_count, 0);
    assert_eq!(create.result.as_ref().unwrap().size, 0);
}

/// Scenario: Failing statement in the middle of a script
/// Given a script whose second statement reads a missing table
/// When the runner executes it
/// Then the query is ERROR with an engine error
/// And the third statement is skipped
#[tokio::test]
async fn test_missing_table_stops_script() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir);
    let runner = QueryRunner::new(builtin_executor(), inline_store().await);

    let mut query = QueryExecution::new(
        "SELECT 1;\nSELECT * FROM nowhere;\nSELECT 3",
        "lite",
        "tester",
    );
    runner
        .run(&mut query, &engine, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(query.state, ExecutionState::Error);
    assert_eq!(
        query.statement_outcomes(),
        vec![
            StatementOutcome::Done,
            StatementOutcome::Error,
            StatementOutcome::Skipped
        ]
    );
    let error = query.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Engine);
    assert!(error.message.contains("nowhere"));
    assert!(!error.retryable);
}

/// Scenario: Large result streamed in batches
/// Given a recursive query producing 250 rows
/// When the runner executes it with a small fetch batch
/// Then all rows are stored in order
#[tokio::test]
async fn test_large_result_is_streamed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir);
    let store = inline_store().await;
    let runner = QueryRunner::new(builtin_executor(), store.clone());

    let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 250) \
               SELECT x FROM n";
    let mut query = QueryExecution::new(sql, "lite", "tester");
    runner
        .run(&mut query, &engine, CancellationToken::new())
        .await
        .unwrap();

    let statement = &query.statements[0];
    assert_eq!(statement.row_count, 250);
    let text = stored_text(&store, &statement.result.as_ref().unwrap().key).await;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 251);
    assert_eq!(lines[0], "x");
    assert_eq!(lines[1], "1");
    assert_eq!(lines[250], "250");
}

/// Scenario: Connectivity check against SQLite
/// Given a reachable database file
/// When check_connectivity runs
/// Then the engine is reported good
#[tokio::test]
async fn test_connectivity_check() {
    let dir = tempfile::tempdir().unwrap();
    let report = check_connectivity(&builtin_executor(), &sqlite_engine(&dir)).await;
    assert_eq!(report.status, ConnectivityStatus::Good, "{:?}", report.messages);
}

/// Scenario: Misconfigured SQLite connection string
/// Given a connection string without the sqlite: scheme
/// When check_connectivity runs
/// Then the engine is reported unavailable
#[tokio::test]
async fn test_bad_connection_string_is_unavailable() {
    let engine = EngineConfiguration::new("lite", "sqlite", "/tmp/not-a-url.db");
    let report = check_connectivity(&builtin_executor(), &engine).await;
    assert_eq!(report.status, ConnectivityStatus::Unavailable);
}

/// Scenario: Runtime failure after rows were already produced
/// Given a SELECT whose third row overflows an integer
/// When the runner executes it
/// Then the statement is ERROR with an engine error
/// And it is not reported as an upload failure
/// And no partial result is recorded
#[tokio::test]
async fn test_failure_mid_stream_is_engine_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = sqlite_engine(&dir);
    let runner = QueryRunner::new(builtin_executor(), inline_store().await);

    let sql = "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 5) \
               SELECT CASE WHEN x < 3 THEN x ELSE abs(x - 9223372036854775807 - 4) END AS v FROM n";
    let mut query = QueryExecution::new(sql, "lite", "tester");
    runner
        .run(&mut query, &engine, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(query.state, ExecutionState::Error);
    let statement = &query.statements[0];
    assert_eq!(statement.outcome(), StatementOutcome::Error);
    assert!(statement.result.is_none());

    let error = statement.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Engine);
    assert!(!error.upload_failed);
    assert!(error.message.contains("overflow"), "{}", error.message);
}
