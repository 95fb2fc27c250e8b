//! relay: run SQL through db-relay from the command line.

mod cli;

use cli::{Cli, Command};
use db_relay::config::{Config, EngineConfiguration, ExecutorConfig, StoreConfig, StoreKind};
use db_relay::engine::{EngineClient, EngineContext, EngineRegistry, MockEngine};
use db_relay::error::{RelayError, Result};
use db_relay::execution::{QueryExecution, QueryRunner, RunnerSettings};
use db_relay::executor::{check_connectivity, ConnectivityStatus, Executor, ExecutorSettings};
use db_relay::logging;
use db_relay::statements::split_statements;
use db_relay::store::{build_store, open_reader, ResultStore};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    match cli.log_file.as_deref() {
        Some(path) => logging::init_file_logging(Some(path)),
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        eprintln!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    match cli.command {
        Command::Run {
            engine,
            source,
            mock,
            user,
            preview,
        } => {
            let sql = source.read()?;
            run_query(&config, &engine, mock, &sql, &user, preview).await
        }
        Command::Check { engine, mock } => {
            let (executor, engine) = resolve(&config, &engine, mock)?;
            let report = check_connectivity(&executor, &engine).await;
            println!(
                "{}: {} ({} ms)",
                engine.name,
                report.status,
                report.elapsed.as_millis()
            );
            for message in &report.messages {
                println!("  {message}");
            }
            match report.status {
                ConnectivityStatus::Good | ConnectivityStatus::Warn => Ok(()),
                _ => Err(RelayError::connection(format!(
                    "engine '{}' is {}",
                    engine.name, report.status
                ))),
            }
        }
        Command::Split { source } => {
            let sql = source.read()?;
            for (index, range) in split_statements(&sql).iter().enumerate() {
                println!(
                    "[{index}] {}..{} at {}:{}  {}",
                    range.start,
                    range.end,
                    range.start_line,
                    range.start_column,
                    range.text(&sql).replace('\n', " ")
                );
            }
            Ok(())
        }
        Command::Read {
            uri,
            limit,
            filename,
        } => {
            let store = build_store(&store_config(&config.store)).await?;
            let key = store.key_from_uri(&uri).ok_or_else(|| {
                RelayError::config(format!(
                    "'{uri}' does not belong to the configured {} store",
                    store.backend()
                ))
            })?;
            let mut reader = open_reader(&store, &key);
            if let Some(filename) = filename {
                println!("{}", reader.get_download_url(&filename).await?);
                return Ok(());
            }
            reader.start().await?;
            let mut lines = reader.read_lines(limit);
            while let Some(line) = lines.try_next().await? {
                println!("{line}");
            }
            reader.end();
            Ok(())
        }
    }
}

/// Builds the executor and picks the engine, swapping in the mock engine with `--mock`.
fn resolve(config: &Config, name: &str, mock: bool) -> Result<(Executor, EngineConfiguration)> {
    if !mock {
        let engine = config.get_engine(name)?.clone();
        return Ok((Executor::from_config(&config.executor), engine));
    }

    let mut registry = EngineRegistry::builtin();
    let engine = MockEngine::new();
    registry.register("mock", move |_config, _context| {
        Ok(Arc::new(engine.clone()) as Arc<dyn EngineClient>)
    });
    let executor = Executor::new(
        registry,
        EngineContext::with_pool_ttl(Duration::from_secs(config.executor.pool_idle_secs)),
        mock_settings(&config.executor),
    );
    Ok((executor, EngineConfiguration::new(name, "mock", "mock://")))
}

/// Inline results outlive the process so `relay read` can find them later.
fn store_config(config: &StoreConfig) -> StoreConfig {
    let mut config = config.clone();
    if config.backend == StoreKind::Inline && config.inline_path.is_none() {
        config.inline_path = dirs::data_dir().map(|dir| dir.join("db-relay").join("results.db"));
    }
    config
}

fn mock_settings(config: &ExecutorConfig) -> ExecutorSettings {
    ExecutorSettings {
        poll_interval: Duration::from_millis(10),
        ..ExecutorSettings::from(config)
    }
}

async fn run_query(
    config: &Config,
    engine_name: &str,
    mock: bool,
    sql: &str,
    user: &str,
    preview: usize,
) -> Result<()> {
    let (executor, engine) = resolve(config, engine_name, mock)?;
    let store = build_store(&store_config(&config.store)).await?;
    let runner = QueryRunner::new(executor, store.clone())
        .with_settings(RunnerSettings::from_config(config));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling query");
            trigger.cancel();
        }
    });

    let mut query = QueryExecution::new(sql, &engine.name, user);
    runner.run(&mut query, &engine, cancel).await?;

    println!("Query {}: {}", query.id, query.state);
    for statement in &query.statements {
        println!(
            "[{}] {} rows={}{}",
            statement.index,
            statement.state,
            statement.row_count,
            if statement.truncated { " (truncated)" } else { "" }
        );
        if let Some(error) = &statement.error {
            println!("    {error}");
        }
        if let Some(url) = &statement.tracking_url {
            println!("    tracking: {url}");
        }
        if let Some(entry) = &statement.result {
            println!("    {}", entry.uri);
            print_preview(&store, &entry.key, preview).await?;
        }
    }

    match &query.error {
        Some(error) => Err(RelayError::engine(error.to_string())),
        None => Ok(()),
    }
}

async fn print_preview(store: &Arc<dyn ResultStore>, key: &str, limit: usize) -> Result<()> {
    if limit == 0 {
        return Ok(());
    }
    let mut reader = open_reader(store, key);
    reader.start().await?;
    let mut records = reader.get_csv_iter(Some(limit));
    while let Some(record) = records.try_next().await? {
        println!("    | {}", record.join(" | "));
    }
    reader.end();
    Ok(())
}
