//! Engine abstraction layer for db-relay.
//!
//! Every engine family is reached through a [`Cursor`]: one in-flight
//! statement on one physical connection. Clients are created by name through
//! the [`EngineRegistry`] and share pooled resources through an
//! [`EngineContext`] owned by the caller.

pub mod connection_string;
pub mod hive;
pub mod mock;
pub mod presto;
pub mod registry;
pub mod sqlx_engine;
pub mod types;

pub use connection_string::{ConnectionString, Endpoint};
pub use hive::HiveEngine;
pub use mock::{CursorEvent, MockEngine, MockScript};
pub use presto::PrestoEngine;
pub use registry::{EngineConstructor, EngineRegistry};
pub use sqlx_engine::{SqlPool, SqlxEngine};
pub use types::{Row, Value};

use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;

/// How long an idle connection pool stays cached.
const POOL_IDLE_TTL: Duration = Duration::from_secs(600);

/// Maximum number of cached connection pools.
const MAX_CACHED_POOLS: u64 = 64;

/// One statement execution against one engine connection.
///
/// `run` issues the statement, the caller loops on `poll` until it returns
/// true, then pulls rows. Cursors are owned by a single worker.
#[async_trait]
pub trait Cursor: Send {
    /// Issues the statement. Asynchronous engines return immediately.
    async fn run(&mut self, statement: &str) -> Result<()>;

    /// Returns true once the statement reached a terminal outcome.
    ///
    /// A failed statement surfaces its error here.
    async fn poll(&mut self) -> Result<bool>;

    /// Requests cancellation. Never fails; problems are logged.
    async fn cancel(&mut self);

    /// Fetches the next row, or `None` when the result is exhausted.
    async fn get_one_row(&mut self) -> Result<Option<Row>> {
        Ok(self.get_n_rows(1).await?.into_iter().next())
    }

    /// Fetches up to `n` rows. Fewer than `n` rows means the result is exhausted.
    async fn get_n_rows(&mut self, n: usize) -> Result<Vec<Row>>;

    /// Column names, once known.
    fn get_columns(&self) -> Option<Vec<String>>;

    /// Best-effort progress estimate between 0 and 100.
    fn percent_complete(&self) -> u8;

    /// Link to the engine's own job page, when it has one.
    fn tracking_url(&self) -> Option<String> {
        None
    }
}

/// A configured engine that can open cursors.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Engine family name this client was created for.
    fn family(&self) -> &str;

    /// Opens a new cursor on a fresh or pooled connection.
    async fn cursor(&self) -> Result<Box<dyn Cursor>>;
}

/// Shared resources passed into engine constructors.
#[derive(Clone)]
pub struct EngineContext {
    /// HTTP client for REST engines.
    pub http: reqwest::Client,
    /// Connection pools keyed by connection URL.
    pub pools: moka::future::Cache<String, SqlPool>,
}

impl EngineContext {
    /// Creates a context with the given pool idle TTL.
    pub fn with_pool_ttl(ttl: Duration) -> Self {
        let pools = moka::future::Cache::builder()
            .max_capacity(MAX_CACHED_POOLS)
            .time_to_idle(ttl)
            .build();
        Self {
            http: reqwest::Client::new(),
            pools,
        }
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::with_pool_ttl(POOL_IDLE_TTL)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("cached_pools", &self.pools.entry_count())
            .finish()
    }
}

/// Row buffer shared by cursor implementations.
///
/// Tracks whether `poll` has completed and holds rows already fetched from
/// the engine, including a peeked first row that must be returned again.
#[derive(Debug, Default)]
pub struct RowBuffer {
    ready: bool,
    rows: VecDeque<Row>,
}

impl RowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the statement as finished so rows may be read.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Fails with an internal error when rows are requested before `poll` returned true.
    pub fn ensure_ready(&self) -> Result<()> {
        if self.ready {
            Ok(())
        } else {
            Err(RelayError::internal(
                "Rows requested before poll() reported completion",
            ))
        }
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = Row>) {
        self.rows.extend(rows);
    }

    /// Puts a peeked row back at the front.
    pub fn prepend(&mut self, row: Row) {
        self.rows.push_front(row);
    }

    /// Removes up to `n` rows from the front.
    pub fn take(&mut self, n: usize) -> Vec<Row> {
        let count = n.min(self.rows.len());
        self.rows.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
