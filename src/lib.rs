//! db-relay: query execution and result streaming runtime.
//!
//! Runs SQL against heterogeneous engines through a uniform cursor protocol,
//! tracks each query and statement through an explicit state machine, and
//! streams results as CSV into an inline or object store.

pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod executor;
pub mod logging;
pub mod statements;
pub mod store;
pub mod utf8;

pub use config::{Config, EngineConfiguration};
pub use error::{RelayError, Result};
pub use execution::{ExecutionListener, ExecutionState, QueryExecution, QueryRunner, StatementState};
pub use executor::{check_connectivity, normalize_error, Executor, NormalizedError};
pub use statements::split_statements;
pub use store::{build_store, open_reader, open_uploader, ResultStore, ResultStoreEntry};
pub use utf8::guard_utf8_chunk;
