//! Engine connectivity check.
//!
//! Runs a trivial statement under an explicit deadline. The check never
//! touches execution state; it only reports what happened.

use super::Executor;
use crate::config::EngineConfiguration;
use crate::error::{RelayError, Result};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Statement used to check an engine.
const CHECK_STATEMENT: &str = "SELECT 1";

/// Poll cadence while probing.
const CHECK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    /// The check succeeded quickly.
    Good,
    /// The check succeeded but was slow.
    Warn,
    /// The engine answered with an error.
    Error,
    /// The engine could not be reached or did not answer in time.
    Unavailable,
}

impl ConnectivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityReport {
    pub status: ConnectivityStatus,
    pub messages: Vec<String>,
    pub elapsed: Duration,
}

/// Checks an engine with `SELECT 1` under the executor's connectivity deadline.
pub async fn check_connectivity(
    executor: &Executor,
    config: &EngineConfiguration,
) -> ConnectivityReport {
    let deadline = executor.settings().connectivity_timeout;
    let slow = executor.settings().slow_connectivity;
    let started = Instant::now();

    let outcome = tokio::time::timeout(deadline, run_check(executor, config)).await;
    let elapsed = started.elapsed();

    let (status, messages) = match outcome {
        Ok(Ok(())) if elapsed > slow => (
            ConnectivityStatus::Warn,
            vec![format!(
                "Engine '{}' answered in {} ms (slower than {} ms)",
                config.name,
                elapsed.as_millis(),
                slow.as_millis()
            )],
        ),
        Ok(Ok(())) => (ConnectivityStatus::Good, Vec::new()),
        Ok(Err(e @ (RelayError::Connection(_) | RelayError::Config(_)))) => {
            (ConnectivityStatus::Unavailable, vec![e.to_string()])
        }
        Ok(Err(e)) => (ConnectivityStatus::Error, vec![e.to_string()]),
        Err(_) => (
            ConnectivityStatus::Unavailable,
            vec![format!(
                "Engine '{}' did not respond within {} seconds",
                config.name,
                deadline.as_secs()
            )],
        ),
    };

    if status == ConnectivityStatus::Good {
        debug!("Engine '{}' is reachable ({:?})", config.name, elapsed);
    } else {
        warn!("Engine '{}' connectivity {}: {:?}", config.name, status, messages);
    }

    ConnectivityReport {
        status,
        messages,
        elapsed,
    }
}

async fn run_check(executor: &Executor, config: &EngineConfiguration) -> Result<()> {
    let mut cursor = executor.execute(CHECK_STATEMENT, config).await?;
    while !cursor.poll().await? {
        tokio::time::sleep(CHECK_POLL_INTERVAL).await;
    }
    cursor.get_one_row().await?;
    Ok(())
}
