//! Inline result store: one SQLite row per result.
//!
//! Rows are buffered in memory under a hard byte cap and written on `end()`.

use super::{ResultSource, ResultStore, ResultStoreEntry, ResultUploader, SizeCap, StoreBackend, UploadPhase};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Cap applied when the configuration asks for an unlimited inline result.
const DEFAULT_INLINE_MAX_BYTES: u64 = 5 * 1024 * 1024;

const URI_SCHEME: &str = "inline://";

/// Stores results in a `query_results` table.
#[derive(Debug, Clone)]
pub struct InlineStore {
    pool: SqlitePool,
    max_bytes: u64,
}

impl InlineStore {
    /// Opens the store at `path`, or in memory when `path` is `None`.
    pub async fn open(path: Option<&Path>, max_bytes: u64) -> Result<Self> {
        let pool = match path {
            Some(path) => Self::connect_file(path).await?,
            None => Self::connect_memory().await?,
        };
        Self::with_pool(pool, max_bytes).await
    }

    /// Uses an existing pool, creating the table if needed.
    pub async fn with_pool(pool: SqlitePool, max_bytes: u64) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS query_results (
                key TEXT PRIMARY KEY,
                result TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| RelayError::storage(format!("Failed to create query_results table: {e}")))?;

        let max_bytes = if max_bytes == 0 {
            DEFAULT_INLINE_MAX_BYTES
        } else {
            max_bytes
        };
        Ok(Self { pool, max_bytes })
    }

    async fn connect_file(path: &Path) -> Result<SqlitePool> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::storage(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| RelayError::config(format!("Invalid inline store path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| RelayError::storage(format!("Failed to open inline store: {e}")))?;
        info!("Inline result store opened at {}", path.display());
        Ok(pool)
    }

    async fn connect_memory() -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RelayError::config(format!("Invalid inline store path: {e}")))?;

        // A single connection that never idles out keeps the in-memory database alive.
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| RelayError::storage(format!("Failed to open inline store: {e}")))
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[async_trait]
impl ResultStore for InlineStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Inline
    }

    fn uri(&self, key: &str) -> String {
        format!("{URI_SCHEME}{key}")
    }

    fn uploader(&self, key: &str) -> Box<dyn ResultUploader> {
        Box::new(InlineUploader {
            pool: self.pool.clone(),
            key: key.to_string(),
            uri: self.uri(key),
            cap: SizeCap::new(self.max_bytes),
            buffer: String::new(),
            phase: UploadPhase::Created,
            truncated: false,
        })
    }

    async fn open_source(&self, key: &str) -> Result<Box<dyn ResultSource>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT result FROM query_results WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::storage(format!("Failed to read result '{key}': {e}")))?;

        let (text,) =
            row.ok_or_else(|| RelayError::storage(format!("No result stored under '{key}'")))?;
        Ok(Box::new(InlineSource {
            text: Some(Bytes::from(text)),
        }))
    }
}

struct InlineUploader {
    pool: SqlitePool,
    key: String,
    uri: String,
    cap: SizeCap,
    buffer: String,
    phase: UploadPhase,
    truncated: bool,
}

#[async_trait]
impl ResultUploader for InlineUploader {
    async fn start(&mut self) -> Result<()> {
        self.phase.begin()
    }

    async fn write(&mut self, chunk: &str) -> Result<bool> {
        self.phase.ensure_open("write")?;
        if !self.cap.admit(chunk.len()) {
            self.truncated = true;
            return Ok(false);
        }
        self.buffer.push_str(chunk);
        Ok(true)
    }

    async fn end(&mut self) -> Result<ResultStoreEntry> {
        self.phase.ensure_open("end")?;
        self.phase = UploadPhase::Closed;

        let text = std::mem::take(&mut self.buffer);
        let size = text.len() as u64;
        sqlx::query("INSERT OR REPLACE INTO query_results (key, result, size) VALUES (?, ?, ?)")
            .bind(&self.key)
            .bind(text)
            .bind(size as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::upload(format!("Failed to store result '{}': {e}", self.key)))?;

        debug!("Stored {} bytes inline under {}", size, self.key);
        Ok(ResultStoreEntry {
            key: self.key.clone(),
            uri: self.uri.clone(),
            backend: StoreBackend::Inline,
            size,
            complete: true,
            truncated: self.truncated,
        })
    }
}

struct InlineSource {
    text: Option<Bytes>,
}

#[async_trait]
impl ResultSource for InlineSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.text.take())
    }
}
