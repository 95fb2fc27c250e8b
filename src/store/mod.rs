//! Result store: persists statement results as CSV and streams them back.
//!
//! Writers go through a [`ResultUploader`] session (`start`, `write`, `end`);
//! readers go through a [`ResultReader`]. Each backend implements
//! [`ResultStore`], which hands out both.

pub mod csv;
pub mod inline;
pub mod object;
pub mod presign;
pub mod reader;

pub use inline::InlineStore;
pub use object::ObjectResultStore;
pub use presign::S3Presigner;
pub use reader::{ResultReader, DEFAULT_READ_LIMIT};

use crate::config::{StoreConfig, StoreKind};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Storage strategy behind a stored result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Result text kept in a database row.
    Inline,
    /// Object store blob written with multipart uploads.
    ObjectMultipart,
    /// Object store blob with presigned download URLs.
    ObjectPresigned,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::ObjectMultipart => "object_multipart",
            Self::ObjectPresigned => "object_presigned",
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to a persisted result, returned by [`ResultUploader::end`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultStoreEntry {
    pub key: String,
    pub uri: String,
    pub backend: StoreBackend,
    /// Bytes actually persisted.
    pub size: u64,
    /// The upload was finalized and the blob is readable.
    pub complete: bool,
    /// Writes were refused because the byte cap was reached.
    pub truncated: bool,
}

/// Write session for one result.
///
/// `write` returns `false` without persisting anything from that chunk when
/// the chunk would exceed the byte cap. `end` finalizes whatever was accepted.
#[async_trait]
pub trait ResultUploader: Send {
    async fn start(&mut self) -> Result<()>;

    async fn write(&mut self, chunk: &str) -> Result<bool>;

    async fn end(&mut self) -> Result<ResultStoreEntry>;
}

/// Raw byte chunks of a stored result, in order.
#[async_trait]
pub trait ResultSource: Send {
    /// Returns the next chunk, or `None` once the result is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// A storage backend for results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Stable URI of the result stored under `key`.
    fn uri(&self, key: &str) -> String;

    /// Recovers the key from a URI produced by [`ResultStore::uri`].
    fn key_from_uri(&self, uri: &str) -> Option<String> {
        uri.strip_prefix(&self.uri(""))
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    fn uploader(&self, key: &str) -> Box<dyn ResultUploader>;

    async fn open_source(&self, key: &str) -> Result<Box<dyn ResultSource>>;

    /// Time-limited download URL that names the file `filename`.
    async fn download_url(&self, _key: &str, _filename: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Opens a write session for `key`.
pub fn open_uploader(store: &Arc<dyn ResultStore>, key: &str) -> Box<dyn ResultUploader> {
    store.uploader(key)
}

/// Opens a read session for `key`. Call [`ResultReader::start`] before reading.
pub fn open_reader(store: &Arc<dyn ResultStore>, key: &str) -> ResultReader {
    ResultReader::new(store.clone(), key)
}

/// Blob key of one statement's result.
pub fn result_key(prefix: &str, query_id: &str, statement_index: usize) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{query_id}/{statement_index}/result.csv")
    } else {
        format!("{prefix}/{query_id}/{statement_index}/result.csv")
    }
}

/// Builds the store selected by the configuration.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn ResultStore>> {
    match config.backend {
        StoreKind::Inline => {
            let store = InlineStore::open(config.inline_path.as_deref(), config.max_bytes).await?;
            Ok(Arc::new(store))
        }
        StoreKind::Object => {
            let url = config.object_url.as_deref().ok_or_else(|| {
                RelayError::config("store.object_url is required for the object backend")
            })?;
            let mut store = ObjectResultStore::from_url(url, &config.object_options)?
                .with_max_bytes(config.max_bytes)
                .with_part_size(config.part_size);
            if let Some(presign) = &config.presign {
                store = store.with_presigner(S3Presigner::from_config(presign)?);
            }
            Ok(Arc::new(store))
        }
    }
}

/// Byte budget of one upload session. A cap of 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCap {
    max: Option<u64>,
    written: u64,
}

impl SizeCap {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max: (max_bytes > 0).then_some(max_bytes),
            written: 0,
        }
    }

    /// Accounts for `len` more bytes, or returns false if they do not fit.
    pub fn admit(&mut self, len: usize) -> bool {
        let next = self.written + len as u64;
        if self.max.is_some_and(|max| next > max) {
            return false;
        }
        self.written = next;
        true
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Lifecycle of an upload session, shared by the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UploadPhase {
    Created,
    Open,
    Closed,
}

impl UploadPhase {
    pub(crate) fn begin(&mut self) -> Result<()> {
        if *self != UploadPhase::Created {
            return Err(RelayError::internal("upload session already started"));
        }
        *self = UploadPhase::Open;
        Ok(())
    }

    pub(crate) fn ensure_open(&self, operation: &str) -> Result<()> {
        match self {
            UploadPhase::Open => Ok(()),
            UploadPhase::Created => Err(RelayError::internal(format!(
                "{operation} called before start"
            ))),
            UploadPhase::Closed => Err(RelayError::internal(format!(
                "{operation} called after end"
            ))),
        }
    }
}
