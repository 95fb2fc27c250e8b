//! Object store backend (`s3://`, `gs://`, `file://`, `memory://`).
//!
//! Uploads are multipart: text is buffered until `part_size` bytes are ready,
//! then sent as one part. A result that never fills a part is written with a
//! single `put` instead. Any failure aborts the multipart upload.

use super::{
    ResultSource, ResultStore, ResultStoreEntry, ResultUploader, S3Presigner, SizeCap,
    StoreBackend, UploadPhase,
};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Smallest part most S3-compatible services accept (except the last one).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Results stored as blobs under a root path.
#[derive(Debug, Clone)]
pub struct ObjectResultStore {
    store: Arc<dyn ObjectStore>,
    root: Path,
    base_uri: String,
    max_bytes: u64,
    part_size: usize,
    presigner: Option<S3Presigner>,
}

impl ObjectResultStore {
    /// Wraps an existing store. `base_uri` prefixes the URI of every result.
    pub fn new(store: Arc<dyn ObjectStore>, root: Path, base_uri: impl Into<String>) -> Self {
        let mut base_uri = base_uri.into();
        if !base_uri.ends_with('/') {
            base_uri.push('/');
        }
        Self {
            store,
            root,
            base_uri,
            max_bytes: 0,
            part_size: MIN_PART_SIZE,
            presigner: None,
        }
    }

    /// Builds the store from a URL such as `s3://bucket/prefix`.
    pub fn from_url(url: &str, options: &HashMap<String, String>) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| RelayError::config(format!("Invalid object store URL '{url}': {e}")))?;
        let (store, root) = object_store::parse_url_opts(&parsed, options.iter()).map_err(|e| {
            RelayError::config(format!("Unsupported object store URL '{url}': {e}"))
        })?;
        Ok(Self::new(Arc::from(store), root, url))
    }

    /// An empty in-process store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), Path::default(), "memory:///")
    }

    /// Byte cap per result. 0 means unlimited.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_presigner(mut self, presigner: S3Presigner) -> Self {
        self.presigner = Some(presigner);
        self
    }

    fn location(&self, key: &str) -> Path {
        let key = Path::from(key);
        Path::from_iter(self.root.parts().chain(key.parts()))
    }
}

#[async_trait]
impl ResultStore for ObjectResultStore {
    fn backend(&self) -> StoreBackend {
        if self.presigner.is_some() {
            StoreBackend::ObjectPresigned
        } else {
            StoreBackend::ObjectMultipart
        }
    }

    fn uri(&self, key: &str) -> String {
        format!("{}{}", self.base_uri, key)
    }

    fn uploader(&self, key: &str) -> Box<dyn ResultUploader> {
        Box::new(ObjectUploader {
            store: self.store.clone(),
            location: self.location(key),
            key: key.to_string(),
            uri: self.uri(key),
            backend: self.backend(),
            cap: SizeCap::new(self.max_bytes),
            part_size: self.part_size,
            buffer: Vec::new(),
            upload: None,
            parts: 0,
            phase: UploadPhase::Created,
            truncated: false,
            failed: false,
        })
    }

    async fn open_source(&self, key: &str) -> Result<Box<dyn ResultSource>> {
        let location = self.location(key);
        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => {
                RelayError::storage(format!("No result stored under '{key}'"))
            }
            other => RelayError::storage(format!("Failed to read {location}: {other}")),
        })?;
        Ok(Box::new(ObjectSource {
            location,
            stream: result.into_stream(),
        }))
    }

    async fn download_url(&self, key: &str, filename: &str) -> Result<Option<String>> {
        self.presigner
            .as_ref()
            .map(|presigner| presigner.presign_get(self.location(key).as_ref(), filename))
            .transpose()
    }
}

struct ObjectUploader {
    store: Arc<dyn ObjectStore>,
    location: Path,
    key: String,
    uri: String,
    backend: StoreBackend,
    cap: SizeCap,
    part_size: usize,
    buffer: Vec<u8>,
    upload: Option<Box<dyn MultipartUpload>>,
    parts: usize,
    phase: UploadPhase,
    truncated: bool,
    failed: bool,
}

impl ObjectUploader {
    async fn send_part(&mut self) -> Result<()> {
        let Some(upload) = self.upload.as_mut() else {
            return Err(RelayError::internal("multipart upload is not open"));
        };
        let data = std::mem::take(&mut self.buffer);
        let len = data.len();
        if let Err(e) = upload.put_part(PutPayload::from(data)).await {
            self.abort().await;
            return Err(RelayError::upload(format!(
                "Failed to upload part {} of {}: {e}",
                self.parts + 1,
                self.location
            )));
        }
        self.parts += 1;
        debug!("Uploaded part {} ({} bytes) of {}", self.parts, len, self.location);
        Ok(())
    }

    async fn abort(&mut self) {
        self.failed = true;
        if let Some(mut upload) = self.upload.take() {
            if let Err(e) = upload.abort().await {
                warn!("Failed to abort multipart upload of {}: {e}", self.location);
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        if self.parts == 0 {
            // Nothing was sent as a part; a plain put covers empty and small results.
            if let Some(mut upload) = self.upload.take() {
                if let Err(e) = upload.abort().await {
                    warn!("Failed to abort multipart upload of {}: {e}", self.location);
                }
            }
            let data = std::mem::take(&mut self.buffer);
            self.store
                .put(&self.location, PutPayload::from(data))
                .await
                .map_err(|e| RelayError::upload(format!("Failed to write {}: {e}", self.location)))?;
            return Ok(());
        }

        if !self.buffer.is_empty() {
            self.send_part().await?;
        }
        let Some(upload) = self.upload.as_mut() else {
            return Err(RelayError::internal("multipart upload is not open"));
        };
        if let Err(e) = upload.complete().await {
            self.abort().await;
            return Err(RelayError::upload(format!(
                "Failed to complete upload of {}: {e}",
                self.location
            )));
        }
        self.upload = None;
        Ok(())
    }
}

#[async_trait]
impl ResultUploader for ObjectUploader {
    async fn start(&mut self) -> Result<()> {
        self.phase.begin()?;
        let upload = self.store.put_multipart(&self.location).await.map_err(|e| {
            RelayError::upload(format!("Failed to start upload of {}: {e}", self.location))
        })?;
        self.upload = Some(upload);
        Ok(())
    }

    async fn write(&mut self, chunk: &str) -> Result<bool> {
        self.phase.ensure_open("write")?;
        if self.failed {
            return Err(RelayError::upload(format!(
                "Upload of {} was aborted",
                self.location
            )));
        }
        if !self.cap.admit(chunk.len()) {
            self.truncated = true;
            return Ok(false);
        }
        self.buffer.extend_from_slice(chunk.as_bytes());
        if self.buffer.len() >= self.part_size {
            self.send_part().await?;
        }
        Ok(true)
    }

    async fn end(&mut self) -> Result<ResultStoreEntry> {
        self.phase.ensure_open("end")?;
        self.phase = UploadPhase::Closed;

        if self.failed {
            return Err(RelayError::upload(format!(
                "Upload of {} was aborted",
                self.location
            )));
        }
        self.finish().await?;

        Ok(ResultStoreEntry {
            key: self.key.clone(),
            uri: self.uri.clone(),
            backend: self.backend,
            size: self.cap.written(),
            complete: true,
            truncated: self.truncated,
        })
    }
}

impl Drop for ObjectUploader {
    fn drop(&mut self) {
        if self.upload.is_some() {
            warn!("Upload of {} dropped before end()", self.location);
        }
    }
}

struct ObjectSource {
    location: Path,
    stream: BoxStream<'static, object_store::Result<Bytes>>,
}

#[async_trait]
impl ResultSource for ObjectSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.stream
            .next()
            .await
            .transpose()
            .map_err(|e| RelayError::storage(format!("Failed to read {}: {e}", self.location)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn read_all(store: &ObjectResultStore, key: &str) -> String {
        let mut source = store.open_source(key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let store = ObjectResultStore::in_memory().with_part_size(4);
        let mut uploader = store.uploader("results/q/0/result.csv");
        uploader.start().await.unwrap();
        for chunk in ["id,name\n", "1,a\n", "2,b\n", "3"] {
            assert!(uploader.write(chunk).await.unwrap());
        }
        let entry = uploader.end().await.unwrap();

        assert_eq!(entry.backend, StoreBackend::ObjectMultipart);
        assert_eq!(entry.size, 17);
        assert_eq!(entry.uri, "memory:///results/q/0/result.csv");
        assert_eq!(
            read_all(&store, "results/q/0/result.csv").await,
            "id,name\n1,a\n2,b\n3"
        );
    }

    #[tokio::test]
    async fn test_small_and_empty_results_use_put() {
        let store = ObjectResultStore::in_memory();
        let mut uploader = store.uploader("small");
        uploader.start().await.unwrap();
        uploader.write("a\n").await.unwrap();
        assert_eq!(uploader.end().await.unwrap().size, 2);
        assert_eq!(read_all(&store, "small").await, "a\n");

        let mut uploader = store.uploader("empty");
        uploader.start().await.unwrap();
        assert_eq!(uploader.end().await.unwrap().size, 0);
        assert_eq!(read_all(&store, "empty").await, "");
    }

    #[tokio::test]
    async fn test_byte_cap_truncates() {
        let store = ObjectResultStore::in_memory().with_max_bytes(5);
        let mut uploader = store.uploader("k");
        uploader.start().await.unwrap();
        assert!(uploader.write("abc").await.unwrap());
        assert!(!uploader.write("def").await.unwrap());
        let entry = uploader.end().await.unwrap();
        assert!(entry.truncated);
        assert_eq!(read_all(&store, "k").await, "abc");
    }

    #[tokio::test]
    async fn test_missing_result() {
        let store = ObjectResultStore::in_memory();
        let err = store.open_source("missing").await.err().unwrap();
        assert_eq!(err, RelayError::storage("No result stored under 'missing'"));
    }

    #[tokio::test]
    async fn test_file_url_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let store = ObjectResultStore::from_url(&url, &HashMap::new())
            .unwrap()
            .with_part_size(3);

        let mut uploader = store.uploader("q/0/result.csv");
        uploader.start().await.unwrap();
        uploader.write("x,y\n").await.unwrap();
        uploader.write("1,2\n").await.unwrap();
        let entry = uploader.end().await.unwrap();

        assert_eq!(entry.uri, format!("{url}/q/0/result.csv"));
        assert_eq!(store.key_from_uri(&entry.uri), Some("q/0/result.csv".to_string()));
        assert!(dir.path().join("q/0/result.csv").exists());
        assert_eq!(read_all(&store, "q/0/result.csv").await, "x,y\n1,2\n");
    }

    #[tokio::test]
    async fn test_presigned_backend() {
        let presigner =
            S3Presigner::new("http://localhost:9000", "bucket", "us-east-1", "a", "s").unwrap();
        let store = ObjectResultStore::in_memory().with_presigner(presigner);
        assert_eq!(store.backend(), StoreBackend::ObjectPresigned);

        let url = store.download_url("q/0/result.csv", "out.csv").await.unwrap().unwrap();
        assert!(url.starts_with("http://localhost:9000/bucket/q/0/result.csv?"));

        let plain = ObjectResultStore::in_memory();
        assert!(plain.download_url("k", "out.csv").await.unwrap().is_none());
    }
}
