//! Read session for one stored result.
//!
//! Streams are lazy and bounded. A reader hands out its byte source once:
//! after `read_lines` or `get_csv_iter` it cannot be read again.

use super::csv::{is_complete_record, parse_record};
use super::{ResultSource, ResultStore, StoreBackend};
use crate::error::{RelayError, Result};
use crate::utf8::LineAssembler;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

/// Rows returned when the caller does not ask for a limit: a header plus 2000 rows.
pub const DEFAULT_READ_LIMIT: usize = 2001;

pub struct ResultReader {
    store: Arc<dyn ResultStore>,
    key: String,
    source: Option<Box<dyn ResultSource>>,
    started: bool,
}

impl ResultReader {
    pub fn new(store: Arc<dyn ResultStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            source: None,
            started: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opens the underlying result. Fails if nothing is stored under the key.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(RelayError::internal("reader already started"));
        }
        self.source = Some(self.store.open_source(&self.key).await?);
        self.started = true;
        debug!("Reading result {}", self.key);
        Ok(())
    }

    fn take_source(&mut self) -> Result<Box<dyn ResultSource>> {
        if !self.started {
            return Err(RelayError::internal("reader used before start"));
        }
        self.source
            .take()
            .ok_or_else(|| RelayError::internal("result stream was already consumed"))
    }

    /// Streams at most `limit` text lines (default [`DEFAULT_READ_LIMIT`]).
    pub fn read_lines(&mut self, limit: Option<usize>) -> BoxStream<'static, Result<String>> {
        let limit = limit.unwrap_or(DEFAULT_READ_LIMIT);
        match self.take_source() {
            Ok(source) => lines(source, LineAssembler::new(), limit),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    /// Streams at most `limit` CSV records (default [`DEFAULT_READ_LIMIT`]).
    ///
    /// Quoted fields containing line breaks are reassembled into one record.
    pub fn get_csv_iter(&mut self, limit: Option<usize>) -> BoxStream<'static, Result<Vec<String>>> {
        let limit = limit.unwrap_or(DEFAULT_READ_LIMIT);
        let source = match self.take_source() {
            Ok(source) => source,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };

        let raw_lines = lines(source, LineAssembler::new().keep_carriage_returns(), usize::MAX);
        stream::try_unfold((raw_lines, 0usize), move |(mut lines, emitted)| async move {
            if emitted >= limit {
                return Ok(None);
            }
            let mut record = match lines.next().await {
                Some(line) => line?,
                None => return Ok(None),
            };
            while !is_complete_record(&record) {
                match lines.next().await {
                    Some(line) => {
                        record.push('\n');
                        record.push_str(&line?);
                    }
                    None => {
                        return Err(RelayError::storage(
                            "result ended inside a quoted CSV field",
                        ))
                    }
                }
            }
            if record.ends_with('\r') {
                record.pop();
            }
            Ok(Some((parse_record(&record), (lines, emitted + 1))))
        })
        .boxed()
    }

    pub fn has_download_url(&self) -> bool {
        self.store.backend() == StoreBackend::ObjectPresigned
    }

    /// Presigned URL that downloads the result as `filename`.
    pub async fn get_download_url(&self, filename: &str) -> Result<String> {
        self.store
            .download_url(&self.key, filename)
            .await?
            .ok_or_else(|| {
                RelayError::storage(format!(
                    "The {} store does not provide download URLs",
                    self.store.backend()
                ))
            })
    }

    /// Releases the underlying source.
    pub fn end(&mut self) {
        self.source = None;
    }
}

struct LineState {
    source: Box<dyn ResultSource>,
    assembler: LineAssembler,
    emitted: usize,
    exhausted: bool,
}

fn lines(
    source: Box<dyn ResultSource>,
    assembler: LineAssembler,
    limit: usize,
) -> BoxStream<'static, Result<String>> {
    let state = LineState {
        source,
        assembler,
        emitted: 0,
        exhausted: false,
    };

    stream::try_unfold(state, move |mut state| async move {
        loop {
            if state.emitted >= limit {
                return Ok(None);
            }
            if let Some(line) = state.assembler.next_line() {
                state.emitted += 1;
                return Ok(Some((line, state)));
            }
            if state.exhausted {
                return Ok(None);
            }
            match state.source.next_chunk().await? {
                Some(chunk) => state.assembler.push(&chunk)?,
                None => {
                    state.assembler.finish()?;
                    state.exhausted = true;
                }
            }
        }
    })
    .boxed()
}
