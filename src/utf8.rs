//! UTF-8 boundary guard for chunked byte streams.
//!
//! Result text arrives from fixed-size read buffers (object store bodies,
//! WebHDFS downloads) that can end in the middle of a multi-byte character.
//! The guard splits each buffer into a valid prefix and a 0-3 byte leftover
//! that is carried into the next chunk.

use crate::error::{RelayError, Result};
use std::collections::VecDeque;

/// Maximum number of bytes a well-formed leftover can hold.
const MAX_RESIDUAL_BYTES: usize = 3;

/// Splits `bytes` into `(valid_prefix, leftover_suffix)`.
///
/// The suffix is non-empty only when the buffer ends inside a multi-byte
/// sequence. A buffer without any start byte (only continuation bytes) is
/// returned entirely as leftover.
pub fn guard_utf8_chunk(bytes: &[u8]) -> (&[u8], &[u8]) {
    let Some(start) = bytes.iter().rposition(|b| !is_continuation(*b)) else {
        return (&bytes[..0], bytes);
    };

    let tail = bytes.len() - start;
    match sequence_len(bytes[start]) {
        Some(expected) if tail < expected => bytes.split_at(start),
        // Complete, or malformed in a way the validator will report.
        _ => (bytes, &bytes[bytes.len()..]),
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// Length of the sequence announced by a lead byte.
fn sequence_len(lead: u8) -> Option<usize> {
    if lead & 0b1000_0000 == 0 {
        Some(1)
    } else if lead & 0b1110_0000 == 0b1100_0000 {
        Some(2)
    } else if lead & 0b1111_0000 == 0b1110_0000 {
        Some(3)
    } else if lead & 0b1111_1000 == 0b1111_0000 {
        Some(4)
    } else {
        None
    }
}

/// Stateful guard for one byte stream.
///
/// Owns the residual bytes between calls. Call [`Utf8ChunkGuard::finish`] when
/// the source is exhausted so a truncated trailing character is reported.
#[derive(Debug, Default)]
pub struct Utf8ChunkGuard {
    residual: Vec<u8>,
    consumed: u64,
}

impl Utf8ChunkGuard {
    /// Creates a guard with no pending bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the next chunk and returns the text that is safe to emit.
    ///
    /// Bytes that may belong to a character continued by the next chunk are
    /// retained. Invalid UTF-8 in the emitted prefix is an error.
    pub fn push(&mut self, chunk: &[u8]) -> Result<String> {
        let mut buffer = std::mem::take(&mut self.residual);
        buffer.extend_from_slice(chunk);

        let (prefix, suffix) = guard_utf8_chunk(&buffer);
        if suffix.len() > MAX_RESIDUAL_BYTES {
            return Err(RelayError::utf8(format!(
                "{} continuation bytes without a lead byte near offset {}",
                suffix.len(),
                self.consumed
            )));
        }

        let text = std::str::from_utf8(prefix)
            .map_err(|e| {
                RelayError::utf8(format!(
                    "invalid sequence at offset {}: {e}",
                    self.consumed + e.valid_up_to() as u64
                ))
            })?
            .to_string();

        self.consumed += prefix.len() as u64;
        self.residual = suffix.to_vec();
        Ok(text)
    }

    /// Returns the number of bytes currently held back.
    pub fn pending(&self) -> usize {
        self.residual.len()
    }

    /// Ends the stream. Leftover bytes mean the input was truncated.
    pub fn finish(self) -> Result<()> {
        if self.residual.is_empty() {
            Ok(())
        } else {
            Err(RelayError::utf8(format!(
                "stream ended with {} byte(s) of an incomplete character at offset {}",
                self.residual.len(),
                self.consumed
            )))
        }
    }
}

/// Splits a chunked byte stream into text lines.
///
/// Lines end at `\n`; a trailing `\r` is stripped unless the assembler was
/// built with [`LineAssembler::keep_carriage_returns`]. The final line does
/// not need a terminator.
#[derive(Debug, Default)]
pub struct LineAssembler {
    guard: Utf8ChunkGuard,
    partial: String,
    ready: VecDeque<String>,
    keep_cr: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaves a `\r` before each `\n` in place, for callers that join lines
    /// back into multi-line records.
    pub fn keep_carriage_returns(mut self) -> Self {
        self.keep_cr = true;
        self
    }

    /// Feeds the next chunk of bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        let text = self.guard.push(chunk)?;
        self.partial.push_str(&text);
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop();
            if !self.keep_cr && line.ends_with('\r') {
                line.pop();
            }
            self.ready.push_back(line);
        }
        Ok(())
    }

    /// Returns the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    /// Flushes the unterminated last line. Fails if the stream was cut inside a character.
    pub fn finish(&mut self) -> Result<()> {
        std::mem::take(&mut self.guard).finish()?;
        if !self.partial.is_empty() {
            let mut line = std::mem::take(&mut self.partial);
            if !self.keep_cr && line.ends_with('\r') {
                line.pop();
            }
            self.ready.push_back(line);
        }
        Ok(())
    }
}
