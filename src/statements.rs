//! Statement-range splitting for multi-statement SQL documents.
//!
//! Uses the sqlparser tokenizer so separators inside string literals, quoted
//! identifiers and comments are ignored. Each range remembers where it starts
//! so positions reported by an engine for an isolated statement can be mapped
//! back into the original document.

use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt;
use tracing::debug;

/// A 1-based line/column position in SQL text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    /// Creates a position from 1-based line and column numbers.
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Half-open byte range of one statement within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRange {
    /// Byte offset of the first token of the statement.
    pub start: usize,
    /// Byte offset of the separator, or the end of the document.
    pub end: usize,
    /// Line of `start` in the document (1-based).
    pub start_line: usize,
    /// Column of `start` in the document (1-based, in characters).
    pub start_column: usize,
}

impl StatementRange {
    /// Returns the statement text from the document it was split from.
    pub fn text<'a>(&self, document: &'a str) -> &'a str {
        &document[self.start..self.end]
    }

    /// Translates a position relative to this statement into document coordinates.
    ///
    /// Only the first line of a statement is shifted horizontally; later lines
    /// start at column 1 in both coordinate spaces.
    pub fn map_position(&self, position: Position) -> Position {
        let line = self.start_line + position.line.saturating_sub(1);
        let column = if position.line <= 1 {
            self.start_column + position.column.saturating_sub(1)
        } else {
            position.column
        };
        Position { line, column }
    }
}

/// Splits a SQL document into statement ranges.
///
/// Leading whitespace and comments are skipped when computing a range's start;
/// the range ends at the `;` separator (excluded) or at end of input. Segments
/// without any SQL token are dropped. If the text cannot be tokenized (for
/// example an unterminated literal) the whole trimmed text is one statement,
/// so the engine gets to report the error.
pub fn split_statements(text: &str) -> Vec<StatementRange> {
    let dialect = GenericDialect {};
    let tokens = match Tokenizer::new(&dialect, text).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            debug!("Tokenizer rejected SQL, treating it as one statement: {e}");
            return whole_text(text).into_iter().collect();
        }
    };

    let mut walker = LocationWalker::new(text);
    let mut ranges = Vec::new();
    let mut current: Option<(usize, Position)> = None;

    for token in &tokens {
        let line = token.location.line as usize;
        let column = token.location.column as usize;
        match &token.token {
            Token::Whitespace(_) => {}
            Token::SemiColon => {
                let offset = walker.advance_to(line, column);
                if let Some((start, at)) = current.take() {
                    ranges.push(range(start, offset, at));
                }
            }
            _ => {
                if current.is_none() {
                    let offset = walker.advance_to(line, column);
                    current = Some((offset, Position::new(line, column)));
                }
            }
        }
    }

    if let Some((start, at)) = current {
        ranges.push(range(start, text.len(), at));
    }
    ranges
}

/// Converts a 1-based character offset inside `text` into a line/column position.
///
/// Some engines (PostgreSQL) report errors as a character index into the
/// statement rather than a line/column pair.
pub fn position_at_char(text: &str, char_offset: usize) -> Position {
    let mut position = Position::new(1, 1);
    for ch in text.chars().take(char_offset.saturating_sub(1)) {
        if ch == '\n' {
            position.line += 1;
            position.column = 1;
        } else {
            position.column += 1;
        }
    }
    position
}

fn range(start: usize, end: usize, at: Position) -> StatementRange {
    StatementRange {
        start,
        end,
        start_line: at.line,
        start_column: at.column,
    }
}

fn whole_text(text: &str) -> Option<StatementRange> {
    let start = text.find(|c: char| !c.is_whitespace())?;
    let at = position_at_char(text, text[..start].chars().count() + 1);
    Some(range(start, text.len(), at))
}

/// Walks the text forward to translate tokenizer locations into byte offsets.
///
/// Token locations arrive in ascending order, so a single forward pass keeps
/// the conversion linear in the document size.
struct LocationWalker<'a> {
    text: &'a str,
    line: usize,
    column: usize,
    offset: usize,
}

impl<'a> LocationWalker<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            line: 1,
            column: 1,
            offset: 0,
        }
    }

    fn advance_to(&mut self, line: usize, column: usize) -> usize {
        while (self.line, self.column) < (line, column) {
            let Some(ch) = self.text[self.offset..].chars().next() else {
                break;
            };
            self.offset += ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.offset
    }
}
