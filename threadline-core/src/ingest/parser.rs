//! Parser trait abstraction
//!
//! The loader is format-agnostic: it splits a file into lines and hands each
//! one to a [`RecordParser`]. Parsers decide how a line maps to a
//! [`Message`], and whether it is a malformed record or an id-less metadata
//! record that should simply be ignored.
//!
//! ## Design Principles
//!
//! 1. **Lossless capture**: unrecognized record fields are kept in `Message::extra`
//! 2. **Resilience**: a bad line yields a [`SkipReason`], never an error
//! 3. **Determinism**: parsing a line depends only on its bytes and position

use crate::types::Message;
use serde::Serialize;
use std::fmt;

/// Why a line was not turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Line bytes are not valid UTF-8
    InvalidUtf8,
    /// Line is not valid JSON
    InvalidJson(String),
    /// Valid JSON, but not an object
    NotAnObject,
    /// Record has no usable id
    MissingId,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidUtf8 => write!(f, "invalid UTF-8"),
            SkipReason::InvalidJson(e) => write!(f, "JSON parse error: {}", e),
            SkipReason::NotAnObject => write!(f, "record is not a JSON object"),
            SkipReason::MissingId => write!(f, "record has no id"),
        }
    }
}

/// Result of parsing a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Message(Box<Message>),
    /// Well-formed record that carries no message (summary, snapshot, ...)
    Metadata,
    Skip(SkipReason),
}

/// Per-line context supplied by the loader.
#[derive(Debug, Clone, Copy)]
pub struct LineContext<'a> {
    /// Zero-based line index; becomes `Message::file_position`
    pub file_position: u64,
    /// Used when the record carries no session id (usually the file stem)
    pub fallback_session_id: &'a str,
}

/// Trait implemented by every on-disk record format.
pub trait RecordParser: Send + Sync {
    /// Short format name for logs
    fn name(&self) -> &'static str;

    /// Parse one non-blank line.
    fn parse_line(&self, line: &str, ctx: &LineContext<'_>) -> LineOutcome;
}
