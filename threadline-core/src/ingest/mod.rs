//! Record loader: session log files to [`Message`] sequences
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  Session files  │ ──► │    load_file     │ ──► │   LoadedFile    │
//! │   (*.jsonl)     │     │  (line splitter) │     │ messages + skips│
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//!                               │
//!                               ▼
//!                    ┌──────────────────────┐
//!                    │  RecordParser        │
//!                    │  └─ ClaudeJsonlParser│
//!                    └──────────────────────┘
//! ```
//!
//! Files are read fully into memory and split on `\n` at the byte level, so
//! one line with invalid UTF-8 costs that line only. An unreadable file is the
//! only error this module returns.

mod parser;
pub mod parsers;

pub use parser::{LineContext, LineOutcome, RecordParser, SkipReason};

use crate::error::{Error, Result};
use crate::types::Message;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// A line the loader could not turn into a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLine {
    /// Zero-based line index
    pub line: u64,
    pub reason: SkipReason,
}

/// Everything loaded from one session file.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    /// Session id of the first message, or the file stem
    pub session_id: String,
    /// In file order (strictly increasing `file_position`)
    pub messages: Vec<Message>,
    pub skipped: Vec<SkippedLine>,
    /// Well-formed records without a message (summaries, snapshots)
    pub ignored_metadata: usize,
    /// Records dropped because their id was already used earlier in the file
    pub duplicate_ids: usize,
}

impl LoadedFile {
    /// File name without extension (e.g. `agent-a1a93487`).
    pub fn stem(&self) -> String {
        file_stem(&self.path)
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn first_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.messages.iter().find_map(|m| m.timestamp)
    }

    /// True when the file holds nothing but side-chain messages
    /// (a standalone subagent transcript).
    pub fn is_side_chain_only(&self) -> bool {
        !self.messages.is_empty() && self.messages.iter().all(|m| m.is_side_chain)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Load a session file with the default (Claude Code JSONL) parser.
pub fn load_file(path: &Path) -> Result<LoadedFile> {
    load_file_with(path, parsers::default_parser().as_ref())
}

/// Load a session file with a specific parser.
pub fn load_file_with(path: &Path, parser: &dyn RecordParser) -> Result<LoadedFile> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    let loaded = parse_bytes(path, &bytes, parser);

    tracing::debug!(
        path = %path.display(),
        parser = parser.name(),
        messages = loaded.messages.len(),
        skipped = loaded.skipped.len(),
        ignored = loaded.ignored_metadata,
        "Loaded session file"
    );

    Ok(loaded)
}

/// Parse already-read file contents.
///
/// `path` is only used for naming (session id fallback and log fields).
pub fn parse_bytes(path: &Path, bytes: &[u8], parser: &dyn RecordParser) -> LoadedFile {
    let stem = file_stem(path);
    let mut messages: Vec<Message> = Vec::new();
    let mut skipped = Vec::new();
    let mut ignored_metadata = 0;
    let mut duplicate_ids = 0;
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (index, raw_line) in bytes.split(|b| *b == b'\n').enumerate() {
        let file_position = index as u64;
        let raw_line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);

        let line = match std::str::from_utf8(raw_line) {
            Ok(l) => l,
            Err(_) => {
                tracing::warn!(
                    path = %path.display(),
                    line = file_position,
                    "Skipping line with invalid UTF-8"
                );
                skipped.push(SkippedLine {
                    line: file_position,
                    reason: SkipReason::InvalidUtf8,
                });
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let ctx = LineContext {
            file_position,
            fallback_session_id: &stem,
        };

        match parser.parse_line(line, &ctx) {
            LineOutcome::Message(message) => {
                if !seen_ids.insert(message.id.clone()) {
                    tracing::warn!(
                        path = %path.display(),
                        line = file_position,
                        id = %message.id,
                        "Skipping record with duplicate id"
                    );
                    duplicate_ids += 1;
                    continue;
                }
                messages.push(*message);
            }
            LineOutcome::Metadata => ignored_metadata += 1,
            LineOutcome::Skip(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    line = file_position,
                    reason = %reason,
                    "Skipping malformed line"
                );
                skipped.push(SkippedLine {
                    line: file_position,
                    reason,
                });
            }
        }
    }

    let session_id = messages
        .first()
        .map(|m| m.session_id.clone())
        .unwrap_or_else(|| stem.clone());

    LoadedFile {
        path: path.to_path_buf(),
        session_id,
        messages,
        skipped,
        ignored_metadata,
        duplicate_ids,
    }
}

/// List the `*.jsonl` session files directly inside `dir`, sorted by path.
pub fn discover_session_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("*.jsonl");
    let pattern_str = pattern.to_string_lossy();

    let entries = glob::glob(&pattern_str).map_err(|e| Error::Parse {
        source_name: dir.display().to_string(),
        message: format!("Invalid glob pattern: {}", e),
    })?;

    let mut files: Vec<PathBuf> = entries.flatten().filter(|p| p.is_file()).collect();
    files.sort();
    Ok(files)
}
