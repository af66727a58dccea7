//! Format-specific record parsers
//!
//! Each supported log format has a module implementing
//! [`RecordParser`](super::RecordParser).
//!
//! | Format | Module |
//! |--------|--------|
//! | Claude Code JSONL | [`claude`] |

mod claude;

pub use claude::{normalize_id, ClaudeJsonlParser};

use super::RecordParser;

/// Parser used when the caller does not pick one.
pub fn default_parser() -> Box<dyn RecordParser> {
    Box::new(ClaudeJsonlParser::new())
}
