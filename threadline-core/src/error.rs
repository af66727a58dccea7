//! Error types for threadline-core
//!
//! Only conditions that make a whole input file unusable are errors. Record
//! level problems (malformed lines, dangling references, cycles, ambiguous
//! matches) are recovered locally and reported through
//! [`Diagnostics`](crate::diagnostics::Diagnostics).

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the threadline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// A session log could not be read at all
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error outside of per-line record parsing
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error that invalidates an entire source
    #[error("parse error in {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A session family could not be analysed
    #[error("family {family} failed: {message}")]
    FamilyFailed { family: String, message: String },

    /// The family worker pool could not be created
    #[error("worker pool error: {0}")]
    Pool(String),
}

impl Error {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for threadline-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path() {
        let err = Error::io(
            "/tmp/missing.jsonl",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/missing.jsonl"));
        assert!(msg.contains("gone"));
    }
}
