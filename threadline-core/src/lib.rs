//! # threadline-core
//!
//! Reconstructs the conversation structure of AI coding-assistant sessions
//! from append-only JSONL logs.
//!
//! Message records do not form a list. Edits fork the history, compaction
//! starts new roots that logically continue old messages, resumed sessions
//! replay history into new files, and spawned subagents run either inline as
//! side-chains or in files of their own. This library turns such a family of
//! files into a set of root-to-leaf [`ConversationPath`]s, each marked active
//! or abandoned and annotated with its compact lineage and subagent link.
//!
//! ## Architecture
//!
//! Analysis runs as read-only passes over an immutable graph:
//! - **Loader** ([`ingest`]): lines to [`Message`]s, skipping malformed records
//! - **Graph** ([`graph`]): parent/child forest with synthetic roots for
//!   dangling parents and cycles
//! - **Navigator** ([`navigator`]): one path per leaf, active/abandoned
//! - **Compact tracer** ([`compact`]): boundary chains and logical timelines
//! - **Subagent mapper** ([`subagent`]): prompt-hash matching of task invocations
//!
//! Record-level problems never abort a run; they are collected in
//! [`Diagnostics`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use threadline_core::{analysis::discover_families, Analyzer, Config};
//! use std::path::Path;
//!
//! let config = Config::load().expect("failed to load config");
//! let families = discover_families(Path::new("/path/to/logs")).expect("discovery failed");
//!
//! let analyzer = Analyzer::new(config.analysis);
//! for outcome in analyzer.analyze_all(&families).expect("pool failed") {
//!     if let Some(analysis) = outcome.analysis() {
//!         println!("{}: {} active paths", analysis.family.name, analysis.active_paths().count());
//!     }
//! }
//! ```

// Re-export commonly used items at the crate root
pub use analysis::{Analyzer, FamilyAnalysis, FamilyOutcome, FamilyReport, SessionFamily};
pub use config::Config;
pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use graph::{GraphOptions, SessionGraph};
pub use types::*;

// Public modules
pub mod analysis;
pub mod compact;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod logging;
pub mod navigator;
pub mod subagent;
pub mod types;
