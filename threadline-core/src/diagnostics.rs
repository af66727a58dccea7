//! Advisory report of everything recovered during a run
//!
//! Nothing recorded here aborts analysis. Counts are kept in ordered maps so
//! two runs over identical input serialize to identical reports.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-run anomaly counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Malformed lines skipped, per file
    pub skipped_lines: BTreeMap<PathBuf, usize>,
    /// Id-less metadata records (summaries, snapshots), per file
    pub ignored_metadata: BTreeMap<PathBuf, usize>,
    /// Records dropped because their id was already used in the same file
    pub duplicate_ids: usize,
    /// Nodes reclassified as synthetic roots because the parent was missing
    pub dangling_parents: usize,
    /// Parents accepted even though they appear later in the file
    pub forward_references: usize,
    pub cycles: usize,
    pub unresolved_compact_predecessors: usize,
    pub unmatched_task_invocations: usize,
    pub ambiguous_subagent_matches: usize,
    /// Sidecar session files that could not be read
    pub unreadable_sidecars: usize,
    /// Human-readable detail lines, in the order they were raised
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the per-file loader counts. Zero counts are still recorded so
    /// every loaded file appears in the report.
    pub fn record_file(&mut self, path: &Path, skipped: usize, ignored: usize) {
        *self.skipped_lines.entry(path.to_path_buf()).or_default() += skipped;
        *self.ignored_metadata.entry(path.to_path_buf()).or_default() += ignored;
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn total_skipped_lines(&self) -> usize {
        self.skipped_lines.values().sum()
    }

    /// True when no anomaly of any kind was recorded.
    pub fn is_clean(&self) -> bool {
        self.total_skipped_lines() == 0
            && self.duplicate_ids == 0
            && self.dangling_parents == 0
            && self.forward_references == 0
            && self.cycles == 0
            && self.unresolved_compact_predecessors == 0
            && self.ambiguous_subagent_matches == 0
            && self.unreadable_sidecars == 0
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: &Diagnostics) {
        for (path, n) in &other.skipped_lines {
            *self.skipped_lines.entry(path.clone()).or_default() += n;
        }
        for (path, n) in &other.ignored_metadata {
            *self.ignored_metadata.entry(path.clone()).or_default() += n;
        }
        self.duplicate_ids += other.duplicate_ids;
        self.dangling_parents += other.dangling_parents;
        self.forward_references += other.forward_references;
        self.cycles += other.cycles;
        self.unresolved_compact_predecessors += other.unresolved_compact_predecessors;
        self.unmatched_task_invocations += other.unmatched_task_invocations;
        self.ambiguous_subagent_matches += other.ambiguous_subagent_matches;
        self.unreadable_sidecars += other.unreadable_sidecars;
        self.warnings.extend(other.warnings.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_clean() {
        assert!(Diagnostics::new().is_clean());
    }

    #[test]
    fn test_unmatched_invocations_do_not_dirty_report() {
        let diag = Diagnostics {
            unmatched_task_invocations: 3,
            ..Default::default()
        };
        assert!(diag.is_clean());
    }

    #[test]
    fn test_merge_sums_counts() {
        let mut a = Diagnostics::new();
        a.record_file(Path::new("a.jsonl"), 1, 0);
        a.cycles = 1;

        let mut b = Diagnostics::new();
        b.record_file(Path::new("a.jsonl"), 2, 1);
        b.record_file(Path::new("b.jsonl"), 0, 0);
        b.cycles = 2;
        b.warn("something");

        a.merge(&b);
        assert_eq!(a.skipped_lines[Path::new("a.jsonl")], 3);
        assert_eq!(a.skipped_lines[Path::new("b.jsonl")], 0);
        assert_eq!(a.ignored_metadata[Path::new("a.jsonl")], 1);
        assert_eq!(a.cycles, 3);
        assert_eq!(a.total_skipped_lines(), 3);
        assert_eq!(a.warnings, vec!["something".to_string()]);
        assert!(!a.is_clean());
    }
}
