//! Analysis pipeline: session families in, annotated path sets out
//!
//! ```text
//! family files ─► load ─► SessionGraph ─► enumerate_paths ─┐
//!                                 │                        ▼
//!                                 ├──► CompactTrace ──► annotate
//!                                 └──► map_subagents ─► annotate ─► FamilyAnalysis
//! ```
//!
//! Each family is analysed on one thread against its own graph. Independent
//! families run in parallel on a bounded rayon pool; a family whose files
//! cannot be read fails alone.

use crate::compact::CompactTrace;
use crate::config::AnalysisConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::graph::{GraphOptions, SessionGraph};
use crate::ingest::{discover_session_files, load_file, LoadedFile};
use crate::navigator::enumerate_paths;
use crate::subagent::{self, SessionFingerprint};
use crate::types::{CompactBoundary, ConversationPath, MessageKey, SubagentMapping};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// An original session file plus the files continuing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFamily {
    pub name: String,
    /// Family order: original first, continuations after
    pub files: Vec<PathBuf>,
    /// Other session files in the same directory, searched for subagent runs
    pub sidecars: Vec<PathBuf>,
}

impl SessionFamily {
    pub fn new(name: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            files,
            sidecars: Vec::new(),
        }
    }

    pub fn with_sidecars(mut self, sidecars: Vec<PathBuf>) -> Self {
        self.sidecars = sidecars;
        self
    }
}

/// Group loaded files into families.
///
/// Two files belong together when they share a session id, or when one holds
/// a message whose parent (or logical parent) only exists in the other.
/// Files inside a family are ordered by first timestamp, then path; families
/// by their first file. Every file outside a family is one of its sidecars.
pub fn group_families(files: &[LoadedFile]) -> Vec<SessionFamily> {
    let mut sets = DisjointSet::new(files.len());

    let mut by_session: HashMap<&str, usize> = HashMap::new();
    let mut by_id: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, file) in files.iter().enumerate() {
        for message in &file.messages {
            let first = *by_session.entry(message.session_id.as_str()).or_insert(index);
            sets.union(first, index);
            by_id.entry(message.id.as_str()).or_default().push(index);
        }
    }

    for (index, file) in files.iter().enumerate() {
        let own: HashSet<&str> = file.messages.iter().map(|m| m.id.as_str()).collect();
        let references = file
            .messages
            .iter()
            .flat_map(|m| [m.parent_id.as_deref(), m.logical_parent_id.as_deref()])
            .flatten()
            .filter(|id| !own.contains(id));
        for id in references {
            for &other in by_id.get(id).into_iter().flatten() {
                sets.union(index, other);
            }
        }
    }

    let order_key = |i: usize| (files[i].first_timestamp(), files[i].path.clone());

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for index in 0..files.len() {
        groups.entry(sets.find(index)).or_default().push(index);
    }
    let mut groups: Vec<Vec<usize>> = groups.into_values().collect();
    for group in &mut groups {
        // `None` timestamps sort first, which keeps empty files ahead of
        // their continuations.
        group.sort_by_key(|&i| order_key(i));
    }
    groups.sort_by_key(|group| order_key(group[0]));

    groups
        .into_iter()
        .map(|group| {
            let members: HashSet<usize> = group.iter().copied().collect();
            let sidecars = (0..files.len())
                .filter(|i| !members.contains(i))
                .map(|i| files[i].path.clone())
                .collect();
            SessionFamily::new(
                files[group[0]].session_id.clone(),
                group.iter().map(|&i| files[i].path.clone()).collect(),
            )
            .with_sidecars(sidecars)
        })
        .collect()
}

/// Load every `*.jsonl` file in `dir` and group the readable ones.
pub fn discover_families(dir: &Path) -> Result<Vec<SessionFamily>> {
    let paths = discover_session_files(dir)?;
    let mut loaded = Vec::with_capacity(paths.len());
    for path in &paths {
        match load_file(path) {
            Ok(file) => loaded.push(file),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Skipping unreadable session file during discovery"
            ),
        }
    }

    let families = group_families(&loaded);
    tracing::info!(
        dir = %dir.display(),
        files = loaded.len(),
        families = families.len(),
        "Discovered session families"
    );
    Ok(families)
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Lower index wins so roots are stable across runs.
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }
}

/// Everything reconstructed for one family.
#[derive(Debug, Clone)]
pub struct FamilyAnalysis {
    pub family: SessionFamily,
    pub graph: SessionGraph,
    /// One per leaf, in leaf order
    pub paths: Vec<ConversationPath>,
    pub trace: CompactTrace,
    pub mappings: Vec<SubagentMapping>,
    pub diagnostics: Diagnostics,
}

impl FamilyAnalysis {
    pub fn boundaries(&self) -> &[CompactBoundary] {
        &self.trace.boundaries
    }

    pub fn active_paths(&self) -> impl Iterator<Item = &ConversationPath> {
        crate::navigator::active_paths(&self.paths)
    }

    /// Full logical sequence for `path`, compact predecessors included.
    pub fn timeline(&self, path: &ConversationPath) -> Vec<MessageKey> {
        self.trace.logical_timeline(&self.graph, path)
    }

    pub fn report(&self) -> FamilyReport {
        FamilyReport {
            name: self.family.name.clone(),
            files: self.family.files.clone(),
            messages: self.graph.len(),
            active_paths: self.active_paths().count(),
            paths: self.paths.clone(),
            boundaries: self.trace.boundaries.clone(),
            mappings: self.mappings.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

/// Serializable summary of a [`FamilyAnalysis`], handed to formatters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyReport {
    pub name: String,
    pub files: Vec<PathBuf>,
    pub messages: usize,
    pub active_paths: usize,
    pub paths: Vec<ConversationPath>,
    pub boundaries: Vec<CompactBoundary>,
    pub mappings: Vec<SubagentMapping>,
    pub diagnostics: Diagnostics,
}

impl FamilyReport {
    /// Pretty-printed JSON, as written by the report formatters.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Result of one family in a batch.
#[derive(Debug)]
pub enum FamilyOutcome {
    Analyzed(Box<FamilyAnalysis>),
    Failed { family: String, error: Error },
}

impl FamilyOutcome {
    pub fn analysis(&self) -> Option<&FamilyAnalysis> {
        match self {
            FamilyOutcome::Analyzed(a) => Some(a),
            FamilyOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FamilyOutcome::Failed { .. })
    }
}

/// Runs the passes over session families.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyse one family.
    ///
    /// Fails only when one of the family's own files cannot be read.
    /// Unreadable sidecars are recorded in the diagnostics and skipped.
    pub fn analyze(&self, family: &SessionFamily) -> Result<FamilyAnalysis> {
        let mut diagnostics = Diagnostics::new();

        let mut loaded = Vec::with_capacity(family.files.len());
        for path in &family.files {
            let file = load_file(path).map_err(|e| {
                tracing::error!(
                    family = %family.name,
                    path = %path.display(),
                    error = %e,
                    "Family file unreadable"
                );
                Error::FamilyFailed {
                    family: family.name.clone(),
                    message: e.to_string(),
                }
            })?;
            diagnostics.record_file(&file.path, file.skipped_count(), file.ignored_metadata);
            diagnostics.duplicate_ids += file.duplicate_ids;
            loaded.push(file);
        }

        let mut fingerprints: Vec<SessionFingerprint> = loaded
            .iter()
            .enumerate()
            .filter(|(_, file)| file.is_side_chain_only())
            .map(|(index, file)| SessionFingerprint::from_graph_file(file, index))
            .collect();
        fingerprints.extend(self.sidecar_fingerprints(&family.sidecars, &mut diagnostics));

        let graph = SessionGraph::build(
            loaded,
            GraphOptions {
                allow_forward_parents: self.config.allow_forward_parents,
            },
            &mut diagnostics,
        );

        let mut paths = enumerate_paths(&graph);
        let trace = CompactTrace::trace(&graph, &mut diagnostics);
        trace.annotate(&mut paths);
        let mappings = subagent::map_subagents(&graph, &fingerprints, &self.config, &mut diagnostics);
        subagent::annotate(&mut paths, &mappings);

        tracing::info!(
            family = %family.name,
            files = family.files.len(),
            messages = graph.len(),
            paths = paths.len(),
            boundaries = trace.boundaries.len(),
            mappings = mappings.len(),
            skipped_lines = diagnostics.total_skipped_lines(),
            "Analysed session family"
        );

        Ok(FamilyAnalysis {
            family: family.clone(),
            graph,
            paths,
            trace,
            mappings,
            diagnostics,
        })
    }

    fn sidecar_fingerprints(
        &self,
        sidecars: &[PathBuf],
        diagnostics: &mut Diagnostics,
    ) -> Vec<SessionFingerprint> {
        let mut fingerprints = Vec::with_capacity(sidecars.len());
        for path in sidecars {
            match load_file(path) {
                Ok(file) => fingerprints.push(SessionFingerprint::from_loaded(&file)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable sidecar session"
                    );
                    diagnostics.unreadable_sidecars += 1;
                    diagnostics.warn(format!("sidecar {} unreadable: {}", path.display(), e));
                }
            }
        }
        fingerprints
    }

    /// Analyse independent families in parallel, at most `max_workers` at a
    /// time. Outcomes come back in input order.
    pub fn analyze_all(&self, families: &[SessionFamily]) -> Result<Vec<FamilyOutcome>> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if self.config.max_workers > 0 {
            builder = builder.num_threads(self.config.max_workers);
        }
        let pool = builder.build().map_err(|e| Error::Pool(e.to_string()))?;

        let outcomes: Vec<FamilyOutcome> = pool.install(|| {
            families
                .par_iter()
                .map(|family| match self.analyze(family) {
                    Ok(analysis) => FamilyOutcome::Analyzed(Box::new(analysis)),
                    Err(error) => FamilyOutcome::Failed {
                        family: family.name.clone(),
                        error,
                    },
                })
                .collect()
        });

        let failed = outcomes.iter().filter(|o| o.is_failed()).count();
        tracing::info!(
            families = families.len(),
            failed,
            workers = pool.current_num_threads(),
            "Batch analysis complete"
        );
        Ok(outcomes)
    }
}
