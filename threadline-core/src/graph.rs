//! DAG builder: loaded messages to an immutable rooted forest
//!
//! [`SessionGraph`] owns every message of a session family in an arena,
//! addressed by [`NodeId`]. Edges only ever connect messages of the same file.
//! Any reference that cannot be trusted is cut and the child becomes a
//! *synthetic root*, so every traversal over the graph terminates:
//!
//! - a `parent_id` that does not name a message seen earlier in the same file
//!   ([`RootReason::DanglingParent`])
//! - a parent chain that loops back on itself ([`RootReason::Cycle`])
//!
//! With [`GraphOptions::allow_forward_parents`] a parent appearing *later* in
//! the file is accepted instead; cycles become possible then and are broken by
//! an ancestor-stack walk.

use crate::diagnostics::Diagnostics;
use crate::ingest::LoadedFile;
use crate::types::{FileIndex, Message, MessageKey};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::PathBuf;

/// Arena index of a message in a [`SessionGraph`].
pub type NodeId = usize;

/// Why a node is a root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RootReason {
    /// The record has no parent
    Declared,
    /// Parent id did not resolve; the original value is kept
    DanglingParent { original: String },
    /// Following the parent would have closed a loop
    Cycle { original: String },
}

impl RootReason {
    pub fn is_synthetic(&self) -> bool {
        !matches!(self, RootReason::Declared)
    }

    /// The parent id the record declared, if it had one.
    pub fn original_parent(&self) -> Option<&str> {
        match self {
            RootReason::Declared => None,
            RootReason::DanglingParent { original } | RootReason::Cycle { original } => {
                Some(original)
            }
        }
    }
}

/// One message plus its resolved structure.
#[derive(Debug, Clone)]
pub struct Node {
    pub message: Message,
    pub file: FileIndex,
    pub parent: Option<NodeId>,
    /// Ordered by `file_position`, ties by id
    pub children: Vec<NodeId>,
    /// Set exactly when `parent` is `None`
    pub root_reason: Option<RootReason>,
}

/// Per-file bookkeeping.
#[derive(Debug, Clone)]
pub struct GraphFile {
    pub path: PathBuf,
    pub session_id: String,
    pub stem: String,
    nodes: Range<NodeId>,
}

/// Builder options.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOptions {
    pub allow_forward_parents: bool,
}

/// Immutable message forest for one session family.
#[derive(Debug, Clone)]
pub struct SessionGraph {
    files: Vec<GraphFile>,
    nodes: Vec<Node>,
    ids: Vec<HashMap<String, NodeId>>,
    roots: Vec<NodeId>,
    side_chain_roots: BTreeMap<String, Vec<NodeId>>,
}

impl SessionGraph {
    /// Build the graph in one pass per file, recording anomalies in `diag`.
    pub fn build(files: Vec<LoadedFile>, options: GraphOptions, diag: &mut Diagnostics) -> Self {
        let mut graph = SessionGraph {
            files: Vec::with_capacity(files.len()),
            nodes: Vec::new(),
            ids: Vec::with_capacity(files.len()),
            roots: Vec::new(),
            side_chain_roots: BTreeMap::new(),
        };

        for (file_index, loaded) in files.into_iter().enumerate() {
            let stem = loaded.stem();
            let start = graph.nodes.len();
            let mut ids: HashMap<String, NodeId> = HashMap::with_capacity(loaded.messages.len());

            for message in loaded.messages {
                let node_id = graph.nodes.len();
                let (parent, root_reason) = if options.allow_forward_parents {
                    // Resolved after every id of the file is known.
                    (None, None)
                } else {
                    resolve_strict(&message, &ids, &loaded.path, diag)
                };
                ids.insert(message.id.clone(), node_id);
                graph.nodes.push(Node {
                    message,
                    file: file_index,
                    parent,
                    children: Vec::new(),
                    root_reason,
                });
            }
            let range = start..graph.nodes.len();

            if options.allow_forward_parents {
                graph.resolve_lenient(range.clone(), &ids, &loaded.path, diag);
                graph.break_cycles(range.clone(), &loaded.path, diag);
            }

            graph.files.push(GraphFile {
                path: loaded.path,
                session_id: loaded.session_id,
                stem,
                nodes: range,
            });
            graph.ids.push(ids);
        }

        graph.link_children();
        graph
    }

    fn resolve_lenient(
        &mut self,
        range: Range<NodeId>,
        ids: &HashMap<String, NodeId>,
        path: &std::path::Path,
        diag: &mut Diagnostics,
    ) {
        for node_id in range {
            let declared = self.nodes[node_id].message.parent_id.clone();
            let Some(parent_id) = declared else {
                self.nodes[node_id].root_reason = Some(RootReason::Declared);
                continue;
            };
            match ids.get(&parent_id) {
                Some(&parent) => {
                    if parent > node_id {
                        diag.forward_references += 1;
                        tracing::debug!(
                            path = %path.display(),
                            id = %self.nodes[node_id].message.id,
                            parent = %parent_id,
                            "Parent appears later in file"
                        );
                    }
                    self.nodes[node_id].parent = Some(parent);
                }
                None => {
                    let reason = dangling(&self.nodes[node_id].message, &parent_id, path, diag);
                    self.nodes[node_id].root_reason = Some(reason);
                }
            }
        }
    }

    /// Walk every parent chain with an ancestor stack; the edge that closes a
    /// loop is dropped and its child becomes a synthetic root.
    fn break_cycles(&mut self, range: Range<NodeId>, path: &std::path::Path, diag: &mut Diagnostics) {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }
        let offset = range.start;
        let mut marks = vec![Mark::Unvisited; range.len()];

        for start in range {
            if marks[start - offset] == Mark::Done {
                continue;
            }
            let mut stack: Vec<NodeId> = Vec::new();
            let mut current = start;
            loop {
                match marks[current - offset] {
                    Mark::Done => break,
                    Mark::OnStack => {
                        // `stack.last()` points back into its own ancestry.
                        if let Some(&child) = stack.last() {
                            let original = self.nodes[child]
                                .message
                                .parent_id
                                .clone()
                                .unwrap_or_default();
                            tracing::warn!(
                                path = %path.display(),
                                id = %self.nodes[child].message.id,
                                parent = %original,
                                "Parent chain forms a cycle; dropping edge"
                            );
                            diag.cycles += 1;
                            diag.warn(format!(
                                "{}: cycle through {} -> {}; edge dropped",
                                path.display(),
                                self.nodes[child].message.id,
                                original
                            ));
                            self.nodes[child].parent = None;
                            self.nodes[child].root_reason = Some(RootReason::Cycle { original });
                        }
                        break;
                    }
                    Mark::Unvisited => {
                        marks[current - offset] = Mark::OnStack;
                        stack.push(current);
                        match self.nodes[current].parent {
                            Some(parent) => current = parent,
                            None => break,
                        }
                    }
                }
            }
            for node in stack {
                marks[node - offset] = Mark::Done;
            }
        }
    }

    fn link_children(&mut self) {
        for node_id in 0..self.nodes.len() {
            match self.nodes[node_id].parent {
                Some(parent) => self.nodes[parent].children.push(node_id),
                None => {
                    self.roots.push(node_id);
                    let message = &self.nodes[node_id].message;
                    if message.is_side_chain {
                        self.side_chain_roots
                            .entry(message.session_id.clone())
                            .or_default()
                            .push(node_id);
                    }
                }
            }
        }

        // Children are already in arena (file) order; the explicit sort pins
        // the tie rule for equal positions: ascending id.
        for node_id in 0..self.nodes.len() {
            let mut children = std::mem::take(&mut self.nodes[node_id].children);
            children.sort_by(|&a, &b| {
                let (ma, mb) = (&self.nodes[a].message, &self.nodes[b].message);
                ma.file_position
                    .cmp(&mb.file_position)
                    .then_with(|| ma.id.cmp(&mb.id))
            });
            self.nodes[node_id].children = children;
        }
    }

    // ============================================
    // Lookup
    // ============================================

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn message(&self, id: NodeId) -> &Message {
        &self.nodes[id].message
    }

    pub fn key(&self, id: NodeId) -> MessageKey {
        MessageKey::new(self.nodes[id].file, self.nodes[id].message.id.clone())
    }

    pub fn files(&self) -> &[GraphFile] {
        &self.files
    }

    pub fn file(&self, index: FileIndex) -> &GraphFile {
        &self.files[index]
    }

    /// Node ids of one file, in file order.
    pub fn nodes_in_file(&self, index: FileIndex) -> Range<NodeId> {
        self.files[index].nodes.clone()
    }

    pub fn find(&self, file: FileIndex, id: &str) -> Option<NodeId> {
        self.ids.get(file)?.get(id).copied()
    }

    pub fn find_key(&self, key: &MessageKey) -> Option<NodeId> {
        self.find(key.file, &key.id)
    }

    /// Every node carrying `id`, in family file order.
    pub fn find_anywhere(&self, id: &str) -> Vec<NodeId> {
        self.ids.iter().filter_map(|m| m.get(id).copied()).collect()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    /// Child message ids of `parent_id` in `file`, latest last.
    pub fn children_of(&self, file: FileIndex, parent_id: &str) -> Vec<&str> {
        self.find(file, parent_id)
            .map(|p| {
                self.children(p)
                    .iter()
                    .map(|&c| self.nodes[c].message.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All roots, family file order then position.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].children.is_empty()
    }

    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).filter(move |&n| self.is_leaf(n))
    }

    pub fn root_reason(&self, id: NodeId) -> Option<&RootReason> {
        self.nodes[id].root_reason.as_ref()
    }

    /// `id` and its ancestors, nearest first, ending at the root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_> {
        Ancestors {
            graph: self,
            next: Some(id),
        }
    }

    pub fn root_of(&self, id: NodeId) -> NodeId {
        self.ancestors(id).last().unwrap_or(id)
    }

    /// Roots of inline side-chain runs for a session.
    pub fn side_chain_roots(&self, session_id: &str) -> &[NodeId] {
        self.side_chain_roots
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every side-chain root in the family, file order.
    pub fn all_side_chain_roots(&self) -> Vec<NodeId> {
        let mut all: Vec<NodeId> = self.side_chain_roots.values().flatten().copied().collect();
        all.sort_unstable();
        all
    }

    /// The highest-position message of `file` belonging to `session_id`.
    pub fn last_message_of_session(&self, file: FileIndex, session_id: &str) -> Option<NodeId> {
        self.nodes_in_file(file)
            .rev()
            .find(|&n| self.nodes[n].message.session_id == session_id)
    }
}

/// Iterator returned by [`SessionGraph::ancestors`].
pub struct Ancestors<'a> {
    graph: &'a SessionGraph,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.next?;
        self.next = self.graph.nodes[current].parent;
        Some(current)
    }
}

fn resolve_strict(
    message: &Message,
    seen: &HashMap<String, NodeId>,
    path: &std::path::Path,
    diag: &mut Diagnostics,
) -> (Option<NodeId>, Option<RootReason>) {
    let Some(parent_id) = message.parent_id.as_deref() else {
        return (None, Some(RootReason::Declared));
    };

    if parent_id == message.id {
        tracing::warn!(
            path = %path.display(),
            id = %message.id,
            "Message names itself as parent; dropping edge"
        );
        diag.cycles += 1;
        diag.warn(format!("{}: {} is its own parent", path.display(), message.id));
        return (
            None,
            Some(RootReason::Cycle {
                original: parent_id.to_string(),
            }),
        );
    }

    match seen.get(parent_id) {
        Some(&parent) => (Some(parent), None),
        None => (None, Some(dangling(message, parent_id, path, diag))),
    }
}

fn dangling(
    message: &Message,
    parent_id: &str,
    path: &std::path::Path,
    diag: &mut Diagnostics,
) -> RootReason {
    tracing::warn!(
        path = %path.display(),
        id = %message.id,
        parent = %parent_id,
        "Parent not found; treating message as synthetic root"
    );
    diag.dangling_parents += 1;
    diag.warn(format!(
        "{}: {} references missing parent {}",
        path.display(),
        message.id,
        parent_id
    ));
    RootReason::DanglingParent {
        original: parent_id.to_string(),
    }
}
