//! Path navigator: root-to-leaf paths and active/abandoned classification
//!
//! Every leaf yields exactly one [`ConversationPath`], found by walking
//! `parent` links up to the root and reversing. A path is *active* when, at
//! every fork it passes through, it took the child with the greatest
//! `file_position`: the newest rewrite supersedes earlier attempts. Anything
//! else is abandoned, and `diverged_at` names the first fork where it left
//! the active branch.
//!
//! Activity is never stored on a message; it is recomputed from positions on
//! every traversal.

use crate::graph::{NodeId, SessionGraph};
use crate::types::ConversationPath;

/// The child that continues the active branch at `node`.
///
/// Children are kept ordered by position (ties by id), so this is the last one.
pub fn latest_child(graph: &SessionGraph, node: NodeId) -> Option<NodeId> {
    graph.children(node).last().copied()
}

/// Node ids from the root down to `leaf`.
pub fn nodes_to_root(graph: &SessionGraph, leaf: NodeId) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = graph.ancestors(leaf).collect();
    nodes.reverse();
    nodes
}

/// Build the path ending at `leaf`.
///
/// `leaf` need not actually be a leaf; the path then simply stops there.
pub fn path_for_leaf(graph: &SessionGraph, leaf: NodeId) -> ConversationPath {
    let nodes = nodes_to_root(graph, leaf);

    let diverged_at = nodes.windows(2).find_map(|pair| {
        let (parent, child) = (pair[0], pair[1]);
        (latest_child(graph, parent) != Some(child)).then(|| graph.message(parent).id.clone())
    });

    ConversationPath {
        file: graph.node(leaf).file,
        message_ids: nodes
            .iter()
            .map(|&n| graph.message(n).id.clone())
            .collect(),
        is_active: diverged_at.is_none(),
        diverged_at,
        compact_chain: Vec::new(),
        spawn_link: None,
    }
}

/// Enumerate one path per leaf, in leaf order (family file order, then position).
pub fn enumerate_paths(graph: &SessionGraph) -> Vec<ConversationPath> {
    let paths: Vec<ConversationPath> = graph.leaves().map(|leaf| path_for_leaf(graph, leaf)).collect();

    tracing::debug!(
        paths = paths.len(),
        active = paths.iter().filter(|p| p.is_active).count(),
        "Enumerated conversation paths"
    );

    paths
}

/// Follow the latest child from `root` until a leaf.
pub fn active_path_from(graph: &SessionGraph, root: NodeId) -> Vec<NodeId> {
    let mut nodes = vec![root];
    let mut current = root;
    while let Some(next) = latest_child(graph, current) {
        nodes.push(next);
        current = next;
    }
    nodes
}

/// Nodes with more than one child, in arena order.
pub fn fork_points(graph: &SessionGraph) -> Vec<NodeId> {
    (0..graph.len())
        .filter(|&n| graph.children(n).len() > 1)
        .collect()
}

/// Only the active paths.
pub fn active_paths(paths: &[ConversationPath]) -> impl Iterator<Item = &ConversationPath> {
    paths.iter().filter(|p| p.is_active)
}
