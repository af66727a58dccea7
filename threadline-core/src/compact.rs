//! Compact tracer: stitches truncated context back into one timeline
//!
//! A *compact boundary* is a root carrying `logical_parent_id`: the log
//! dropped earlier context and restarted, but the new root logically
//! continues the named message. Boundaries chain: the message a boundary
//! continues may itself sit under an older boundary. For every boundary the
//! tracer computes the ordered list of all boundaries logically preceding it,
//! oldest first, ending with the boundary itself.
//!
//! Resumed sessions are handled the same way at file granularity: the first
//! root of a later family file is linked to an earlier file, either through
//! its own dangling parent id or, failing that, through session-id equality.
//! Those links are heuristic and flagged as such in [`BoundaryKind`].

use crate::diagnostics::Diagnostics;
use crate::graph::{NodeId, RootReason, SessionGraph};
use crate::navigator::nodes_to_root;
use crate::types::{
    BoundaryKind, CompactBoundary, CompactTrigger, ContinuationEvidence, ConversationPath,
    FileIndex, Message, MessageKey, Role,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Marker Claude Code writes into the user message that runs `/compact`.
const COMPACT_COMMAND_TAG: &str = "<command-name>/compact</command-name>";

/// Result of tracing one session graph.
#[derive(Debug, Clone, Default)]
pub struct CompactTrace {
    /// Ordered by family file, then position
    pub boundaries: Vec<CompactBoundary>,
    boundary_nodes: BTreeMap<MessageKey, NodeId>,
    predecessor_nodes: HashMap<MessageKey, NodeId>,
    chains: HashMap<MessageKey, Vec<MessageKey>>,
}

impl CompactTrace {
    /// Find all boundaries in `graph` and resolve their chains.
    pub fn trace(graph: &SessionGraph, diag: &mut Diagnostics) -> Self {
        let mut trace = CompactTrace::default();

        for &root in graph.roots() {
            let message = graph.message(root);
            let Some(logical_parent) = message.logical_parent_id.clone() else {
                continue;
            };
            let file = graph.node(root).file;
            let predecessor = resolve_logical_parent(graph, file, &logical_parent);
            if predecessor.is_none() {
                tracing::warn!(
                    path = %graph.file(file).path.display(),
                    id = %message.id,
                    logical_parent = %logical_parent,
                    "Compact predecessor not found in any loaded file"
                );
                diag.unresolved_compact_predecessors += 1;
                diag.warn(format!(
                    "{}: compact boundary {} continues unknown message {}",
                    graph.file(file).path.display(),
                    message.id,
                    logical_parent
                ));
            }
            trace.insert(
                graph,
                root,
                BoundaryKind::Compact,
                infer_trigger(graph, root),
                logical_parent,
                predecessor,
            );
        }

        for file in 1..graph.files().len() {
            if let Some((root, predecessor, evidence)) = continuation_link(graph, file) {
                if trace.boundary_nodes.contains_key(&graph.key(root)) {
                    continue;
                }
                tracing::debug!(
                    path = %graph.file(file).path.display(),
                    root = %graph.message(root).id,
                    predecessor = %graph.key(predecessor),
                    ?evidence,
                    "Linked continuation file"
                );
                trace.insert(
                    graph,
                    root,
                    BoundaryKind::Continuation { evidence },
                    CompactTrigger::Unknown,
                    graph.message(predecessor).id.clone(),
                    Some(predecessor),
                );
            }
        }

        trace
            .boundaries
            .sort_by_key(|b| trace.boundary_nodes.get(&b.key).copied());
        trace.resolve_chains(graph, diag);

        tracing::debug!(
            boundaries = trace.boundaries.len(),
            "Traced compact boundaries"
        );
        trace
    }

    fn insert(
        &mut self,
        graph: &SessionGraph,
        root: NodeId,
        kind: BoundaryKind,
        trigger: CompactTrigger,
        preceding_message_id: String,
        predecessor: Option<NodeId>,
    ) {
        let key = graph.key(root);
        self.boundary_nodes.insert(key.clone(), root);
        if let Some(p) = predecessor {
            self.predecessor_nodes.insert(key.clone(), p);
        }
        self.boundaries.push(CompactBoundary {
            key,
            kind,
            trigger,
            preceding_message_id,
            resolved_predecessor: predecessor.map(|p| graph.key(p)),
            pre_tokens: pre_tokens(graph.message(root)),
        });
    }

    /// Walk boundary → predecessor-boundary links until nothing changes.
    fn resolve_chains(&mut self, graph: &SessionGraph, diag: &mut Diagnostics) {
        let previous: HashMap<MessageKey, MessageKey> = self
            .predecessor_nodes
            .iter()
            .filter_map(|(boundary, &pred)| {
                let pred_root = graph.key(graph.root_of(pred));
                self.boundary_nodes
                    .contains_key(&pred_root)
                    .then(|| (boundary.clone(), pred_root))
            })
            .collect();

        for boundary in &self.boundaries {
            let mut chain = vec![boundary.key.clone()];
            let mut seen: HashSet<&MessageKey> = HashSet::from([&boundary.key]);
            let mut current = &boundary.key;
            while let Some(prev) = previous.get(current) {
                if !seen.insert(prev) {
                    tracing::warn!(
                        boundary = %boundary.key,
                        "Compact boundaries continue each other in a loop; chain truncated"
                    );
                    diag.warn(format!(
                        "compact chain for {} loops back to {}",
                        boundary.key, prev
                    ));
                    break;
                }
                chain.push(prev.clone());
                current = prev;
            }
            chain.reverse();
            self.chains.insert(boundary.key.clone(), chain);
        }
    }

    pub fn boundary(&self, key: &MessageKey) -> Option<&CompactBoundary> {
        self.boundaries.iter().find(|b| &b.key == key)
    }

    pub fn is_boundary(&self, key: &MessageKey) -> bool {
        self.boundary_nodes.contains_key(key)
    }

    /// Boundaries preceding the boundary rooted at `root`, oldest first,
    /// including that boundary. Empty for non-boundary roots.
    pub fn chain_for(&self, root: &MessageKey) -> &[MessageKey] {
        self.chains.get(root).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fill `compact_chain` on every path rooted at a boundary.
    pub fn annotate(&self, paths: &mut [ConversationPath]) {
        for path in paths.iter_mut() {
            if let Some(root) = path.root_key() {
                path.compact_chain = self.chain_for(&root).to_vec();
            }
        }
    }

    /// The full logical sequence ending at `path`'s leaf.
    ///
    /// Each boundary crossed contributes the predecessor's root-to-message
    /// prefix, oldest first. Ids already emitted (history replayed into a
    /// continuation file) are not repeated.
    pub fn logical_timeline(
        &self,
        graph: &SessionGraph,
        path: &ConversationPath,
    ) -> Vec<MessageKey> {
        let Some(leaf) = path.leaf_key().and_then(|k| graph.find_key(&k)) else {
            return Vec::new();
        };

        let mut segments: Vec<Vec<NodeId>> = vec![nodes_to_root(graph, leaf)];
        let mut root = graph.root_of(leaf);
        let mut visited: HashSet<NodeId> = HashSet::from([root]);
        while let Some(&pred) = self.predecessor_nodes.get(&graph.key(root)) {
            let pred_root = graph.root_of(pred);
            if !visited.insert(pred_root) {
                break;
            }
            segments.push(nodes_to_root(graph, pred));
            root = pred_root;
        }

        let mut emitted: HashSet<&str> = HashSet::new();
        segments
            .iter()
            .rev()
            .flatten()
            .filter(|&&n| emitted.insert(graph.message(n).id.as_str()))
            .map(|&n| graph.key(n))
            .collect()
    }
}

/// Same file first, then earlier files (nearest first), then later ones.
fn resolve_logical_parent(graph: &SessionGraph, file: FileIndex, id: &str) -> Option<NodeId> {
    if let Some(n) = graph.find(file, id) {
        return Some(n);
    }
    (0..file)
        .rev()
        .chain(file + 1..graph.files().len())
        .find_map(|f| graph.find(f, id))
}

/// Link the first root of `file` to an earlier family file.
///
/// Only the lowest-position root qualifies. When it is already a compact
/// boundary or a side-chain, the file gets no continuation link.
fn continuation_link(
    graph: &SessionGraph,
    file: FileIndex,
) -> Option<(NodeId, NodeId, ContinuationEvidence)> {
    let root = graph
        .roots()
        .iter()
        .copied()
        .find(|&r| graph.node(r).file == file)?;
    let message = graph.message(root);
    if message.logical_parent_id.is_some() || message.is_side_chain {
        return None;
    }

    if let Some(RootReason::DanglingParent { original }) = graph.root_reason(root) {
        if let Some(pred) = (0..file).rev().find_map(|f| graph.find(f, original)) {
            return Some((root, pred, ContinuationEvidence::ParentReference));
        }
    }

    let session = message.session_id.as_str();
    (0..file)
        .rev()
        .find_map(|f| graph.last_message_of_session(f, session))
        .map(|pred| (root, pred, ContinuationEvidence::SessionHeuristic))
}

fn compact_metadata(message: &Message) -> Option<&serde_json::Value> {
    message.extra.get("compactMetadata")
}

fn pre_tokens(message: &Message) -> Option<u64> {
    compact_metadata(message)?.get("preTokens")?.as_u64()
}

fn is_compact_command(message: &Message) -> bool {
    if message.role != Role::User {
        return false;
    }
    let text = message.content.text();
    text.contains(COMPACT_COMMAND_TAG) || text.trim_start().starts_with("/compact")
}

fn is_compact_summary(message: &Message) -> bool {
    message.extra_bool("isCompactSummary")
}

/// Recorded trigger first; otherwise look at the records around the boundary.
fn infer_trigger(graph: &SessionGraph, root: NodeId) -> CompactTrigger {
    if let Some(recorded) = compact_metadata(graph.message(root))
        .and_then(|m| m.get("trigger"))
        .and_then(|t| t.as_str())
        .map(CompactTrigger::parse)
    {
        if recorded != CompactTrigger::Unknown {
            return recorded;
        }
    }

    // The record written just before the boundary, and the boundary's first child.
    let range = graph.nodes_in_file(graph.node(root).file);
    let previous = root.checked_sub(1).filter(|n| range.contains(n));
    let first_child = graph.children(root).first().copied();
    let neighbours: Vec<&Message> = [previous, first_child]
        .into_iter()
        .flatten()
        .map(|n| graph.message(n))
        .collect();

    if neighbours.iter().any(|m| is_compact_command(m)) {
        CompactTrigger::Manual
    } else if neighbours.iter().any(|m| is_compact_summary(m)) {
        CompactTrigger::Automatic
    } else {
        CompactTrigger::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::loaded;
    use crate::graph::GraphOptions;
    use crate::navigator::enumerate_paths;

    fn user(id: &str, parent: Option<&str>) -> String {
        let parent = parent
            .map(|p| format!("\"{}\"", p))
            .unwrap_or_else(|| "null".into());
        format!(
            r#"{{"type":"user","uuid":"{}","parentUuid":{},"sessionId":"s1","message":{{"role":"user","content":"text {}"}}}}"#,
            id, parent, id
        )
    }

    fn boundary(id: &str, logical_parent: &str, trigger: Option<&str>) -> String {
        let meta = trigger
            .map(|t| format!(r#","compactMetadata":{{"trigger":"{}","preTokens":1000}}"#, t))
            .unwrap_or_default();
        format!(
            r#"{{"type":"system","subtype":"compact_boundary","uuid":"{}","parentUuid":null,"logicalParentUuid":"{}","sessionId":"s1"{}}}"#,
            id, logical_parent, meta
        )
    }

    fn build(files: &[(&str, Vec<String>)]) -> (SessionGraph, Diagnostics) {
        let mut diag = Diagnostics::new();
        let loaded_files = files
            .iter()
            .map(|(name, lines)| loaded(name, &lines.join("\n")))
            .collect();
        let graph = SessionGraph::build(loaded_files, GraphOptions::default(), &mut diag);
        (graph, diag)
    }

    fn ids(keys: &[MessageKey]) -> Vec<&str> {
        keys.iter().map(|k| k.id.as_str()).collect()
    }

    #[test]
    fn test_single_boundary_stitches_cleanly() {
        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![
                user("a", None),
                user("m", Some("a")),
                user("after-m", Some("m")),
                boundary("b1", "m", Some("manual")),
                user("c", Some("b1")),
            ],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries.len(), 1);
        let b = &trace.boundaries[0];
        assert_eq!(b.trigger, CompactTrigger::Manual);
        assert_eq!(b.preceding_message_id, "m");
        assert_eq!(b.pre_tokens, Some(1000));
        assert_eq!(b.resolved_predecessor, Some(MessageKey::new(0, "m")));

        let mut paths = enumerate_paths(&graph);
        trace.annotate(&mut paths);
        let post = paths.iter().find(|p| p.contains("c")).unwrap();
        assert_eq!(ids(&post.compact_chain), vec!["b1"]);
        let pre = paths.iter().find(|p| p.contains("a")).unwrap();
        assert!(pre.compact_chain.is_empty());

        let timeline = trace.logical_timeline(&graph, post);
        assert_eq!(ids(&timeline), vec!["a", "m", "b1", "c"]);
        assert!(diag.is_clean());
    }

    #[test]
    fn test_three_chained_boundaries() {
        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![
                user("a", None),
                user("a2", Some("a")),
                boundary("b1", "a2", None),
                user("x", Some("b1")),
                boundary("b2", "x", None),
                user("y", Some("b2")),
                boundary("b3", "y", None),
                user("z", Some("b3")),
            ],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        let mut paths = enumerate_paths(&graph);
        trace.annotate(&mut paths);

        let chain_of = |id: &str| {
            let p = paths.iter().find(|p| p.contains(id)).unwrap();
            ids(&p.compact_chain).into_iter().map(String::from).collect::<Vec<_>>()
        };
        assert_eq!(chain_of("x"), vec!["b1"]);
        assert_eq!(chain_of("y"), vec!["b1", "b2"]);
        assert_eq!(chain_of("z"), vec!["b1", "b2", "b3"]);

        let last = paths.iter().find(|p| p.contains("z")).unwrap();
        assert_eq!(
            ids(&trace.logical_timeline(&graph, last)),
            vec!["a", "a2", "b1", "x", "b2", "y", "b3", "z"]
        );
    }

    #[test]
    fn test_unresolved_predecessor_is_retained() {
        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![boundary("b1", "nowhere", None), user("c", Some("b1"))],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries.len(), 1);
        assert_eq!(trace.boundaries[0].resolved_predecessor, None);
        assert_eq!(ids(trace.chain_for(&MessageKey::new(0, "b1"))), vec!["b1"]);
        assert_eq!(diag.unresolved_compact_predecessors, 1);
    }

    #[test]
    fn test_trigger_inferred_from_adjacent_command() {
        let command = r#"{"type":"user","uuid":"cmd","parentUuid":"a","sessionId":"s1","message":{"role":"user","content":"<command-name>/compact</command-name>"}}"#;
        let summary = r#"{"type":"user","uuid":"sum","parentUuid":"b1","sessionId":"s1","isCompactSummary":true,"message":{"role":"user","content":"Summary"}}"#;
        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![
                user("a", None),
                command.to_string(),
                boundary("b1", "cmd", None),
                summary.to_string(),
            ],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries[0].trigger, CompactTrigger::Manual);

        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![user("a", None), boundary("b1", "a", None), summary.to_string()],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries[0].trigger, CompactTrigger::Automatic);

        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![user("a", None), boundary("b1", "a", None)],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries[0].trigger, CompactTrigger::Unknown);
    }

    #[test]
    fn test_trigger_ignores_records_that_are_not_children() {
        // `sum` follows the boundary in the file but hangs off `a`.
        let stray = r#"{"type":"user","uuid":"sum","parentUuid":"a","sessionId":"s1","isCompactSummary":true,"message":{"role":"user","content":"Summary"}}"#;
        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![
                user("a", None),
                boundary("b1", "a", None),
                stray.to_string(),
                user("c", Some("b1")),
            ],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries[0].trigger, CompactTrigger::Unknown);
    }

    #[test]
    fn test_continuation_by_parent_reference() {
        let (graph, mut diag) = build(&[
            ("old.jsonl", vec![user("a", None), user("b", Some("a"))]),
            ("new.jsonl", vec![user("c", Some("b")), user("d", Some("c"))]),
        ]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries.len(), 1);
        let b = &trace.boundaries[0];
        assert_eq!(b.key, MessageKey::new(1, "c"));
        assert_eq!(
            b.kind,
            BoundaryKind::Continuation {
                evidence: ContinuationEvidence::ParentReference
            }
        );
        assert_eq!(b.resolved_predecessor, Some(MessageKey::new(0, "b")));

        let mut paths = enumerate_paths(&graph);
        trace.annotate(&mut paths);
        let resumed = paths.iter().find(|p| p.file == 1).unwrap();
        assert_eq!(
            ids(&trace.logical_timeline(&graph, resumed)),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn test_continuation_by_session_and_replay_dedup() {
        // New file replays `a` under the same session, then continues.
        let (graph, mut diag) = build(&[
            ("old.jsonl", vec![user("a", None), user("b", Some("a"))]),
            ("new.jsonl", vec![user("a", None), user("e", Some("a"))]),
        ]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        let b = &trace.boundaries[0];
        assert_eq!(
            b.kind,
            BoundaryKind::Continuation {
                evidence: ContinuationEvidence::SessionHeuristic
            }
        );
        assert_eq!(b.resolved_predecessor, Some(MessageKey::new(0, "b")));

        let paths = enumerate_paths(&graph);
        let resumed = paths.iter().find(|p| p.file == 1).unwrap();
        assert_eq!(
            ids(&trace.logical_timeline(&graph, resumed)),
            vec!["a", "b", "e"]
        );
    }

    #[test]
    fn test_only_first_root_of_file_continues_earlier_file() {
        // new.jsonl opens with a compact boundary; `m` is a later dangling
        // root and must not be stitched onto old.jsonl.
        let (graph, mut diag) = build(&[
            ("old.jsonl", vec![user("a", None), user("b", Some("a"))]),
            (
                "new.jsonl",
                vec![
                    boundary("b1", "b", None),
                    user("c", Some("b1")),
                    user("m", Some("ghost")),
                    user("n", Some("m")),
                ],
            ),
        ]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.boundaries.len(), 1);
        assert_eq!(trace.boundaries[0].key, MessageKey::new(1, "b1"));
        assert_eq!(trace.boundaries[0].kind, BoundaryKind::Compact);
        assert!(!trace.is_boundary(&MessageKey::new(1, "m")));

        let mut paths = enumerate_paths(&graph);
        trace.annotate(&mut paths);
        let orphan = paths.iter().find(|p| p.contains("n")).unwrap();
        assert!(orphan.compact_chain.is_empty());
        assert_eq!(ids(&trace.logical_timeline(&graph, orphan)), vec!["m", "n"]);

        let compacted = paths.iter().find(|p| p.contains("c")).unwrap();
        assert_eq!(
            ids(&trace.logical_timeline(&graph, compacted)),
            vec!["a", "b", "b1", "c"]
        );
    }

    #[test]
    fn test_side_chain_first_root_gets_no_continuation() {
        let side = r#"{"type":"user","uuid":"s","parentUuid":null,"sessionId":"s1","isSidechain":true,"message":{"role":"user","content":"sub task"}}"#;
        let (graph, mut diag) = build(&[
            ("old.jsonl", vec![user("a", None)]),
            ("agent.jsonl", vec![side.to_string(), user("late", None)]),
        ]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert!(trace.boundaries.is_empty());
    }

    #[test]
    fn test_boundary_loop_terminates() {
        let (graph, mut diag) = build(&[(
            "s1.jsonl",
            vec![
                boundary("b1", "y", None),
                user("x", Some("b1")),
                boundary("b2", "x", None),
                user("y", Some("b2")),
            ],
        )]);
        let trace = CompactTrace::trace(&graph, &mut diag);
        assert_eq!(trace.chain_for(&MessageKey::new(0, "b2")).len(), 2);
        let paths = enumerate_paths(&graph);
        let p = paths.iter().find(|p| p.contains("y")).unwrap();
        let timeline = trace.logical_timeline(&graph, p);
        assert_eq!(ids(&timeline), vec!["b1", "x", "b2", "y"]);
        assert!(!diag.warnings.is_empty());
    }
}
