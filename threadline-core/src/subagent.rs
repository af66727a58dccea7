//! Subagent mapper: task invocations to the sessions they spawned
//!
//! A task invocation is a `tool_use` content block naming one of the
//! configured task tools, with a `prompt` in its input. Its prompt is
//! normalized (trimmed, lowercased, whitespace collapsed) and hashed with
//! SHA-256; the hash is then looked up in two candidate pools, in order:
//!
//! 1. inline side-chain runs in the invoking file, keyed by the hash of the
//!    run's root message;
//! 2. separate session files, keyed by the hash of their first user message.
//!
//! Several candidates with the same hash are resolved by proximity: the
//! closest one starting after the invocation wins. Each candidate is claimed
//! at most once, so a prompt issued twice maps to two different runs.
//!
//! The pass is a pure function of the graph and the fingerprints; it holds no
//! registry between runs.

use crate::config::AnalysisConfig;
use crate::diagnostics::Diagnostics;
use crate::graph::{NodeId, SessionGraph};
use crate::ingest::LoadedFile;
use crate::types::{
    Content, ConversationPath, FileIndex, MappingSource, MessageKey, Role, SubagentMapping,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;

/// Trim, lowercase and collapse internal whitespace runs to one space.
pub fn normalize_prompt(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex SHA-256 of the normalized prompt.
pub fn prompt_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_prompt(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Prompt hash of a message payload, string or block list alike.
pub fn content_hash(content: &Content) -> String {
    prompt_hash(&content.text())
}

/// A recognised task invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInvocation {
    pub node: NodeId,
    pub tool_use_id: Option<String>,
    pub prompt_hash: String,
    pub subagent_type: Option<String>,
}

/// Scan every message for task-tool `tool_use` blocks, in graph order.
pub fn find_invocations(graph: &SessionGraph, config: &AnalysisConfig) -> Vec<TaskInvocation> {
    let mut invocations = Vec::new();
    for node in 0..graph.len() {
        for block in graph.message(node).content.blocks() {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                continue;
            }
            let Some(name) = block.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            if !config.is_task_tool(name) {
                continue;
            }
            let Some(input) = block.get("input") else {
                continue;
            };
            let Some(prompt) = input.get("prompt") else {
                continue;
            };
            invocations.push(TaskInvocation {
                node,
                tool_use_id: block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                prompt_hash: content_hash(&Content::from_json(Some(prompt))),
                subagent_type: input
                    .get("subagent_type")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            });
        }
    }
    invocations
}

/// What the mapper needs to know about a separate session file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFingerprint {
    pub path: PathBuf,
    pub session_id: String,
    pub stem: String,
    /// Hash of the first user message, if the file has one
    pub first_user_hash: Option<String>,
    pub first_timestamp: Option<DateTime<Utc>>,
    /// Root of the file's first user message when the file is part of the graph
    pub graph_root: Option<MessageKey>,
}

impl SessionFingerprint {
    pub fn from_loaded(file: &LoadedFile) -> Self {
        let first_user = file.messages.iter().find(|m| m.role == Role::User);
        Self {
            path: file.path.clone(),
            session_id: file.session_id.clone(),
            stem: file.stem(),
            first_user_hash: first_user.map(|m| content_hash(&m.content)),
            first_timestamp: file.first_timestamp(),
            graph_root: None,
        }
    }

    /// Fingerprint of a file that is also loaded into the graph at `index`.
    pub fn from_graph_file(file: &LoadedFile, index: FileIndex) -> Self {
        let mut fingerprint = Self::from_loaded(file);
        fingerprint.graph_root = file
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| MessageKey::new(index, m.id.clone()));
        fingerprint
    }

    /// Standalone subagent files often reuse the parent's session id; the
    /// file stem (`agent-…`) identifies them then.
    fn child_session_id(&self, parent_session_id: &str) -> String {
        if self.session_id.is_empty() || self.session_id == parent_session_id {
            self.stem.clone()
        } else {
            self.session_id.clone()
        }
    }
}

/// Ordering key: candidates starting after the invocation first, closest first.
fn proximity(invocation: u64, candidate: u64) -> (u8, u64) {
    if candidate > invocation {
        (0, candidate - invocation)
    } else {
        (1, invocation - candidate)
    }
}

fn time_proximity(invocation: Option<DateTime<Utc>>, candidate: Option<DateTime<Utc>>) -> (u8, u64) {
    match (invocation, candidate) {
        (Some(i), Some(c)) => {
            let delta = (c - i).num_milliseconds();
            if delta >= 0 {
                (0, delta.unsigned_abs())
            } else {
                (1, delta.unsigned_abs())
            }
        }
        _ => (2, 0),
    }
}

/// Match every invocation in `graph` against inline runs and `sidecars`.
pub fn map_subagents(
    graph: &SessionGraph,
    sidecars: &[SessionFingerprint],
    config: &AnalysisConfig,
    diag: &mut Diagnostics,
) -> Vec<SubagentMapping> {
    let invocations = find_invocations(graph, config);
    let inline_pool: Vec<(NodeId, String)> = graph
        .all_side_chain_roots()
        .into_iter()
        .map(|root| (root, content_hash(&graph.message(root).content)))
        .collect();

    let mut claimed_inline: HashSet<NodeId> = HashSet::new();
    let mut claimed_files: HashSet<usize> = HashSet::new();
    let mut mappings = Vec::new();

    for invocation in &invocations {
        let message = graph.message(invocation.node);
        let file = graph.node(invocation.node).file;
        let parent_session_id = message.session_id.clone();
        let base = |child_session_id: String, source: MappingSource, child_root: Option<MessageKey>| {
            SubagentMapping {
                parent_session_id: parent_session_id.clone(),
                parent_message_id: message.id.clone(),
                tool_use_id: invocation.tool_use_id.clone(),
                child_session_id,
                prompt_hash: invocation.prompt_hash.clone(),
                subagent_type: invocation.subagent_type.clone(),
                source,
                child_root,
            }
        };

        let mut inline: Vec<NodeId> = inline_pool
            .iter()
            .filter(|(root, hash)| {
                graph.node(*root).file == file
                    && *hash == invocation.prompt_hash
                    && !claimed_inline.contains(root)
            })
            .map(|(root, _)| *root)
            .collect();
        inline.sort_by_key(|&root| {
            (
                proximity(message.file_position, graph.message(root).file_position),
                root,
            )
        });

        if let Some(&root) = inline.first() {
            if inline.len() > 1 {
                report_ambiguity(diag, &message.id, inline.len());
            }
            claimed_inline.insert(root);
            let child_session_id = format!(
                "{}{}{}",
                parent_session_id,
                config.sidechain_prefix,
                graph.message(root).id
            );
            mappings.push(base(
                child_session_id,
                MappingSource::InlineSideChain,
                Some(graph.key(root)),
            ));
            continue;
        }

        let own_path = &graph.file(file).path;
        let mut files: Vec<usize> = sidecars
            .iter()
            .enumerate()
            .filter(|(i, fp)| {
                fp.first_user_hash.as_deref() == Some(invocation.prompt_hash.as_str())
                    && &fp.path != own_path
                    && !claimed_files.contains(i)
            })
            .map(|(i, _)| i)
            .collect();
        files.sort_by(|&a, &b| {
            let key = |i: usize| time_proximity(message.timestamp, sidecars[i].first_timestamp);
            key(a)
                .cmp(&key(b))
                .then_with(|| sidecars[a].path.cmp(&sidecars[b].path))
        });

        if let Some(&index) = files.first() {
            if files.len() > 1 {
                report_ambiguity(diag, &message.id, files.len());
            }
            claimed_files.insert(index);
            let fingerprint = &sidecars[index];
            mappings.push(base(
                fingerprint.child_session_id(&parent_session_id),
                MappingSource::SessionFile {
                    path: fingerprint.path.clone(),
                },
                fingerprint.graph_root.clone(),
            ));
            continue;
        }

        tracing::debug!(
            message = %message.id,
            tool_use_id = ?invocation.tool_use_id,
            "Task invocation has no matching subagent session"
        );
        diag.unmatched_task_invocations += 1;
    }

    tracing::debug!(
        invocations = invocations.len(),
        mapped = mappings.len(),
        "Mapped subagent invocations"
    );
    mappings
}

fn report_ambiguity(diag: &mut Diagnostics, message_id: &str, candidates: usize) {
    tracing::warn!(
        message = %message_id,
        candidates,
        "Several subagent sessions match one invocation; picking the nearest"
    );
    diag.ambiguous_subagent_matches += 1;
    diag.warn(format!(
        "invocation {} matched {} candidate sessions; nearest chosen",
        message_id, candidates
    ));
}

/// Attach each mapping to the path(s) rooted at its child root.
pub fn annotate(paths: &mut [ConversationPath], mappings: &[SubagentMapping]) {
    for path in paths.iter_mut() {
        let Some(root) = path.root_key() else {
            continue;
        };
        path.spawn_link = mappings
            .iter()
            .find(|m| m.child_root.as_ref() == Some(&root))
            .cloned();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::loaded;
    use crate::graph::GraphOptions;
    use crate::navigator::enumerate_paths;

    fn task(id: &str, parent: Option<&str>, prompt: &str, ts: &str) -> String {
        let parent = parent
            .map(|p| format!("\"{}\"", p))
            .unwrap_or_else(|| "null".into());
        format!(
            r#"{{"type":"assistant","uuid":"{}","parentUuid":{},"sessionId":"main","timestamp":"{}","message":{{"role":"assistant","content":[{{"type":"text","text":"delegating"}},{{"type":"tool_use","id":"tool-{}","name":"Task","input":{{"description":"d","prompt":"{}","subagent_type":"general-purpose"}}}}]}}}}"#,
            id, parent, ts, id, prompt
        )
    }

    fn side_root(id: &str, prompt: &str) -> String {
        format!(
            r#"{{"type":"user","uuid":"{}","parentUuid":null,"sessionId":"main","isSidechain":true,"message":{{"role":"user","content":"{}"}}}}"#,
            id, prompt
        )
    }

    fn user(id: &str, parent: Option<&str>, text: &str) -> String {
        let parent = parent
            .map(|p| format!("\"{}\"", p))
            .unwrap_or_else(|| "null".into());
        format!(
            r#"{{"type":"user","uuid":"{}","parentUuid":{},"sessionId":"main","message":{{"role":"user","content":"{}"}}}}"#,
            id, parent, text
        )
    }

    fn graph_of(lines: &[String]) -> SessionGraph {
        let mut diag = Diagnostics::new();
        SessionGraph::build(
            vec![loaded("main.jsonl", &lines.join("\n"))],
            GraphOptions::default(),
            &mut diag,
        )
    }

    #[test]
    fn test_normalize_prompt() {
        assert_eq!(
            normalize_prompt("  Find   the\tBUG \n in parser.rs "),
            "find the bug in parser.rs"
        );
        assert_eq!(prompt_hash("Hello  World"), prompt_hash("hello world"));
        assert_ne!(prompt_hash("hello world"), prompt_hash("hello worlds"));
        assert_eq!(prompt_hash("x").len(), 64);
    }

    #[test]
    fn test_block_and_string_content_hash_alike() {
        let blocks = Content::from_json(Some(&serde_json::json!([
            {"type": "text", "text": "Review"},
            {"type": "text", "text": "the diff"}
        ])));
        assert_eq!(content_hash(&blocks), prompt_hash("review the diff"));
    }

    #[test]
    fn test_inline_side_chain_match() {
        let graph = graph_of(&[
            user("u1", None, "please help"),
            task("a1", Some("u1"), "Search the codebase", "2025-01-01T10:00:00Z"),
            side_root("sc1", "search   the CODEBASE"),
        ]);
        let mut diag = Diagnostics::new();
        let mappings = map_subagents(&graph, &[], &AnalysisConfig::default(), &mut diag);

        assert_eq!(mappings.len(), 1);
        let m = &mappings[0];
        assert_eq!(m.parent_session_id, "main");
        assert_eq!(m.parent_message_id, "a1");
        assert_eq!(m.tool_use_id.as_deref(), Some("tool-a1"));
        assert_eq!(m.child_session_id, "main_sidechain_sc1");
        assert_eq!(m.subagent_type.as_deref(), Some("general-purpose"));
        assert_eq!(m.source, MappingSource::InlineSideChain);
        assert_eq!(m.child_root, Some(MessageKey::new(0, "sc1")));
        assert_eq!(diag.unmatched_task_invocations, 0);

        let mut paths = enumerate_paths(&graph);
        annotate(&mut paths, &mappings);
        let side = paths.iter().find(|p| p.contains("sc1")).unwrap();
        assert_eq!(side.spawn_link.as_ref(), Some(m));
        let main = paths.iter().find(|p| p.contains("a1")).unwrap();
        assert!(main.spawn_link.is_none());
    }

    #[test]
    fn test_repeated_prompt_claims_successive_runs() {
        let graph = graph_of(&[
            user("u1", None, "go"),
            task("a1", Some("u1"), "same job", "2025-01-01T10:00:00Z"),
            side_root("sc1", "same job"),
            task("a2", Some("a1"), "same job", "2025-01-01T10:05:00Z"),
            side_root("sc2", "same job"),
        ]);
        let mut diag = Diagnostics::new();
        let mappings = map_subagents(&graph, &[], &AnalysisConfig::default(), &mut diag);

        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].child_root, Some(MessageKey::new(0, "sc1")));
        assert_eq!(mappings[1].child_root, Some(MessageKey::new(0, "sc2")));
        // a1 saw two candidates; a2 only the one left.
        assert_eq!(diag.ambiguous_subagent_matches, 1);
    }

    #[test]
    fn test_separate_session_file_match() {
        let graph = graph_of(&[
            user("u1", None, "go"),
            task("a1", Some("u1"), "Write the tests", "2025-01-01T10:00:00Z"),
        ]);
        let child = loaded(
            "/logs/child-session.jsonl",
            r#"{"type":"user","uuid":"c1","parentUuid":null,"sessionId":"child-session","timestamp":"2025-01-01T10:00:01Z","message":{"role":"user","content":"write  the TESTS"}}"#,
        );
        let unrelated = loaded(
            "/logs/other.jsonl",
            r#"{"type":"user","uuid":"o1","parentUuid":null,"sessionId":"other","message":{"role":"user","content":"something else"}}"#,
        );
        let sidecars = vec![
            SessionFingerprint::from_loaded(&unrelated),
            SessionFingerprint::from_loaded(&child),
        ];
        let mut diag = Diagnostics::new();
        let mappings = map_subagents(&graph, &sidecars, &AnalysisConfig::default(), &mut diag);

        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].child_session_id, "child-session");
        assert_eq!(
            mappings[0].source,
            MappingSource::SessionFile {
                path: PathBuf::from("/logs/child-session.jsonl")
            }
        );
        assert_eq!(mappings[0].child_root, None);
    }

    #[test]
    fn test_agent_file_sharing_parent_session_uses_stem() {
        let graph = graph_of(&[task("a1", None, "explore", "2025-01-01T10:00:00Z")]);
        let agent = loaded(
            "/logs/agent-a1b2c3.jsonl",
            r#"{"type":"user","uuid":"c1","parentUuid":null,"sessionId":"main","isSidechain":true,"message":{"role":"user","content":"Explore"}}"#,
        );
        let mut diag = Diagnostics::new();
        let mappings = map_subagents(
            &graph,
            &[SessionFingerprint::from_loaded(&agent)],
            &AnalysisConfig::default(),
            &mut diag,
        );
        assert_eq!(mappings[0].child_session_id, "agent-a1b2c3");
    }

    #[test]
    fn test_sidecar_proximity_prefers_first_after_invocation() {
        let graph = graph_of(&[task("a1", None, "job", "2025-01-01T10:00:00Z")]);
        let make = |name: &str, ts: &str| {
            SessionFingerprint::from_loaded(&loaded(
                name,
                &format!(
                    r#"{{"type":"user","uuid":"c","parentUuid":null,"sessionId":"{}","timestamp":"{}","message":{{"content":"job"}}}}"#,
                    name, ts
                ),
            ))
        };
        let sidecars = vec![
            make("/l/before.jsonl", "2025-01-01T09:59:59Z"),
            make("/l/late.jsonl", "2025-01-01T11:00:00Z"),
            make("/l/soon.jsonl", "2025-01-01T10:00:02Z"),
        ];
        let mut diag = Diagnostics::new();
        let mappings = map_subagents(&graph, &sidecars, &AnalysisConfig::default(), &mut diag);
        assert_eq!(
            mappings[0].source,
            MappingSource::SessionFile {
                path: PathBuf::from("/l/soon.jsonl")
            }
        );
        assert_eq!(diag.ambiguous_subagent_matches, 1);
    }

    #[test]
    fn test_unmatched_and_non_task_tools() {
        let bash = r#"{"type":"assistant","uuid":"b1","parentUuid":null,"sessionId":"main","message":{"content":[{"type":"tool_use","id":"t","name":"Bash","input":{"command":"ls","prompt":"x"}}]}}"#;
        let graph = graph_of(&[
            bash.to_string(),
            task("a1", Some("b1"), "nobody ran this", "2025-01-01T10:00:00Z"),
        ]);
        let config = AnalysisConfig::default();
        assert_eq!(find_invocations(&graph, &config).len(), 1);

        let mut diag = Diagnostics::new();
        let mappings = map_subagents(&graph, &[], &config, &mut diag);
        assert!(mappings.is_empty());
        assert_eq!(diag.unmatched_task_invocations, 1);
    }
}
