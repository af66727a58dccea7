//! Core domain types for threadline
//!
//! These types describe one analysis run over a session family: the loaded
//! [`Message`] records, the [`ConversationPath`]s extracted from the message
//! DAG, the [`CompactBoundary`]s stitching truncated context back together,
//! and the [`SubagentMapping`]s linking task invocations to spawned sessions.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session family** | An original log file plus any continuation files resuming it |
//! | **Root** | A message with no resolvable parent |
//! | **Leaf** | A message with no children; every path ends at one |
//! | **Fork** | A message with more than one child |
//! | **Compact boundary** | A root that logically continues an earlier message |
//! | **Side-chain** | Messages embedded inline that belong to a spawned subagent |
//! | **Synthetic root** | A message forced to be a root (dangling parent or cycle) |
//!
//! All of these are built once per run and never mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Index of a file within its session family, in family order.
pub type FileIndex = usize;

/// Globally unique address of a message within an analysis run.
///
/// Message ids are only unique per file (continuation files may replay
/// history with the same ids), so every cross-stage reference carries the
/// file index as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub file: FileIndex,
    pub id: String,
}

impl MessageKey {
    pub fn new(file: FileIndex, id: impl Into<String>) -> Self {
        Self {
            file,
            id: id.into(),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.id)
    }
}

// ============================================
// Messages
// ============================================

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "human" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque message payload.
///
/// The analysis never interprets content beyond two things: extracting the
/// text used for prompt hashing, and spotting well-known control blocks
/// (`tool_use`, `tool_result`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    #[default]
    Empty,
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl Content {
    /// Build content from whatever JSON shape the record carried.
    pub fn from_json(value: Option<&serde_json::Value>) -> Self {
        match value {
            None | Some(serde_json::Value::Null) => Content::Empty,
            Some(serde_json::Value::String(s)) => Content::Text(s.clone()),
            Some(serde_json::Value::Array(blocks)) => Content::Blocks(blocks.clone()),
            Some(other) => Content::Blocks(vec![other.clone()]),
        }
    }

    /// Concatenated text of the payload, block text in order.
    ///
    /// Plain strings are returned as-is; for block lists, `text` blocks
    /// contribute their `text` and bare string entries contribute themselves.
    pub fn text(&self) -> String {
        match self {
            Content::Empty => String::new(),
            Content::Text(s) => s.clone(),
            Content::Blocks(blocks) => blocks_text(blocks),
        }
    }

    pub fn blocks(&self) -> &[serde_json::Value] {
        match self {
            Content::Blocks(blocks) => blocks,
            _ => &[],
        }
    }

    /// True when every block is a `tool_result` (and there is at least one).
    pub fn is_tool_results(&self) -> bool {
        let blocks = self.blocks();
        !blocks.is_empty()
            && blocks
                .iter()
                .all(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
    }
}

/// Concatenate the text carried by a list of content blocks.
pub fn blocks_text(blocks: &[serde_json::Value]) -> String {
    let mut out = String::new();
    for block in blocks {
        let piece = match block {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => match map.get("type").and_then(|t| t.as_str()) {
                Some("text") | None => map.get("text").and_then(|t| t.as_str()),
                _ => None,
            },
            _ => None,
        };
        if let Some(piece) = piece {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(piece);
        }
    }
    out
}

/// One log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within its file
    pub id: String,
    /// Declared parent; `None` marks a root
    pub parent_id: Option<String>,
    /// Only present on compact-boundary roots
    pub logical_parent_id: Option<String>,
    pub session_id: String,
    /// Zero-based line index in the source file
    pub file_position: u64,
    pub role: Role,
    pub content: Content,
    pub is_side_chain: bool,
    pub schema_version: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Every record field not mapped above, kept verbatim
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    /// Raw record `type` (e.g. "user", "system"), if present.
    pub fn record_type(&self) -> Option<&str> {
        self.extra_str("type")
    }

    /// Record `subtype` (e.g. "compact_boundary"), if present.
    pub fn subtype(&self) -> Option<&str> {
        self.extra_str("subtype")
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn extra_bool(&self, key: &str) -> bool {
        self.extra
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// ============================================
// Compact boundaries
// ============================================

/// How a compaction was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTrigger {
    Manual,
    Automatic,
    Unknown,
}

impl CompactTrigger {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "manual" => CompactTrigger::Manual,
            "auto" | "automatic" => CompactTrigger::Automatic,
            _ => CompactTrigger::Unknown,
        }
    }
}

/// Why a cross-file continuation link was inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationEvidence {
    /// The root's own dangling parent id resolved in an earlier file
    ParentReference,
    /// Same session id as an earlier file; linked to that file's last message
    SessionHeuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryKind {
    /// In-file compaction (`logical_parent_id` on the root)
    Compact,
    /// First root of a resumed session file
    Continuation { evidence: ContinuationEvidence },
}

/// A context-truncation point: a root that logically continues an earlier message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactBoundary {
    /// The boundary root itself
    pub key: MessageKey,
    pub kind: BoundaryKind,
    pub trigger: CompactTrigger,
    /// Equals the root's `logical_parent_id` (or the inferred one for continuations)
    pub preceding_message_id: String,
    /// Where the preceding message was found, if anywhere
    pub resolved_predecessor: Option<MessageKey>,
    /// Token count before compaction, when the log records it
    pub pre_tokens: Option<u64>,
}

// ============================================
// Paths
// ============================================

/// A root-to-leaf walk through one file's message tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPath {
    pub file: FileIndex,
    /// Root first, leaf last
    pub message_ids: Vec<String>,
    /// Took the latest child at every fork
    pub is_active: bool,
    /// First fork where an earlier (superseded) child was taken
    pub diverged_at: Option<String>,
    /// Boundaries this path logically continues through, oldest first
    pub compact_chain: Vec<MessageKey>,
    pub spawn_link: Option<SubagentMapping>,
}

impl ConversationPath {
    pub fn root_key(&self) -> Option<MessageKey> {
        self.message_ids
            .first()
            .map(|id| MessageKey::new(self.file, id.clone()))
    }

    pub fn leaf_key(&self) -> Option<MessageKey> {
        self.message_ids
            .last()
            .map(|id| MessageKey::new(self.file, id.clone()))
    }

    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.message_ids.iter().any(|m| m == id)
    }
}

// ============================================
// Subagents
// ============================================

/// Where a spawned subagent session was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MappingSource {
    /// Inline `isSidechain` run within the invoking file
    InlineSideChain,
    /// Separate session file in the same log directory
    SessionFile { path: PathBuf },
}

/// Link from a task invocation to the session it spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentMapping {
    pub parent_session_id: String,
    /// The message carrying the task invocation
    pub parent_message_id: String,
    pub tool_use_id: Option<String>,
    /// Real session id, or `{parent}_sidechain_{uuid}` for inline runs
    pub child_session_id: String,
    /// Hex SHA-256 of the normalized prompt
    pub prompt_hash: String,
    pub subagent_type: Option<String>,
    pub source: MappingSource,
    /// Root of the spawned run when it is part of the loaded graph
    pub child_root: Option<MessageKey>,
}
