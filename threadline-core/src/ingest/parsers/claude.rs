//! Claude Code JSONL parser
//!
//! Parses session logs from `~/.claude/projects/[encoded-path]/*.jsonl`.
//!
//! # Record mapping
//!
//! | JSON key | Message field |
//! |----------|---------------|
//! | `uuid` (or `id`) | `id` |
//! | `parentUuid` (or `parentId`) | `parent_id` |
//! | `logicalParentUuid` | `logical_parent_id` |
//! | `sessionId` | `session_id` |
//! | `isSidechain` | `is_side_chain` |
//! | `version` | `schema_version` |
//! | `timestamp` | `timestamp` |
//! | `message.content` (or `content`) | `content` |
//!
//! Every other key, including `type`, `subtype`, `compactMetadata` and the
//! rest of the `message` object, lands in `Message::extra`.
//!
//! # Error Handling
//!
//! - **Malformed JSON lines**: reported as [`SkipReason::InvalidJson`].
//! - **Missing id**: id-less `summary`, `file-history-snapshot` and
//!   `queue-operation` records are [`LineOutcome::Metadata`]; anything else
//!   is [`SkipReason::MissingId`].
//! - **Unknown record types**: kept as [`Role::System`] messages.
//! - **Bad timestamps**: the message is kept with `timestamp: None`.

use crate::ingest::parser::{LineContext, LineOutcome, RecordParser, SkipReason};
use crate::types::{Content, Message, Role};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Record types that legitimately carry no message id.
const METADATA_RECORD_TYPES: &[&str] = &["summary", "file-history-snapshot", "queue-operation"];

/// Parser for Claude Code JSONL logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClaudeJsonlParser;

impl ClaudeJsonlParser {
    pub fn new() -> Self {
        Self
    }
}

impl RecordParser for ClaudeJsonlParser {
    fn name(&self) -> &'static str {
        "claude-jsonl"
    }

    fn parse_line(&self, line: &str, ctx: &LineContext<'_>) -> LineOutcome {
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => return LineOutcome::Skip(SkipReason::InvalidJson(e.to_string())),
        };
        let Value::Object(mut fields) = raw else {
            return LineOutcome::Skip(SkipReason::NotAnObject);
        };

        let id = match take_id(&mut fields, "uuid").or_else(|| take_id(&mut fields, "id")) {
            Some(id) => id,
            None => {
                let record_type = fields.get("type").and_then(|v| v.as_str());
                return match record_type {
                    Some(t) if METADATA_RECORD_TYPES.contains(&t) => LineOutcome::Metadata,
                    _ => LineOutcome::Skip(SkipReason::MissingId),
                };
            }
        };

        let parent_id =
            take_id(&mut fields, "parentUuid").or_else(|| take_id(&mut fields, "parentId"));
        let logical_parent_id = take_id(&mut fields, "logicalParentUuid");
        let session_id = take_string(&mut fields, "sessionId")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ctx.fallback_session_id.to_string());
        let is_side_chain = fields
            .remove("isSidechain")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let schema_version = take_string(&mut fields, "version");
        let timestamp = take_string(&mut fields, "timestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let (content, message_role) = split_message(&mut fields);
        let role = infer_role(
            fields.get("type").and_then(|v| v.as_str()),
            message_role.as_deref(),
            &content,
        );

        LineOutcome::Message(Box::new(Message {
            id,
            parent_id,
            logical_parent_id,
            session_id,
            file_position: ctx.file_position,
            role,
            content,
            is_side_chain,
            schema_version,
            timestamp,
            extra: fields,
        }))
    }
}

/// Normalize a message id.
///
/// UUID-shaped ids are rewritten to lowercase hyphenated form so references
/// match regardless of how the writer formatted them. Other ids are kept
/// verbatim (trimmed).
pub fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match uuid::Uuid::parse_str(trimmed) {
        Ok(u) => u.hyphenated().to_string(),
        Err(_) => trimmed.to_string(),
    })
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => {
            // Not ours to interpret; put it back untouched.
            fields.insert(key.to_string(), other);
            None
        }
    }
}

fn take_id(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    take_string(fields, key).and_then(|s| normalize_id(&s))
}

/// Pull `content` and `role` out of the nested `message` object, leaving the
/// rest of it (model, usage, ...) in the extras.
fn split_message(fields: &mut Map<String, Value>) -> (Content, Option<String>) {
    if let Some(Value::Object(message)) = fields.get_mut("message") {
        let content = Content::from_json(message.remove("content").as_ref());
        let role = message
            .get("role")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        return (content, role);
    }
    let content = Content::from_json(fields.remove("content").as_ref());
    let role = fields
        .get("role")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    (content, role)
}

fn infer_role(record_type: Option<&str>, message_role: Option<&str>, content: &Content) -> Role {
    let declared = match record_type {
        Some("user") | Some("assistant") | Some("system") | Some("tool") => record_type,
        _ => message_role,
    };
    match declared.and_then(|r| r.parse::<Role>().ok()) {
        Some(Role::User) if content.is_tool_results() => Role::Tool,
        Some(role) => role,
        None => Role::System,
    }
}
