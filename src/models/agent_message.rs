//! Agent message model — one entry in a session's ordered log.
//!
//! Grounded on the teacher's `models::prompt::ContinuationPrompt` for the
//! general shape (id, owning session, lifecycle metadata) but re-purposed
//! for §3's `AgentMessage` entity, which has no direct teacher counterpart.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates the five message kinds the runner appends (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentMessageType {
    /// The turn's user input (raw text plus attachment block).
    User,
    /// Assistant text or thinking output, streamed or sealed.
    Assistant,
    /// A tool invocation the agent requested.
    ToolUse,
    /// The result of a previously requested tool invocation.
    ToolResult,
    /// A host-injected system notice (e.g. sandbox fallback).
    System,
}

/// Streaming and provenance metadata carried alongside message content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMessageMetadata {
    /// Set on assistant `thinking` blocks.
    #[serde(default)]
    pub is_thinking: bool,
    /// `true` while a streaming block is still open.
    #[serde(default)]
    pub is_streaming: bool,
    /// `true` once the `result` event has sealed this message.
    #[serde(default)]
    pub is_final: bool,
    /// Tool name, for `tool_use`/`tool_result` messages.
    pub tool_name: Option<String>,
    /// Sanitised tool input, for `tool_use` messages.
    pub tool_input: Option<serde_json::Value>,
    /// Correlates a `tool_result` back to its `tool_use`.
    pub tool_use_id: Option<String>,
    /// Set when a `tool_result` represents a failure.
    #[serde(default)]
    pub is_error: bool,
    /// Skill identifiers that contributed to this turn, if any.
    #[serde(default)]
    pub skill_ids: Vec<String>,
    /// Set once a block has been truncated at its character cap, to
    /// suppress further growth (§4.2 streaming sub-events).
    #[serde(default)]
    pub truncated: bool,
}

/// One entry in an [`crate::models::session::AgentSession`]'s ordered log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique message identifier, stable across streaming updates.
    pub id: String,
    /// Message kind.
    pub message_type: AgentMessageType,
    /// Current content (grows in place while streaming).
    pub content: String,
    /// Streaming/provenance metadata.
    pub metadata: AgentMessageMetadata,
}

impl AgentMessage {
    /// Construct a new, non-streaming message with default metadata.
    #[must_use]
    pub fn new(message_type: AgentMessageType, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            content,
            metadata: AgentMessageMetadata::default(),
        }
    }

    /// Construct a new streaming assistant message (text or thinking block).
    #[must_use]
    pub fn new_streaming(is_thinking: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: AgentMessageType::Assistant,
            content: String::new(),
            metadata: AgentMessageMetadata {
                is_thinking,
                is_streaming: true,
                ..AgentMessageMetadata::default()
            },
        }
    }

    /// Whether this message counts toward the accumulator's reply text:
    /// an assistant message whose `isThinking` is not set and whose
    /// content is non-empty (§4.1 `complete` handling).
    #[must_use]
    pub fn counts_toward_reply(&self) -> bool {
        self.message_type == AgentMessageType::Assistant
            && !self.metadata.is_thinking
            && !self.content.trim().is_empty()
    }
}
