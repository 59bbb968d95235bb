//! Session model and lifecycle helpers.
//!
//! Covers two related entities from §3 of the specification:
//! [`SessionMapping`] (the durable IM-conversation → agent-session
//! pointer) and [`AgentSession`] (the live agent context it points at).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::agent_message::AgentMessage;

/// Lifecycle status for an agent session (§3, state machine in §4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No turn has run yet, or the previous turn completed/stopped.
    Idle,
    /// A turn is in flight.
    Running,
    /// The most recent turn finished via `complete`.
    Completed,
    /// The most recent turn finished via `error`.
    Error,
}

/// Where the agent process for a session actually runs.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Plain child process on the host.
    #[default]
    Local,
    /// Isolated sandbox VM reached over IPC.
    Sandbox,
    /// Prefer sandbox; fall back to local on spawn failure.
    Auto,
}

/// A persistent conversational context with the agent runtime,
/// independent of IM platform identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    /// Unique session identifier.
    pub id: String,
    /// Absolute, validated workspace root for this session.
    pub workspace_root: String,
    /// Current working directory (defaults to `workspace_root`).
    pub cwd: String,
    /// System prompt currently in effect.
    pub system_prompt: String,
    /// Opaque continuation token understood by the upstream agent SDK.
    ///
    /// Cleared whenever `system_prompt` changes (§3 invariant) so the
    /// next turn starts a fresh continuation rather than replaying a
    /// stale system prompt.
    pub claude_session_id: Option<String>,
    /// Where the agent process for this session executes.
    pub execution_mode: ExecutionMode,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Ordered message log for this session.
    pub messages: Vec<AgentMessage>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-updated timestamp.
    pub updated_at: DateTime<Utc>,
}

impl AgentSession {
    /// Construct a fresh, idle session seeded with a workspace root and
    /// system prompt.
    #[must_use]
    pub fn new(workspace_root: String, system_prompt: String, execution_mode: ExecutionMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            cwd: workspace_root.clone(),
            workspace_root,
            system_prompt,
            claude_session_id: None,
            execution_mode,
            status: SessionStatus::Idle,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the effective system prompt, clearing the continuation
    /// token if it actually changed (§3 invariant).
    ///
    /// Returns `true` if the prompt changed (and the token was cleared).
    pub fn set_system_prompt(&mut self, prompt: String) -> bool {
        if self.system_prompt == prompt {
            return false;
        }
        self.system_prompt = prompt;
        self.claude_session_id = None;
        self.updated_at = Utc::now();
        true
    }

    /// Whether the session currently has a turn in flight.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Running)
    }

    /// Append a message to the ordered log, enforcing total append order.
    pub fn push_message(&mut self, message: AgentMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Find the most recently appended message with the given id, for
    /// in-place `messageUpdate` application.
    pub fn find_message_mut(&mut self, id: &str) -> Option<&mut AgentMessage> {
        self.messages.iter_mut().rev().find(|m| m.id == id)
    }

    /// Transition lifecycle status, following the state machine in §4.2:
    /// `idle -> running -> {completed, error}`, `running -> idle` (stop),
    /// and `{completed, error} -> running` (new turn).
    pub fn transition(&mut self, next: SessionStatus) {
        self.status = next;
        self.updated_at = Utc::now();
    }
}

/// `(platform, conversationId)` value type indexing the pending-permission
/// map and the owned-session filter (§3, §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Originating chat platform.
    pub platform: String,
    /// Platform-scoped conversation identifier.
    pub conversation_id: String,
}

impl ConversationKey {
    /// Build a key from platform and conversation id.
    #[must_use]
    pub fn new(platform: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.conversation_id)
    }
}

/// Durable pointer from one IM conversation to its agent session.
///
/// Persisted via [`crate::persistence::session_repo::SessionRepo`] with
/// primary key `(im_conversation_id, platform)` per §6.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionMapping {
    /// Platform-scoped conversation identifier.
    pub im_conversation_id: String,
    /// Originating chat platform.
    pub platform: String,
    /// The agent session this conversation currently maps to.
    pub agent_session_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent turn on this mapping.
    pub last_active_at: DateTime<Utc>,
}

impl SessionMapping {
    /// Construct a new mapping pointing at a freshly created agent session.
    #[must_use]
    pub fn new(key: &ConversationKey, agent_session_id: String) -> Self {
        let now = Utc::now();
        Self {
            im_conversation_id: key.conversation_id.clone(),
            platform: key.platform.clone(),
            agent_session_id,
            created_at: now,
            last_active_at: now,
        }
    }

    /// The conversation key this mapping answers for.
    #[must_use]
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.platform.clone(), self.im_conversation_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_change_clears_continuation_token() {
        let mut session = AgentSession::new(
            "/tmp/ws".into(),
            "you are an agent".into(),
            ExecutionMode::Local,
        );
        session.claude_session_id = Some("tok-1".into());

        let changed = session.set_system_prompt("you are an agent".into());
        assert!(!changed, "identical prompt must not clear the token");
        assert_eq!(session.claude_session_id.as_deref(), Some("tok-1"));

        let changed = session.set_system_prompt("you are a different agent".into());
        assert!(changed);
        assert!(session.claude_session_id.is_none());
    }

    #[test]
    fn conversation_key_display_matches_opaque_string_convention() {
        let key = ConversationKey::new("telegram", "12345");
        assert_eq!(key.to_string(), "telegram:12345");
    }

    #[test]
    fn find_message_mut_returns_latest_matching_id() {
        use crate::models::agent_message::{AgentMessage, AgentMessageType};

        let mut session =
            AgentSession::new("/tmp/ws".into(), "sys".into(), ExecutionMode::Local);
        session.push_message(AgentMessage::new(AgentMessageType::User, "hi".into()));
        let mut assistant = AgentMessage::new(AgentMessageType::Assistant, "partial".into());
        assistant.id = "msg-1".into();
        session.push_message(assistant);

        let found = session.find_message_mut("msg-1").expect("message present");
        found.content.push_str(" more");
        assert_eq!(session.messages.last().unwrap().content, "partial more");
    }
}
