//! Tool-use permission model (§3 `PermissionRequest` / `PendingIMPermission`).
//!
//! Grounded on the teacher's `models::approval::ApprovalRequest` — same
//! "awaiting a human decision, resolved exactly once" shape — retargeted
//! from a code-diff review to a generic tool-use gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::session::ConversationKey;

/// A request from the agent to use a tool, awaiting operator approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Unique request identifier.
    pub request_id: String,
    /// Owning agent session.
    pub session_id: String,
    /// Name of the tool the agent wants to invoke.
    pub tool_name: String,
    /// Sanitised tool input (bounded per §4.2 Sanitisation).
    pub tool_input: serde_json::Value,
    /// The question text the policy gate computed for this request, if
    /// any (e.g. a delete-shaped command truncated to 120 chars). When
    /// absent, the confirmation prompt falls back to a generic
    /// "wants to use <tool>" wording (§4.1, §4.2).
    pub confirmation_question: Option<String>,
    /// Creation timestamp, used to enforce the 60 s hard timeout.
    pub created_at: DateTime<Utc>,
}

impl PermissionRequest {
    /// Construct a new permission request with a generated id.
    #[must_use]
    pub fn new(session_id: String, tool_name: String, tool_input: serde_json::Value) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            session_id,
            tool_name,
            tool_input,
            confirmation_question: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the policy gate's computed question text, surfaced verbatim
    /// in the IM confirmation prompt instead of the generic wording.
    #[must_use]
    pub fn with_confirmation_question(mut self, question: impl Into<String>) -> Self {
        self.confirmation_question = Some(question.into());
        self
    }
}

/// Outcome of resolving a [`PermissionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResult {
    /// Whether the tool use is allowed.
    pub behavior: PermissionBehavior,
    /// Replacement tool input, used by `AskUserQuestion` synthesis.
    pub updated_input: Option<serde_json::Value>,
    /// Human-readable explanation surfaced to the agent on denial.
    pub message: Option<String>,
}

/// The two possible outcomes of a permission decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    /// Tool use is permitted.
    Allow,
    /// Tool use is denied.
    Deny,
}

impl PermissionResult {
    /// Build an `allow` result with no input rewrite.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input: None,
            message: None,
        }
    }

    /// Build an `allow` result carrying a rewritten tool input (used for
    /// `AskUserQuestion` answer synthesis).
    #[must_use]
    pub fn allow_with_input(updated_input: serde_json::Value) -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            updated_input: Some(updated_input),
            message: None,
        }
    }

    /// Build a `deny` result carrying an explanatory message.
    #[must_use]
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            updated_input: None,
            message: Some(message.into()),
        }
    }
}

/// Exists only while a human owes an allow/deny answer in chat for a
/// given conversation (§3, §4.1 text-confirmation sub-protocol).
///
/// A new `PendingIMPermission` on the same conversation supersedes (and
/// auto-denies) any prior one.
#[derive(Debug, Clone)]
pub struct PendingIMPermission {
    /// Conversation this pending confirmation belongs to.
    pub conversation_key: ConversationKey,
    /// The agent session the request originated from.
    pub agent_session_id: String,
    /// The permission request awaiting a chat reply.
    pub request_id: String,
    /// Name of the tool this request was raised for, needed to decide
    /// whether an allow must carry synthesized `AskUserQuestion` answers.
    pub tool_name: String,
    /// The tool's (sanitised) input, source of the questions/options an
    /// `AskUserQuestion` allow synthesizes answers from.
    pub tool_input: serde_json::Value,
    /// When this pending confirmation was created (60 s timeout anchor).
    pub created_at: DateTime<Utc>,
}

impl PendingIMPermission {
    /// Construct a pending confirmation anchored at the current time.
    #[must_use]
    pub fn new(
        conversation_key: ConversationKey,
        agent_session_id: String,
        request_id: String,
        tool_name: String,
        tool_input: serde_json::Value,
    ) -> Self {
        Self {
            conversation_key,
            agent_session_id,
            request_id,
            tool_name,
            tool_input,
            created_at: Utc::now(),
        }
    }
}
