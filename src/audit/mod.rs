//! Structured audit logging for agent tool-use and permission events.
//!
//! Provides the [`AuditLogger`] trait and associated types. The primary
//! implementation, [`JsonlAuditWriter`], appends JSONL records to
//! daily-rotating files under the workspace's `.im-cowork/logs/` directory.
//!
//! Grounded on the teacher's `audit::{AuditEntry, AuditLogger}` — same
//! builder-style entry plus trait-object writer shape — retargeted from
//! Slack-approval event kinds to the spec's tool-policy and
//! permission-confirmation outcomes (§4.2, §7).

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type classification for audit log entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A tool-use request was evaluated against the safety policy.
    ToolCall,
    /// A permission request was allowed (by policy or human confirmation).
    PermissionAllow,
    /// A permission request was denied (by policy or human confirmation).
    PermissionDeny,
    /// A permission request auto-denied after the 60 s confirmation timeout.
    PermissionTimeout,
    /// Agent session started (fresh or recovered).
    SessionStart,
    /// Agent session finished a turn via `complete`.
    SessionComplete,
    /// Agent session finished a turn via `error`.
    SessionError,
    /// Agent session interrupted by `stopSession` or server shutdown.
    SessionInterrupt,
}

/// A structured record of an agent interaction event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Owning agent session, if any.
    pub session_id: Option<String>,
    /// Originating IM conversation, formatted `platform:conversationId`.
    pub conversation_key: Option<String>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Tool name (for `tool_call`/permission events).
    pub tool_name: Option<String>,
    /// Brief result description.
    pub result_summary: Option<String>,
    /// Permission request identifier (for permission events).
    pub request_id: Option<String>,
}

impl AuditEntry {
    /// Construct a minimal audit entry for the given event type.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: None,
            conversation_key: None,
            event_type,
            tool_name: None,
            result_summary: None,
            request_id: None,
        }
    }

    /// Set the owning session id for this entry.
    #[must_use]
    pub fn with_session(mut self, session_id: String) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the originating conversation key for this entry.
    #[must_use]
    pub fn with_conversation(mut self, conversation_key: String) -> Self {
        self.conversation_key = Some(conversation_key);
        self
    }

    /// Set the tool name for this entry.
    #[must_use]
    pub fn with_tool(mut self, tool_name: String) -> Self {
        self.tool_name = Some(tool_name);
        self
    }

    /// Set the result summary for this entry.
    #[must_use]
    pub fn with_result(mut self, summary: String) -> Self {
        self.result_summary = Some(summary);
        self
    }

    /// Set the permission request id for this entry.
    #[must_use]
    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Writes structured audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait AuditLogger: Send + Sync {
    /// Record a single audit entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

pub use writer::JsonlAuditWriter;
