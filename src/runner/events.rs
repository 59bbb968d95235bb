//! Event types emitted by [`crate::runner::AgentRunner`] (§3, §4.2, §9).
//!
//! Grounded on the teacher's `driver::AgentEvent` — the same idea of a
//! protocol-agnostic event enum fed into a shared bus — retargeted at the
//! five named channels §9 requires (`message`, `messageUpdate`,
//! `permissionRequest`, `complete`, `error`) instead of Slack-approval
//! events.

use crate::models::agent_message::AgentMessage;
use crate::models::permission::PermissionRequest;

/// Events the runner emits per session. The multiplexer subscribes to
/// all five and filters by its owned-session set (§4.1, §9).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A new message was appended to the session's ordered log.
    Message {
        /// Owning session.
        session_id: String,
        /// The appended message.
        message: AgentMessage,
    },
    /// An already-appended message's content was replaced in place.
    MessageUpdate {
        /// Owning session.
        session_id: String,
        /// Id of the message being updated.
        message_id: String,
        /// New content.
        content: String,
    },
    /// The agent requested tool-use approval.
    PermissionRequest {
        /// Owning session.
        session_id: String,
        /// The request awaiting resolution.
        request: PermissionRequest,
    },
    /// The turn finished successfully.
    Complete {
        /// Owning session.
        session_id: String,
    },
    /// The turn finished with a fatal error.
    Error {
        /// Owning session.
        session_id: String,
        /// Human-readable error text.
        message: String,
    },
}

impl AgentEvent {
    /// The session this event belongs to, for owned-session filtering (§9).
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Message { session_id, .. }
            | Self::MessageUpdate { session_id, .. }
            | Self::PermissionRequest { session_id, .. }
            | Self::Complete { session_id }
            | Self::Error { session_id, .. } => session_id,
        }
    }
}
