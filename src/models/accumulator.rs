//! Accumulator bookkeeping types (§3 `Accumulator`).
//!
//! The accumulator itself — the live oneshot-backed object the
//! multiplexer awaits — lives in
//! [`crate::multiplexer::accumulator`], since it owns non-`Clone`
//! channel endpoints. This module holds the plain-data error types
//! shared between that object and its callers.

use std::fmt;

/// Reasons a turn can end without producing an ordinary reply string.
#[derive(Debug, Clone)]
pub enum TurnError {
    /// The per-turn timeout (`§5`, default 300 s) elapsed first.
    Timeout,
    /// `stopSession` / `clearSessionForConversation` cancelled the turn.
    SessionAborted,
    /// A newer turn replaced this one before it resolved (§3 invariant).
    Replaced,
    /// The agent runner emitted an `error` event.
    Agent(String),
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for the agent"),
            Self::SessionAborted => write!(f, "session was stopped"),
            Self::Replaced => write!(f, "replaced by a newer IM request"),
            Self::Agent(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for TurnError {}
