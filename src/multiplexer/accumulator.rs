//! The live, per-turn buffer that becomes an IM reply (§3, §4.1).
//!
//! At most one [`Accumulator`] exists per agent session; installing a
//! new one resolves the previous one with [`super::MultiplexError::Replaced`]
//! (§3 invariant).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::models::agent_message::AgentMessage;

use super::MultiplexError;

/// Outcome of an accumulated turn, delivered to `processMessage`'s caller.
pub type AccumulatorResult = Result<String, MultiplexError>;

/// Owns the ordered messages observed for one in-flight turn, plus the
/// oneshot sender that resolves `processMessage`.
pub struct Accumulator {
    session_id: String,
    messages: Vec<AgentMessage>,
    resolver: Option<oneshot::Sender<AccumulatorResult>>,
    created_at: DateTime<Utc>,
}

impl Accumulator {
    /// Create a fresh accumulator for `session_id`, returning it paired
    /// with the receiver `processMessage` awaits.
    #[must_use]
    pub fn new(session_id: String) -> (Self, oneshot::Receiver<AccumulatorResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                session_id,
                messages: Vec::new(),
                resolver: Some(tx),
                created_at: Utc::now(),
            },
            rx,
        )
    }

    /// The session this accumulator belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When this accumulator was installed (for per-turn timeout anchoring).
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Append a newly observed message to the ordered list.
    pub fn push(&mut self, message: AgentMessage) {
        self.messages.push(message);
    }

    /// Replace in place (by id) the content of a previously accumulated
    /// message. A miss is ignored (§4.1 `messageUpdate` handling).
    pub fn apply_update(&mut self, message_id: &str, content: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
            message.content = content.to_owned();
        }
    }

    /// Resolve with the concatenation of qualifying assistant messages,
    /// separated by blank lines (§4.1 `complete` handling). Consumes the
    /// accumulator; a second call on an already-resolved accumulator is
    /// a no-op (the resolver was already taken).
    pub fn resolve_complete(&mut self) {
        let reply = self.format_reply();
        self.resolve(Ok(reply));
    }

    /// Resolve with an explicit error (turn failure, timeout, abort, or
    /// supersession).
    pub fn resolve_error(&mut self, error: MultiplexError) {
        self.resolve(Err(error));
    }

    /// Resolve with the human-readable confirmation prompt built from a
    /// permission request (the accumulator's reply *is* the prompt text
    /// in this case — the turn is not actually finished).
    pub fn resolve_with_prompt(&mut self, prompt: String) {
        self.resolve(Ok(prompt));
    }

    fn resolve(&mut self, result: AccumulatorResult) {
        if let Some(resolver) = self.resolver.take() {
            let _ = resolver.send(result);
        }
    }

    fn format_reply(&self) -> String {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.counts_toward_reply())
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            "Done — there was no additional reply for this turn.".to_owned()
        } else {
            parts.join("\n\n")
        }
    }
}

/// Table of the single in-flight accumulator per owned agent session,
/// mutated only from the multiplexer's own scheduling domain.
#[derive(Default)]
pub struct AccumulatorTable {
    by_session: HashMap<String, Accumulator>,
}

impl AccumulatorTable {
    /// Install a fresh accumulator for `session_id`, superseding (and
    /// rejecting with [`MultiplexError::Replaced`]) any prior one.
    pub fn install(&mut self, session_id: String) -> oneshot::Receiver<AccumulatorResult> {
        let (mut accumulator, rx) = Accumulator::new(session_id.clone());
        if let Some(mut previous) = self.by_session.remove(&session_id) {
            previous.resolve_error(MultiplexError::Replaced);
        }
        accumulator.created_at();
        self.by_session.insert(session_id, accumulator);
        rx
    }

    /// Mutably access the accumulator for a session, if one is installed.
    pub fn get_mut(&mut self, session_id: &str) -> Option<&mut Accumulator> {
        self.by_session.get_mut(session_id)
    }

    /// Remove and return the accumulator for a session, if any.
    pub fn take(&mut self, session_id: &str) -> Option<Accumulator> {
        self.by_session.remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::agent_message::AgentMessageType;

    #[tokio::test]
    async fn installing_a_second_accumulator_rejects_the_first_with_replaced() {
        let mut table = AccumulatorTable::default();
        let first_rx = table.install("sess-1".into());
        let _second_rx = table.install("sess-1".into());

        let result = first_rx.await.expect("resolved");
        assert!(matches!(result, Err(MultiplexError::Replaced)));
    }

    #[tokio::test]
    async fn complete_concatenates_qualifying_assistant_messages() {
        let mut table = AccumulatorTable::default();
        let rx = table.install("sess-1".into());
        let acc = table.get_mut("sess-1").expect("installed");

        let mut thinking = AgentMessage::new(AgentMessageType::Assistant, "pondering".into());
        thinking.metadata.is_thinking = true;
        acc.push(thinking);
        acc.push(AgentMessage::new(AgentMessageType::Assistant, "First part.".into()));
        acc.push(AgentMessage::new(AgentMessageType::Assistant, "Second part.".into()));
        acc.resolve_complete();

        let result = rx.await.expect("resolved").expect("ok");
        assert_eq!(result, "First part.\n\nSecond part.");
    }

    #[tokio::test]
    async fn complete_with_no_qualifying_messages_returns_done_placeholder() {
        let mut table = AccumulatorTable::default();
        let rx = table.install("sess-1".into());
        let acc = table.get_mut("sess-1").expect("installed");
        acc.resolve_complete();

        let result = rx.await.expect("resolved").expect("ok");
        assert!(result.contains("no additional reply"));
    }
}
