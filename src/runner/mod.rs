//! The streaming engine that drives one agent child process per session
//! (§4.2).
//!
//! Grounded on the teacher's `orchestrator` module — `spawner` for the
//! spawn-and-register sequence, `session_manager::terminate_session` for
//! the grace-period-then-kill stop semantics, and `driver::AgentDriver`
//! for the event-bus shape — generalized from a single Slack-triggered
//! MCP session to the spec's named public contract:
//! `startSession`/`continueSession`/`stopSession`/`respondToPermission`/
//! `isSessionActive`.

pub mod events;
pub mod local_process;
pub mod policy;
pub mod sandbox;
pub mod sanitize;
pub mod throttle;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{info, info_span, warn};

use crate::models::agent_message::{AgentMessage, AgentMessageType};
use crate::models::permission::{PermissionRequest, PermissionResult};
use crate::models::session::{AgentSession, ExecutionMode, SessionStatus};
use crate::persistence::message_repo::MessageRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::{AppError, Result};
use events::AgentEvent;

/// Options accepted by [`AgentRunner::start_session`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Absolute workspace root the agent process runs in.
    pub workspace_root: String,
    /// System prompt to seed (or change) the session with.
    pub system_prompt: String,
    /// Skill identifiers auto-routed into the turn's prompt.
    pub skill_ids: Vec<String>,
    /// When set, tool-safety gating short-circuits to allow for most
    /// tools (scheduled-task mode); delete-shaped commands still gate.
    pub auto_approve: bool,
    /// Skip appending the synthetic user message for this turn (used by
    /// scheduled/system-initiated turns that carry no chat input).
    pub skip_initial_user_message: bool,
    /// Where this session's process should run.
    pub execution_mode: ExecutionMode,
}

/// Options accepted by [`AgentRunner::continue_session`].
#[derive(Debug, Clone, Default)]
pub struct ContinueOptions {
    /// System prompt in effect for this turn (may differ from the last).
    pub system_prompt: String,
    /// Skill identifiers auto-routed into the turn's prompt.
    pub skill_ids: Vec<String>,
}

/// Per-session bookkeeping the runner keeps in memory. The durable copy
/// lives in [`crate::persistence::session_repo`]; this is the live
/// counterpart a running turn mutates directly.
struct RunnerSession {
    session: AgentSession,
    stop_requested: bool,
}

/// Drives agent child processes and republishes their output as
/// [`AgentEvent`]s on a shared broadcast bus.
///
/// `pending_permissions` is the single-owner-mutex table §5/§9 call for:
/// at most one `oneshot::Sender` per outstanding request, consumed
/// exactly once by either [`AgentRunner::respond_to_permission`] or the
/// 60 s hard timeout in [`local_process`].
pub struct AgentRunner {
    sessions: Mutex<HashMap<String, RunnerSession>>,
    pending_permissions: Mutex<HashMap<String, PendingEntry>>,
    events_tx: broadcast::Sender<AgentEvent>,
    message_repo: MessageRepo,
    session_repo: SessionRepo,
}

struct PendingEntry {
    session_id: String,
    tx: oneshot::Sender<PermissionResult>,
}

impl AgentRunner {
    /// Construct a runner with a broadcast bus sized for the expected
    /// number of concurrently interested subscribers (the multiplexer,
    /// plus any IPC/audit observers). `message_repo` makes this runner
    /// the single writer of the persisted message log (§6); `session_repo`
    /// lets it persist the continuation token captured off `system.init`
    /// without routing back through the multiplexer.
    #[must_use]
    pub fn new(message_repo: MessageRepo, session_repo: SessionRepo) -> Self {
        let (events_tx, _rx) = broadcast::channel(1024);
        Self {
            sessions: Mutex::new(HashMap::new()),
            pending_permissions: Mutex::new(HashMap::new()),
            events_tx,
            message_repo,
            session_repo,
        }
    }

    /// Subscribe to the runner's event bus (§9: `message`, `messageUpdate`,
    /// `permissionRequest`, `complete`, `error`).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        // A lagging/absent receiver is not an error: the bus is
        // best-effort fan-out, and the persisted message log remains the
        // source of truth.
        let _ = self.events_tx.send(event);
    }

    /// Start a brand-new turn on `session`, appending the user's message
    /// unless `opts.skip_initial_user_message` is set.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runner`] if the session already has a turn in
    /// flight, or if process spawn fails.
    pub async fn start_session(
        &self,
        mut session: AgentSession,
        prompt: &str,
        opts: StartOptions,
    ) -> Result<String> {
        let span = info_span!("start_session", session_id = %session.id);
        let _guard = span.enter();

        if session.is_active() {
            return Err(AppError::Runner(format!(
                "session {} already has a turn in flight",
                session.id
            )));
        }

        session.set_system_prompt(opts.system_prompt.clone());
        session.execution_mode = opts.execution_mode;
        session.transition(SessionStatus::Running);

        if !opts.skip_initial_user_message {
            let message = AgentMessage::new(AgentMessageType::User, prompt.to_owned());
            session.push_message(message.clone());
            self.emit(AgentEvent::Message {
                session_id: session.id.clone(),
                message,
            });
        }

        let session_id = session.id.clone();
        info!(session_id = %session_id, "starting agent turn");
        self.register_and_drive(session, prompt, opts.auto_approve)
            .await?;
        Ok(session_id)
    }

    /// Continue an existing session's conversation with a new turn.
    /// Behaves like [`AgentRunner::start_session`] in all respects except
    /// that the caller supplies an already-persisted [`AgentSession`]
    /// (its `claude_session_id` carries the continuation forward unless
    /// the system prompt changed).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runner`] if a turn is already in flight.
    pub async fn continue_session(
        &self,
        mut session: AgentSession,
        prompt: &str,
        opts: ContinueOptions,
    ) -> Result<String> {
        let span = info_span!("continue_session", session_id = %session.id);
        let _guard = span.enter();

        if session.is_active() {
            return Err(AppError::Runner(format!(
                "session {} already has a turn in flight",
                session.id
            )));
        }

        session.set_system_prompt(opts.system_prompt);
        session.transition(SessionStatus::Running);

        let message = AgentMessage::new(AgentMessageType::User, prompt.to_owned());
        session.push_message(message.clone());
        self.emit(AgentEvent::Message {
            session_id: session.id.clone(),
            message,
        });

        let session_id = session.id.clone();
        self.register_and_drive(session, prompt, false).await?;
        Ok(session_id)
    }

    async fn register_and_drive(&self, session: AgentSession, prompt: &str, auto_approve: bool) -> Result<()> {
        let session_id = session.id.clone();
        {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(
                session_id.clone(),
                RunnerSession {
                    session,
                    stop_requested: false,
                },
            );
        }

        match local_process::run_turn(self, &session_id, prompt, auto_approve).await {
            Ok(()) => {
                self.finish_turn(&session_id, SessionStatus::Completed).await;
                self.emit(AgentEvent::Complete {
                    session_id: session_id.clone(),
                });
            }
            Err(err) => {
                self.finish_turn(&session_id, SessionStatus::Error).await;
                self.emit(AgentEvent::Error {
                    session_id: session_id.clone(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        }
        Ok(())
    }

    async fn finish_turn(&self, session_id: &str, status: SessionStatus) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if !entry.stop_requested {
                entry.session.transition(status);
            }
        }
    }

    /// Stop a session's in-flight turn, if any. Idempotent: calling this
    /// on an already-idle session is a no-op, not an error.
    ///
    /// Resolves every pending permission belonging to this session as
    /// `deny("aborted")`, then marks the session `idle`.
    pub async fn stop_session(&self, session_id: &str) {
        let span = info_span!("stop_session", session_id);
        let _guard = span.enter();

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.stop_requested = true;
                entry.session.transition(SessionStatus::Idle);
            }
        }

        let mut pending = self.pending_permissions.lock().await;
        let stale: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in stale {
            if let Some(entry) = pending.remove(&request_id) {
                let _ = entry.tx.send(PermissionResult::deny("aborted"));
            }
        }
        info!("session stop requested");
    }

    /// Register a pending permission awaiting a human decision, returning
    /// a receiver that resolves exactly once — either via
    /// [`AgentRunner::respond_to_permission`] or the caller's own timeout.
    pub(crate) async fn register_pending_permission(
        &self,
        request: &PermissionRequest,
    ) -> oneshot::Receiver<PermissionResult> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending_permissions.lock().await;
        pending.insert(
            request.request_id.clone(),
            PendingEntry {
                session_id: request.session_id.clone(),
                tx,
            },
        );
        rx
    }

    /// Deliver a decision for an outstanding permission request.
    ///
    /// At most one delivery is effective: a request id not found in the
    /// pending table (already resolved, timed out, or superseded by
    /// `stop_session`) is a silent no-op per §9 — this is not an error
    /// condition the caller needs to branch on.
    pub async fn respond_to_permission(&self, request_id: &str, result: PermissionResult) {
        let mut pending = self.pending_permissions.lock().await;
        if let Some(entry) = pending.remove(request_id) {
            let _ = entry.tx.send(result);
        } else {
            warn!(request_id, "permission already resolved or no longer pending");
        }
    }

    /// Whether `session_id` currently has a turn in flight.
    pub async fn is_session_active(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .is_some_and(|entry| entry.session.is_active())
    }

    /// Append a message to the in-memory session, persist it, and emit it.
    pub(crate) async fn append_message(&self, session_id: &str, message: AgentMessage) {
        let seq = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            entry.session.push_message(message.clone());
            (entry.session.messages.len() - 1) as i64
        };

        if let Err(err) = self.message_repo.append(session_id, seq, &message).await {
            warn!(%err, session_id, "failed to persist agent message");
        }
        self.emit(AgentEvent::Message {
            session_id: session_id.to_owned(),
            message,
        });
    }

    /// Append delta text to an already-streamed message and persist the
    /// result, without emitting a `messageUpdate` event. Accumulation must
    /// never be gated by the emit throttle (§5 monotonicity, §8): callers
    /// decide separately, via [`AgentRunner::emit_message_update`], when
    /// to publish what has accumulated so far.
    ///
    /// `mark_truncated` sets the message's `truncated` flag (idempotent);
    /// it does not by itself stop further accumulation — that is the
    /// caller's responsibility once the per-block cap is hit.
    ///
    /// Returns the message's complete content so far, or `None` if the
    /// session or message no longer exists (turn aborted mid-stream).
    pub(crate) async fn accumulate_message(
        &self,
        session_id: &str,
        message_id: &str,
        delta: &str,
        mark_truncated: bool,
    ) -> Option<String> {
        let (full_content, metadata) = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions.get_mut(session_id)?;
            let message = entry.session.find_message_mut(message_id)?;
            message.content.push_str(delta);
            if mark_truncated {
                message.metadata.truncated = true;
            }
            (message.content.clone(), message.metadata.clone())
        };

        if let Err(err) = self
            .message_repo
            .update_content(message_id, &full_content, &metadata)
            .await
        {
            warn!(%err, session_id, message_id, "failed to persist message update");
        }
        Some(full_content)
    }

    /// Publish a `messageUpdate` event carrying a message's content as it
    /// stands right now. Pure fan-out: does not touch the persisted copy,
    /// which [`AgentRunner::accumulate_message`] already wrote.
    pub(crate) fn emit_message_update(&self, session_id: &str, message_id: &str, content: String) {
        self.emit(AgentEvent::MessageUpdate {
            session_id: session_id.to_owned(),
            message_id: message_id.to_owned(),
            content,
        });
    }

    /// Seal a streaming message: clear `isStreaming` (§3 invariant: once
    /// sealed, a message never reports itself as still streaming),
    /// persist, and force a final `messageUpdate` so observers see the
    /// sealed state even if the last delta landed inside the throttle
    /// window.
    pub(crate) async fn seal_message(&self, session_id: &str, message_id: &str) {
        let sealed = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            let Some(message) = entry.session.find_message_mut(message_id) else {
                return;
            };
            message.metadata.is_streaming = false;
            (message.content.clone(), message.metadata.clone())
        };
        let (full_content, metadata) = sealed;

        if let Err(err) = self
            .message_repo
            .update_content(message_id, &full_content, &metadata)
            .await
        {
            warn!(%err, session_id, message_id, "failed to persist message seal");
        }
        self.emit(AgentEvent::MessageUpdate {
            session_id: session_id.to_owned(),
            message_id: message_id.to_owned(),
            content: full_content,
        });
    }

    /// Apply the terminal `result` event's text (§4.2): if the turn
    /// already streamed an assistant reply, seal that message in place
    /// instead of appending a duplicate. Falls back to replacing an empty
    /// placeholder, and finally to appending a brand-new message if this
    /// turn produced no assistant message at all.
    ///
    /// Only messages appended since the turn's own user message are
    /// considered, so a result with no streamed counterpart never
    /// re-seals a previous turn's already-sealed reply.
    pub(crate) async fn upsert_final_message(&self, session_id: &str, text: &str) {
        let sealed = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            let turn_start = entry
                .session
                .messages
                .iter()
                .rposition(|m| m.message_type == AgentMessageType::User)
                .map_or(0, |idx| idx + 1);
            let existing = entry.session.messages[turn_start..]
                .iter_mut()
                .rev()
                .find(|m| m.message_type == AgentMessageType::Assistant && !m.metadata.is_thinking);

            existing.map(|message| {
                if message.content.trim().is_empty() {
                    message.content = text.to_owned();
                }
                message.metadata.is_final = true;
                message.metadata.is_streaming = false;
                (message.id.clone(), message.content.clone(), message.metadata.clone())
            })
        };

        match sealed {
            Some((message_id, content, metadata)) => {
                if let Err(err) = self.message_repo.update_content(&message_id, &content, &metadata).await {
                    warn!(%err, session_id, message_id, "failed to persist sealed final message");
                }
                self.emit(AgentEvent::MessageUpdate {
                    session_id: session_id.to_owned(),
                    message_id,
                    content,
                });
            }
            None => {
                let mut message = AgentMessage::new(AgentMessageType::Assistant, text.to_owned());
                message.metadata.is_final = true;
                self.append_message(session_id, message).await;
            }
        }
    }

    /// Capture the upstream SDK's continuation token off a `system.init`
    /// event, updating both the live in-memory session and its durable
    /// row so the next turn on this session resumes rather than restarts.
    pub(crate) async fn capture_claude_session_id(&self, session_id: &str, claude_session_id: &str) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            entry.session.claude_session_id = Some(claude_session_id.to_owned());
            entry.session.updated_at = chrono::Utc::now();
            entry.session.clone()
        };

        if let Err(err) = self.session_repo.update_session(&session).await {
            warn!(%err, session_id, "failed to persist claude_session_id");
        }
    }

    /// The continuation token currently recorded for a live session, if
    /// any, used to resume rather than restart the upstream SDK process.
    pub(crate) async fn current_claude_session_id(&self, session_id: &str) -> Option<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .and_then(|entry| entry.session.claude_session_id.clone())
    }

    /// Emit a `permissionRequest` event for observers (the multiplexer's
    /// text-confirmation sub-protocol).
    pub(crate) fn emit_permission_request(&self, session_id: &str, request: PermissionRequest) {
        self.emit(AgentEvent::PermissionRequest {
            session_id: session_id.to_owned(),
            request,
        });
    }

    /// Whether the in-flight turn for `session_id` has been asked to stop,
    /// checked by the streaming loop between events to unwind promptly.
    pub(crate) async fn is_stop_requested(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .is_some_and(|entry| entry.stop_requested)
    }
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner").finish_non_exhaustive()
    }
}

/// Shared-ownership handle used by transport and multiplexer callers.
pub type SharedAgentRunner = Arc<AgentRunner>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_runner() -> AgentRunner {
        let db = std::sync::Arc::new(crate::persistence::db::connect_memory().await.expect("connect"));
        AgentRunner::new(MessageRepo::new(std::sync::Arc::clone(&db)), SessionRepo::new(db))
    }

    #[tokio::test]
    async fn stop_session_is_idempotent_on_an_idle_session() {
        let runner = test_runner().await;
        runner.stop_session("never-started").await;
        runner.stop_session("never-started").await;
        assert!(!runner.is_session_active("never-started").await);
    }

    #[tokio::test]
    async fn respond_to_permission_on_unknown_request_is_a_silent_noop() {
        let runner = test_runner().await;
        runner
            .respond_to_permission("missing-request", PermissionResult::allow())
            .await;
    }

    #[tokio::test]
    async fn registered_permission_resolves_exactly_once() {
        let runner = test_runner().await;
        let request = PermissionRequest::new("sess-1".into(), "Bash".into(), serde_json::json!({}));
        let rx = runner.register_pending_permission(&request).await;

        runner
            .respond_to_permission(&request.request_id, PermissionResult::allow())
            .await;
        let result = rx.await.expect("resolved exactly once");
        assert_eq!(result.behavior, crate::models::permission::PermissionBehavior::Allow);

        // A second resolution attempt on the same id is now a no-op.
        runner
            .respond_to_permission(&request.request_id, PermissionResult::deny("late"))
            .await;
    }
}
