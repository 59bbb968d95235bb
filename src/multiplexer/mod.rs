//! Per-conversation session routing, turn accumulation, and text-based
//! permission confirmation (§4.1).
//!
//! Grounded on the teacher's `slack::client::SlackService` for the
//! "adapt external events into a single coordinator, dispatch replies
//! back out" shape, and on `orchestrator::session_manager::resolve_session`
//! for the staleness-recovery retry pattern — generalized from a single
//! Slack workspace to a platform-agnostic conversation-keyed router.

pub mod accumulator;
pub mod pending_permission;
pub mod prompt;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, info_span, warn};

use crate::models::im_message::IMMessage;
use crate::models::permission::{PendingIMPermission, PermissionResult};
use crate::models::session::{AgentSession, ConversationKey, ExecutionMode};
use crate::persistence::session_repo::SessionRepo;
use crate::runner::events::AgentEvent;
use crate::runner::policy::{ALLOW_ONCE_LABEL, DENY_ONCE_LABEL};
use crate::runner::{ContinueOptions, SharedAgentRunner, StartOptions};
use crate::{AppError, Result};

use accumulator::AccumulatorTable;
use pending_permission::{ConfirmationMatch, PendingPermissionTable};

/// Default per-turn deadline (§4.1 `processMessage`).
const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors `processMessage` surfaces to its caller (§4.1, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexError {
    /// The per-turn deadline elapsed before the accumulator resolved.
    Timeout,
    /// `stopSession`/`clearSessionForConversation` cancelled the turn.
    SessionAborted,
    /// A newer turn superseded this accumulator before it resolved.
    Replaced,
    /// The underlying agent runtime reported a fatal error.
    Agent(String),
}

impl std::fmt::Display for MultiplexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "turn timed out"),
            Self::SessionAborted => write!(f, "session aborted"),
            Self::Replaced => write!(f, "replaced by a newer IM request"),
            Self::Agent(msg) => write!(f, "agent error: {msg}"),
        }
    }
}

impl std::error::Error for MultiplexError {}

struct MultiplexerState {
    owned_sessions: HashSet<String>,
    /// Recovers the conversation a session belongs to when routing an
    /// `AgentEvent::PermissionRequest` into the pending-permission table,
    /// which is keyed by conversation rather than by session.
    session_keys: HashMap<String, ConversationKey>,
    accumulators: AccumulatorTable,
    pending: PendingPermissionTable,
}

/// Adapts [`crate::transport::Transport`] events to [`crate::runner::AgentRunner`],
/// accumulating stream output into a single reply and mediating
/// human-in-the-loop permission confirmation over plain chat text.
pub struct IMSessionMultiplexer {
    runner: SharedAgentRunner,
    session_repo: SessionRepo,
    state: Mutex<MultiplexerState>,
    turn_timeout: Duration,
}

impl IMSessionMultiplexer {
    /// Construct a multiplexer and spawn its event-consuming background
    /// task. The returned `Arc` is how all callers (transports, IPC,
    /// tests) should hold a reference.
    #[must_use]
    pub fn new(runner: SharedAgentRunner, session_repo: SessionRepo) -> Arc<Self> {
        Self::with_turn_timeout(runner, session_repo, DEFAULT_TURN_TIMEOUT)
    }

    /// Construct with an explicit per-turn timeout (for tests).
    #[must_use]
    pub fn with_turn_timeout(
        runner: SharedAgentRunner,
        session_repo: SessionRepo,
        turn_timeout: Duration,
    ) -> Arc<Self> {
        let multiplexer = Arc::new(Self {
            runner,
            session_repo,
            state: Mutex::new(MultiplexerState {
                owned_sessions: HashSet::new(),
                session_keys: HashMap::new(),
                accumulators: AccumulatorTable::default(),
                pending: PendingPermissionTable::default(),
            }),
            turn_timeout,
        });
        multiplexer.clone().spawn_event_loop();
        multiplexer
    }

    fn spawn_event_loop(self: Arc<Self>) {
        let mut events = self.runner.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "multiplexer event loop lagged; some events were dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Filter events by ownership (§4.1 "Filtering") and route to the
    /// matching accumulator/pending-permission handling.
    async fn handle_event(&self, event: AgentEvent) {
        let session_id = event.session_id().to_owned();
        let mut state = self.state.lock().await;
        if !state.owned_sessions.contains(&session_id) {
            return;
        }

        match event {
            AgentEvent::Message { message, .. } => {
                if let Some(acc) = state.accumulators.get_mut(&session_id) {
                    acc.push(message);
                }
            }
            AgentEvent::MessageUpdate { message_id, content, .. } => {
                if let Some(acc) = state.accumulators.get_mut(&session_id) {
                    acc.apply_update(&message_id, &content);
                }
            }
            AgentEvent::Complete { .. } => {
                if let Some(acc) = state.accumulators.get_mut(&session_id) {
                    acc.resolve_complete();
                }
            }
            AgentEvent::Error { message, .. } => {
                if let Some(acc) = state.accumulators.get_mut(&session_id) {
                    acc.resolve_error(MultiplexError::Agent(message));
                }
            }
            AgentEvent::PermissionRequest { request, .. } => {
                let Some(key) = state.session_keys.get(&session_id).cloned() else {
                    warn!(session_id, "permission request for a session with no known conversation");
                    return;
                };
                let prompt = build_confirmation_prompt(
                    &request.tool_name,
                    &request.tool_input,
                    request.confirmation_question.as_deref(),
                );
                let pending = PendingIMPermission::new(
                    key.clone(),
                    session_id.clone(),
                    request.request_id.clone(),
                    request.tool_name.clone(),
                    request.tool_input.clone(),
                );
                state.pending.install(pending);
                if let Some(acc) = state.accumulators.get_mut(&session_id) {
                    acc.resolve_with_prompt(prompt);
                }
            }
        }
    }

    /// Translate an inbound message into either a permission-confirmation
    /// reply or a new agent turn (§4.1).
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexError`] on timeout, abort, or supersession.
    pub async fn process_message(&self, message: IMMessage) -> std::result::Result<String, MultiplexError> {
        let span = info_span!("process_message", conversation_id = %message.conversation_id, platform = %message.platform);
        let _guard = span.enter();

        let key = message.conversation_key();
        let pending_exists = {
            let state = self.state.lock().await;
            state.pending.get(&key).cloned()
        };

        if let Some(pending) = pending_exists {
            return self.handle_pending_confirmation(&key, &pending, &message.content).await;
        }

        self.dispatch_turn(&key, &message, false).await
    }

    async fn handle_pending_confirmation(
        &self,
        key: &ConversationKey,
        pending: &PendingIMPermission,
        raw_content: &str,
    ) -> std::result::Result<String, MultiplexError> {
        {
            let mut state = self.state.lock().await;
            if state.pending.is_expired(key) {
                state.pending.clear(key);
                drop(state);
                self.runner
                    .respond_to_permission(&pending.request_id, PermissionResult::deny("confirmation timed out"))
                    .await;
                return Ok("This confirmation has expired, please resend your request.".to_owned());
            }
        }

        let normalized = pending_permission::normalize(raw_content);
        match pending_permission::classify(&normalized) {
            ConfirmationMatch::Deny => {
                let mut state = self.state.lock().await;
                state.pending.clear(key);
                drop(state);
                self.runner
                    .respond_to_permission(&pending.request_id, PermissionResult::deny("denied by IM user"))
                    .await;
                Ok("Request denied.".to_owned())
            }
            ConfirmationMatch::Allow => {
                let mut state = self.state.lock().await;
                state.pending.clear(key);
                let rx = state.accumulators.install(pending.agent_session_id.clone());
                drop(state);

                let result = if pending.tool_name.eq_ignore_ascii_case("AskUserQuestion") {
                    let answers = pending_permission::synthesize_answers(&pending.tool_input, ALLOW_ONCE_LABEL);
                    PermissionResult::allow_with_input(answers)
                } else {
                    PermissionResult::allow()
                };
                self.runner.respond_to_permission(&pending.request_id, result).await;
                self.await_accumulator(rx).await
            }
            ConfirmationMatch::Empty | ConfirmationMatch::Unrecognized => {
                Ok("Please reply with \"允许\"/\"allow\" or \"拒绝\"/\"deny\" within 60s.".to_owned())
            }
        }
    }

    async fn dispatch_turn(
        &self,
        key: &ConversationKey,
        message: &IMMessage,
        force_new_session: bool,
    ) -> std::result::Result<String, MultiplexError> {
        let resolved = self.resolve_session(key, force_new_session).await;
        let mut session = match resolved {
            Ok(session) => session,
            Err(AppError::NotFound(_)) if !force_new_session => {
                let _ = self.session_repo.delete_mapping(key).await;
                return Box::pin(self.dispatch_turn(key, message, true)).await;
            }
            Err(err) => return Err(MultiplexError::Agent(err.to_string())),
        };

        let prompt_text = prompt::format_turn_prompt(message);
        let composed_prompt = prompt::compose_system_prompt(&session.system_prompt, &[]);
        let prompt_changed = session.set_system_prompt(composed_prompt);
        if prompt_changed {
            let _ = self.session_repo.update_session(&session).await;
        }

        let rx = {
            let mut state = self.state.lock().await;
            state.owned_sessions.insert(session.id.clone());
            state.session_keys.insert(session.id.clone(), key.clone());
            state.accumulators.install(session.id.clone())
        };

        let was_active = session.is_active();
        let start_result = if was_active {
            self.runner
                .continue_session(
                    session.clone(),
                    &prompt_text,
                    ContinueOptions {
                        system_prompt: session.system_prompt.clone(),
                        skill_ids: Vec::new(),
                    },
                )
                .await
        } else {
            self.runner
                .start_session(
                    session.clone(),
                    &prompt_text,
                    StartOptions {
                        workspace_root: session.workspace_root.clone(),
                        system_prompt: session.system_prompt.clone(),
                        skill_ids: Vec::new(),
                        auto_approve: false,
                        skip_initial_user_message: false,
                        execution_mode: session.execution_mode,
                    },
                )
                .await
        };

        if let Err(err) = start_result {
            let mut state = self.state.lock().await;
            if let Some(mut acc) = state.accumulators.take(&session.id) {
                acc.resolve_error(MultiplexError::Agent(err.to_string()));
            }
            return Err(MultiplexError::Agent(err.to_string()));
        }

        self.await_accumulator(rx).await
    }

    async fn await_accumulator(
        &self,
        rx: tokio::sync::oneshot::Receiver<accumulator::AccumulatorResult>,
    ) -> std::result::Result<String, MultiplexError> {
        match tokio::time::timeout(self.turn_timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_canceled)) => Err(MultiplexError::SessionAborted),
            Err(_elapsed) => Err(MultiplexError::Timeout),
        }
    }

    async fn resolve_session(&self, key: &ConversationKey, force_new_session: bool) -> Result<AgentSession> {
        if force_new_session {
            return self.create_session_for_conversation(key).await;
        }

        let mapping = self.session_repo.get_mapping(key).await?;
        if let Some(mapping) = mapping {
            if let Some(session) = self.session_repo.get_session(&mapping.agent_session_id).await? {
                return Ok(session);
            }
            return Err(AppError::NotFound(format!(
                "session {} not found",
                mapping.agent_session_id
            )));
        }

        self.create_session_for_conversation(key).await
    }

    async fn create_session_for_conversation(&self, key: &ConversationKey) -> Result<AgentSession> {
        let workspace_root = validated_default_workspace_root(key)?;
        let session = AgentSession::new(workspace_root, default_system_prompt(), ExecutionMode::Auto);
        self.session_repo.create_session(&session).await?;
        let mapping = crate::models::session::SessionMapping::new(key, session.id.clone());
        self.session_repo.upsert_mapping(&mapping).await?;
        info!(session_id = %session.id, conversation = %key, "created new agent session");
        Ok(session)
    }

    /// Detach the mapping, drop in-memory state, and stop the underlying
    /// agent session. Idempotent.
    pub async fn clear_session_for_conversation(&self, key: &ConversationKey) {
        let mapping = self.session_repo.get_mapping(key).await.ok().flatten();
        let _ = self.session_repo.delete_mapping(key).await;

        if let Some(mapping) = mapping {
            self.runner.stop_session(&mapping.agent_session_id).await;
            let mut state = self.state.lock().await;
            state.owned_sessions.remove(&mapping.agent_session_id);
            state.session_keys.remove(&mapping.agent_session_id);
            state.accumulators.take(&mapping.agent_session_id);
            let _ = self.session_repo.delete_session(&mapping.agent_session_id).await;
        }
    }
}

fn build_confirmation_prompt(
    tool_name: &str,
    tool_input: &serde_json::Value,
    confirmation_question: Option<&str>,
) -> String {
    if let Some(question) = confirmation_question {
        return format!("{question}\n\nReply \"{ALLOW_ONCE_LABEL}\" or \"{DENY_ONCE_LABEL}\" within 60s.");
    }

    if tool_name.eq_ignore_ascii_case("AskUserQuestion") {
        let question = tool_input
            .get("questions")
            .and_then(|q| q.as_array())
            .and_then(|qs| qs.first())
            .and_then(|q| q.get("question").or_else(|| q.get("text")))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("The agent needs your input.");
        format!("{question}\n\nReply \"{ALLOW_ONCE_LABEL}\" or \"{DENY_ONCE_LABEL}\" within 60s.")
    } else {
        format!(
            "The agent wants to use {tool_name}. Reply \"{ALLOW_ONCE_LABEL}\" or \"{DENY_ONCE_LABEL}\" within 60s."
        )
    }
}

fn default_system_prompt() -> String {
    "You are a helpful coding and operations assistant.".to_owned()
}

fn validated_default_workspace_root(key: &ConversationKey) -> Result<String> {
    let base = std::env::var("IM_COWORK_WORKSPACE_ROOT").unwrap_or_else(|_| "/tmp/im-cowork-workspaces".to_owned());
    let root = std::path::Path::new(&base).join(sanitize_path_segment(&key.platform)).join(sanitize_path_segment(&key.conversation_id));
    std::fs::create_dir_all(&root).map_err(|err| AppError::Config(format!("failed to create workspace root: {err}")))?;
    root.canonicalize()
        .map(|p| p.display().to_string())
        .map_err(|err| AppError::Config(format!("invalid workspace root: {err}")))
}

fn sanitize_path_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplex_error_display_matches_expected_wording() {
        assert_eq!(MultiplexError::Timeout.to_string(), "turn timed out");
        assert_eq!(MultiplexError::Replaced.to_string(), "replaced by a newer IM request");
    }

    #[test]
    fn sanitize_path_segment_replaces_unsafe_characters() {
        assert_eq!(sanitize_path_segment("platform:123/../x"), "platform_123___x");
    }

    #[test]
    fn confirmation_prompt_prefers_the_carried_question_over_generic_wording() {
        let prompt = build_confirmation_prompt("Bash", &serde_json::json!({}), Some("rm -rf build/"));
        assert!(prompt.contains("rm -rf build/"));
        assert!(prompt.contains(ALLOW_ONCE_LABEL));
    }

    #[test]
    fn confirmation_prompt_falls_back_to_generic_wording_without_a_carried_question() {
        let prompt = build_confirmation_prompt("Bash", &serde_json::json!({}), None);
        assert!(prompt.contains("wants to use Bash"));
    }

    #[test]
    fn confirmation_prompt_reads_ask_user_question_text_from_input_as_a_fallback() {
        let input = serde_json::json!({ "questions": [{ "question": "Deploy to prod?" }] });
        let prompt = build_confirmation_prompt("AskUserQuestion", &input, None);
        assert!(prompt.contains("Deploy to prod?"));
    }
}
