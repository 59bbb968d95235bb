//! Local IPC server for `im-cowork-gatewayctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! via the `interprocess` crate. Accepts line-delimited JSON commands and
//! routes them to the appropriate handler.
//!
//! Grounded on the teacher's `ipc::server` — same listener/dispatch shape,
//! retargeted from Slack-approval verbs to this gateway's surface.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "approve", "request_id": "req-123"}
//! {"command": "deny", "request_id": "req-123", "reason": "too risky"}
//! {"command": "mode", "session_id": "sess-1", "mode": "sandbox"}
//! {"command": "clear", "platform": "telegram", "conversation_id": "12345"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... }}
//! {"ok": false, "error": "not found"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::permission::PermissionResult;
use crate::models::session::{ConversationKey, ExecutionMode};
use crate::multiplexer::IMSessionMultiplexer;
use crate::persistence::session_repo::SessionRepo;
use crate::runner::SharedAgentRunner;
use crate::{AppError, Result};

/// Inbound IPC request from `im-cowork-gatewayctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Permission request id (for `approve`/`deny`).
    request_id: Option<String>,
    /// Denial reason (for `deny`).
    reason: Option<String>,
    /// Target session id (for `mode`).
    session_id: Option<String>,
    /// Target execution mode (for `mode`): `local`, `sandbox`, or `auto`.
    mode: Option<String>,
    /// Target platform (for `clear`).
    platform: Option<String>,
    /// Target conversation id (for `clear`).
    conversation_id: Option<String>,
    /// Shared-secret authentication token.
    auth_token: Option<String>,
}

/// Outbound IPC response to `im-cowork-gatewayctl`.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }

    fn error(message: impl Into<String>) -> Self {
        Self { ok: false, data: None, error: Some(message.into()) }
    }
}

/// Shared state the IPC dispatcher reaches into. Deliberately narrow:
/// only what the control-socket surface needs, not the full gateway.
pub struct IpcState {
    /// Durable session/mapping store.
    pub session_repo: SessionRepo,
    /// Live agent runner, for resolving pending permissions.
    pub runner: SharedAgentRunner,
    /// Session multiplexer, for clearing a conversation's session.
    pub multiplexer: Arc<IMSessionMultiplexer>,
    /// Optional shared-secret required on every request.
    pub auth_token: Option<String>,
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    ipc_name: String,
    state: Arc<IpcState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = ipc_name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{ipc_name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %ipc_name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %ipc_name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<IpcState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response)
                        .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned());
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

async fn dispatch_command(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    let _guard = span.enter();

    if let Some(ref expected) = state.auth_token {
        match request.auth_token {
            Some(ref provided) if provided == expected => {}
            _ => {
                warn!(command = %request.command, "IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }
    }

    match request.command.as_str() {
        "list" => handle_list(state).await,
        "approve" => handle_resolve(request, state, true).await,
        "deny" => handle_resolve(request, state, false).await,
        "mode" => handle_mode(request, state).await,
        "clear" => handle_clear(request, state).await,
        other => IpcResponse::error(format!("unknown command: {other}")),
    }
}

async fn handle_list(state: &Arc<IpcState>) -> IpcResponse {
    match state.session_repo.list_running().await {
        Ok(sessions) => {
            let items: Vec<serde_json::Value> = sessions
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "session_id": s.id,
                        "status": format!("{:?}", s.status).to_lowercase(),
                        "execution_mode": format!("{:?}", s.execution_mode).to_lowercase(),
                        "workspace_root": s.workspace_root,
                        "updated_at": s.updated_at.to_rfc3339(),
                    })
                })
                .collect();
            IpcResponse::success(serde_json::json!({ "sessions": items }))
        }
        Err(err) => IpcResponse::error(format!("failed to list sessions: {err}")),
    }
}

async fn handle_resolve(request: &IpcRequest, state: &Arc<IpcState>, allow: bool) -> IpcResponse {
    let Some(ref request_id) = request.request_id else {
        return IpcResponse::error("missing required 'request_id' field");
    };

    let result = if allow {
        PermissionResult::allow()
    } else {
        let reason = request.reason.clone().unwrap_or_else(|| "denied via local CLI".to_owned());
        PermissionResult::deny(reason)
    };

    state.runner.respond_to_permission(request_id, result).await;

    info!(request_id = %request_id, allow, "permission resolved via IPC");
    IpcResponse::success(serde_json::json!({
        "request_id": request_id,
        "status": if allow { "allowed" } else { "denied" },
    }))
}

async fn handle_mode(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let Some(ref session_id) = request.session_id else {
        return IpcResponse::error("missing required 'session_id' field");
    };
    let Some(ref mode_str) = request.mode else {
        return IpcResponse::error("missing required 'mode' field");
    };

    let mode = match mode_str.as_str() {
        "local" => ExecutionMode::Local,
        "sandbox" => ExecutionMode::Sandbox,
        "auto" => ExecutionMode::Auto,
        other => return IpcResponse::error(format!("invalid mode: {other}")),
    };

    let mut session = match state.session_repo.get_session(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return IpcResponse::error(format!("no such session: {session_id}")),
        Err(err) => return IpcResponse::error(format!("failed to load session: {err}")),
    };

    let previous_mode = session.execution_mode;
    session.execution_mode = mode;

    if let Err(err) = state.session_repo.update_session(&session).await {
        return IpcResponse::error(format!("failed to update mode: {err}"));
    }

    info!(session_id = %session_id, ?previous_mode, current_mode = ?mode, "mode changed via IPC");
    IpcResponse::success(serde_json::json!({
        "previous_mode": format!("{previous_mode:?}").to_lowercase(),
        "current_mode": mode_str,
    }))
}

async fn handle_clear(request: &IpcRequest, state: &Arc<IpcState>) -> IpcResponse {
    let Some(ref platform) = request.platform else {
        return IpcResponse::error("missing required 'platform' field");
    };
    let Some(ref conversation_id) = request.conversation_id else {
        return IpcResponse::error("missing required 'conversation_id' field");
    };

    let key = ConversationKey::new(platform.clone(), conversation_id.clone());
    state.multiplexer.clear_session_for_conversation(&key).await;

    info!(%platform, %conversation_id, "conversation session cleared via IPC");
    IpcResponse::success(serde_json::json!({ "platform": platform, "conversation_id": conversation_id }))
}
