//! Host child-process driver: spawns the agent CLI, parses its
//! `stream-json` stdout protocol, and republishes each line as runner
//! events (§4.2 "Event-stream interpretation").
//!
//! Grounded on the teacher's `orchestrator::spawner::spawn_session` for
//! the `Command` construction (`kill_on_drop`, piped stdio, env handoff)
//! and `orchestrator::child_monitor` for the stdout-line polling loop —
//! retargeted from an MCP-callback handshake to a self-contained
//! stream-JSON protocol read directly off the child's stdout/stdin.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn};

use crate::models::agent_message::{AgentMessage, AgentMessageType};
use crate::models::permission::{PermissionBehavior, PermissionRequest, PermissionResult};
use crate::{AppError, Result};

use super::policy::{self, ToolGate};
use super::sanitize::sanitize_value;
use super::throttle::EmitThrottle;
use super::AgentRunner;

/// Hard timeout on a pending tool-use permission before it is
/// auto-denied (§5 Timers).
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on buffered stderr tail kept for error reporting.
const STDERR_TAIL_BYTES: usize = 8_192;

/// Per-block character cap for assistant `text` blocks (§4.2, §8).
const TEXT_BLOCK_CAP: usize = 120_000;
/// Per-block character cap for assistant `thinking` blocks (§4.2, §8).
const THINKING_BLOCK_CAP: usize = 60_000;
/// Appended exactly once per block the first time it crosses its cap.
const TRUNCATION_SENTINEL: &str = "\n\n[truncated: block exceeded its character cap]";

/// Live state for one currently-open streaming block, keyed by block type
/// in [`run_turn`]'s `open_blocks` map.
struct OpenBlock {
    message_id: String,
    is_thinking: bool,
    /// Characters accepted into the message so far, excluding the
    /// truncation sentinel, used to enforce the per-block cap without
    /// re-reading the message's persisted content on every delta.
    accepted_len: usize,
    /// Set once the cap has been hit; further deltas on this block are
    /// dropped rather than appended (the sentinel runs exactly once).
    truncated: bool,
    throttle: EmitThrottle,
}

fn block_cap(is_thinking: bool) -> usize {
    if is_thinking {
        THINKING_BLOCK_CAP
    } else {
        TEXT_BLOCK_CAP
    }
}

/// The host CLI binary invoked to drive a turn. Overridable via
/// `IM_COWORK_HOST_CLI` for tests and alternate agent backends.
fn host_cli() -> String {
    std::env::var("IM_COWORK_HOST_CLI").unwrap_or_else(|_| "claude".to_owned())
}

/// Spawn the agent process for `session_id` and drive it to completion,
/// republishing every parsed event onto `runner`'s bus.
///
/// # Errors
///
/// Returns [`AppError::Runner`] if the process fails to spawn or exits
/// with a non-zero status, or [`AppError::SessionAborted`] if
/// `stop_session` was called mid-turn.
pub(super) async fn run_turn(
    runner: &AgentRunner,
    session_id: &str,
    prompt: &str,
    auto_approve: bool,
) -> Result<()> {
    let span = info_span!("run_turn", session_id);
    let _guard = span.enter();

    let resume_token = runner.current_claude_session_id(session_id).await;
    let mut child = spawn_child(session_id, prompt, resume_token.as_deref())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Runner("child process has no stdout pipe".into()))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Runner("child process has no stdin pipe".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Runner("child process has no stderr pipe".into()))?;

    let stderr_tail = spawn_stderr_collector(stderr);

    let mut reader = BufReader::new(stdout).lines();
    let mut open_blocks: std::collections::HashMap<String, OpenBlock> = std::collections::HashMap::new();

    loop {
        if runner.is_stop_requested(session_id).await {
            let _ = child.start_kill();
            return Err(AppError::SessionAborted(format!(
                "session {session_id} stopped mid-turn"
            )));
        }

        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => return Err(AppError::Runner(format!("reading agent stdout: {err}"))),
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(err) => {
                debug!(%err, line, "skipping non-JSON agent output line");
                continue;
            }
        };

        if handle_event(runner, session_id, &event, &mut open_blocks, &mut stdin, auto_approve).await? {
            break;
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| AppError::Runner(format!("waiting for child process: {err}")))?;

    if !status.success() {
        let tail = stderr_tail.await.unwrap_or_default();
        return Err(AppError::Runner(format!(
            "agent process exited with {status}: {tail}"
        )));
    }
    Ok(())
}

fn spawn_child(session_id: &str, prompt: &str, resume_token: Option<&str>) -> Result<Child> {
    let mut cmd = Command::new(host_cli());
    cmd.args(["--output-format", "stream-json", "--input-format", "stream-json"])
        .env("IM_COWORK_SESSION_ID", session_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(token) = resume_token {
        cmd.args(["--resume", token]);
    }

    let child = cmd
        .spawn()
        .map_err(|err| AppError::Runner(format!("failed to spawn agent process: {err}")))?;
    info!(pid = child.id(), prompt_len = prompt.len(), "agent process spawned");
    Ok(child)
}

/// Drain the child's stderr into a bounded tail, returned when the
/// process exits non-zero.
fn spawn_stderr_collector(
    stderr: tokio::process::ChildStderr,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        let mut tail = String::new();
        while let Ok(Some(line)) = reader.next_line().await {
            tail.push_str(&line);
            tail.push('\n');
            if tail.len() > STDERR_TAIL_BYTES {
                let excess = tail.len() - STDERR_TAIL_BYTES;
                tail.drain(0..excess);
            }
        }
        tail
    })
}

/// Handle one parsed stdout line. Returns `Ok(true)` when the turn is
/// fully sealed (a terminal `result` event was observed).
async fn handle_event(
    runner: &AgentRunner,
    session_id: &str,
    event: &Value,
    open_blocks: &mut std::collections::HashMap<String, OpenBlock>,
    stdin: &mut tokio::process::ChildStdin,
    auto_approve: bool,
) -> Result<bool> {
    let Some(kind) = event.get("type").and_then(Value::as_str) else {
        return Ok(false);
    };

    match kind {
        "stream_event" => handle_stream_event(runner, session_id, event, open_blocks).await,
        "assistant" => {
            handle_aggregated_assistant(runner, session_id, event, stdin, auto_approve).await?;
            Ok(false)
        }
        "user" => {
            handle_user_event(runner, session_id, event).await;
            Ok(false)
        }
        "result" => {
            handle_result(runner, session_id, event).await;
            Ok(true)
        }
        "system" => {
            handle_system(runner, session_id, event).await;
            Ok(false)
        }
        other => {
            debug!(event_type = other, "ignoring unrecognized stream-json event");
            Ok(false)
        }
    }
}

/// Streaming sub-events: `content_block_start`/`content_block_delta`/
/// `content_block_stop`/`message_stop` (§4.2). One streaming message is
/// kept per open block *type*, not one global pointer — interleaved
/// blocks across distinct block types are legal (§9).
async fn handle_stream_event(
    runner: &AgentRunner,
    session_id: &str,
    event: &Value,
    open_blocks: &mut std::collections::HashMap<String, OpenBlock>,
) -> Result<bool> {
    let Some(sub) = event.get("event") else {
        return Ok(false);
    };
    let Some(sub_type) = sub.get("type").and_then(Value::as_str) else {
        return Ok(false);
    };

    match sub_type {
        "content_block_start" => {
            let block_type = block_type_of(sub).unwrap_or_else(|| "text".to_owned());
            let is_thinking = block_type == "thinking";
            let message = AgentMessage::new_streaming(is_thinking);
            open_blocks.insert(
                block_type,
                OpenBlock {
                    message_id: message.id.clone(),
                    is_thinking,
                    accepted_len: 0,
                    truncated: false,
                    throttle: EmitThrottle::default(),
                },
            );
            runner.append_message(session_id, message).await;
        }
        "content_block_delta" => {
            let block_type = block_type_of(sub).unwrap_or_else(|| "text".to_owned());
            let delta_text = sub
                .get("delta")
                .and_then(|d| d.get("text").or_else(|| d.get("partial_json")))
                .and_then(Value::as_str)
                .unwrap_or_default();

            if let Some(block) = open_blocks.get_mut(&block_type) {
                if !block.truncated && !delta_text.is_empty() {
                    let cap = block_cap(block.is_thinking);
                    let remaining = cap.saturating_sub(block.accepted_len);
                    let delta_chars = delta_text.chars().count();
                    let accepted: String = delta_text.chars().take(remaining).collect();
                    let hit_cap = accepted.chars().count() < delta_chars;
                    block.accepted_len += accepted.chars().count();

                    let mut to_append = accepted;
                    if hit_cap {
                        to_append.push_str(TRUNCATION_SENTINEL);
                        block.truncated = true;
                    }

                    // Always accumulate into the message's persisted
                    // content; the throttle below gates only whether this
                    // particular delta also triggers a `messageUpdate`
                    // broadcast (§5 monotonicity, §8).
                    if !to_append.is_empty() {
                        if let Some(full_content) = runner
                            .accumulate_message(session_id, &block.message_id, &to_append, hit_cap)
                            .await
                        {
                            if block.throttle.should_emit(Instant::now(), hit_cap) {
                                runner.emit_message_update(session_id, &block.message_id, full_content);
                            }
                        }
                    }
                }
            }
        }
        "content_block_stop" => {
            let block_type = block_type_of(sub).unwrap_or_else(|| "text".to_owned());
            if let Some(block) = open_blocks.remove(&block_type) {
                runner.seal_message(session_id, &block.message_id).await;
            }
        }
        "message_stop" => {
            open_blocks.clear();
        }
        other => debug!(sub_type = other, "ignoring unrecognized streaming sub-event"),
    }
    Ok(false)
}

fn block_type_of(sub_event: &Value) -> Option<String> {
    sub_event
        .get("content_block")
        .and_then(|b| b.get("type"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Aggregated `assistant.message.content[]` event: carries fully-formed
/// tool-use blocks that must pass the policy gate before the turn may
/// proceed.
async fn handle_aggregated_assistant(
    runner: &AgentRunner,
    session_id: &str,
    event: &Value,
    stdin: &mut tokio::process::ChildStdin,
    auto_approve: bool,
) -> Result<()> {
    let Some(blocks) = event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Ok(());
    };

    for block in blocks {
        let Some(block_type) = block.get("type").and_then(Value::as_str) else {
            continue;
        };
        if block_type != "tool_use" {
            continue;
        }
        let tool_name = block
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let tool_use_id = block.get("id").and_then(Value::as_str).map(str::to_owned);
        let raw_input = block.get("input").cloned().unwrap_or(Value::Null);
        let sanitized_input = sanitize_value(&raw_input);

        let mut use_message = AgentMessage::new(AgentMessageType::ToolUse, String::new());
        use_message.metadata.tool_name = Some(tool_name.clone());
        use_message.metadata.tool_input = Some(sanitized_input.clone());
        use_message.metadata.tool_use_id = tool_use_id.clone();
        runner.append_message(session_id, use_message).await;

        let decision = resolve_tool_use(runner, session_id, &tool_name, &sanitized_input, auto_approve).await;
        send_permission_decision(stdin, tool_use_id.as_deref(), &decision).await?;
    }
    Ok(())
}

/// Aggregated `user.message.content[]` event: carries `tool_result`
/// blocks reporting the outcome of a previously requested tool use
/// (§4.2).
async fn handle_user_event(runner: &AgentRunner, session_id: &str, event: &Value) {
    let Some(blocks) = event
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return;
    };

    for block in blocks {
        let Some(block_type) = block.get("type").and_then(Value::as_str) else {
            continue;
        };
        if block_type != "tool_result" {
            continue;
        }

        let tool_use_id = block.get("tool_use_id").and_then(Value::as_str).map(str::to_owned);
        let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let content = tool_result_content_text(block.get("content"));

        let mut message = AgentMessage::new(AgentMessageType::ToolResult, content);
        message.metadata.tool_use_id = tool_use_id;
        message.metadata.is_error = is_error;
        runner.append_message(session_id, message).await;
    }
}

/// Flatten a `tool_result` block's `content`, sent by the host CLI either
/// as a plain string or as an array of `{type: "text", text}` blocks.
fn tool_result_content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Evaluate the policy gate, and if it requires a human decision, block
/// on the pending-permission channel up to the hard timeout.
async fn resolve_tool_use(
    runner: &AgentRunner,
    session_id: &str,
    tool_name: &str,
    sanitized_input: &Value,
    auto_approve: bool,
) -> PermissionResult {
    match policy::evaluate(tool_name, sanitized_input, auto_approve) {
        ToolGate::Allow => PermissionResult::allow(),
        ToolGate::Deny(result) => result,
        ToolGate::RequireApproval { question, .. } => {
            let request = PermissionRequest::new(
                session_id.to_owned(),
                tool_name.to_owned(),
                sanitized_input.clone(),
            )
            .with_confirmation_question(question);
            let rx = runner.register_pending_permission(&request).await;
            runner.emit_permission_request(session_id, request.clone());

            match timeout(PERMISSION_TIMEOUT, rx).await {
                Ok(Ok(result)) => {
                    if matches!(result.behavior, PermissionBehavior::Allow)
                        && tool_name.eq_ignore_ascii_case("AskUserQuestion")
                        && !policy::validate_ask_user_question_allow(result.updated_input.as_ref())
                    {
                        PermissionResult::deny("missing required answers on allow")
                    } else {
                        result
                    }
                }
                Ok(Err(_canceled)) => PermissionResult::deny("permission channel closed"),
                Err(_elapsed) => {
                    warn!(request_id = %request.request_id, "permission request timed out");
                    PermissionResult::deny("timed out waiting for a decision")
                }
            }
        }
    }
}

/// Write the resolved permission decision back to the child's stdin as a
/// `control_response` line, the stream-json control-plane message the
/// host CLI expects between a `tool_use` block and execution.
async fn send_permission_decision(
    stdin: &mut tokio::process::ChildStdin,
    tool_use_id: Option<&str>,
    decision: &PermissionResult,
) -> Result<()> {
    let payload = json!({
        "type": "control_response",
        "tool_use_id": tool_use_id,
        "behavior": match decision.behavior {
            PermissionBehavior::Allow => "allow",
            PermissionBehavior::Deny => "deny",
        },
        "updated_input": decision.updated_input,
        "message": decision.message,
    });
    let mut line = serde_json::to_string(&payload).map_err(|err| AppError::Runner(err.to_string()))?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|err| AppError::Runner(format!("writing control response: {err}")))?;
    Ok(())
}

async fn handle_result(runner: &AgentRunner, session_id: &str, event: &Value) {
    if let Some(text) = event.get("result").and_then(Value::as_str) {
        runner.upsert_final_message(session_id, text).await;
    }
}

async fn handle_system(runner: &AgentRunner, session_id: &str, event: &Value) {
    if event.get("subtype").and_then(Value::as_str) == Some("init") {
        if let Some(token) = event.get("session_id").and_then(Value::as_str) {
            debug!(claude_session_id = token, "agent reported system.init");
            runner.capture_claude_session_id(session_id, token).await;
        } else {
            debug!("agent reported system.init with no continuation token");
        }
        return;
    }
    if let Some(text) = event.get("message").and_then(Value::as_str) {
        let message = AgentMessage::new(AgentMessageType::System, text.to_owned());
        runner.append_message(session_id, message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_type_of_reads_nested_content_block_type() {
        let sub = json!({ "content_block": { "type": "thinking" } });
        assert_eq!(block_type_of(&sub), Some("thinking".to_owned()));
    }

    #[test]
    fn block_type_of_is_none_without_content_block() {
        let sub = json!({ "type": "message_stop" });
        assert_eq!(block_type_of(&sub), None);
    }
}
