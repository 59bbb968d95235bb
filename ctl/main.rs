#![forbid(unsafe_code)]

//! `im-cowork-gatewayctl` — local CLI companion for `im-cowork-gateway`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.
//! Grounded on the teacher's `agent-intercom-ctl`, retargeted from
//! approval/resume/mode verbs to this gateway's session and permission
//! surface.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "im-cowork-gatewayctl",
    about = "Local CLI for im-cowork-gateway",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "im-cowork-gateway")]
    ipc_name: String,

    /// Shared-secret auth token, if the server requires one.
    #[arg(long)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List running agent sessions.
    List,

    /// Allow a pending tool-use permission request.
    Approve {
        /// Permission request ID.
        request_id: String,
    },

    /// Deny a pending tool-use permission request.
    Deny {
        /// Permission request ID.
        request_id: String,
        /// Optional denial reason surfaced to the agent.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Switch a session's execution mode.
    Mode {
        /// Target session ID.
        session_id: String,
        /// Target mode: `local`, `sandbox`, or `auto`.
        mode: String,
    },

    /// Clear the session mapped to an IM conversation.
    Clear {
        /// Originating platform (`telegram`, `wecom`, ...).
        platform: String,
        /// Platform-scoped conversation ID.
        conversation_id: String,
    },
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match &args.command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Approve { request_id } => {
            serde_json::json!({ "command": "approve", "request_id": request_id })
        }
        Command::Deny { request_id, reason } => {
            let mut req = serde_json::json!({ "command": "deny", "request_id": request_id });
            if let Some(r) = reason {
                req["reason"] = serde_json::Value::String(r.clone());
            }
            req
        }
        Command::Mode { session_id, mode } => {
            serde_json::json!({ "command": "mode", "session_id": session_id, "mode": mode })
        }
        Command::Clear { platform, conversation_id } => {
            serde_json::json!({
                "command": "clear",
                "platform": platform,
                "conversation_id": conversation_id,
            })
        }
    };

    if let Some(token) = &args.auth_token {
        request_json["auth_token"] = serde_json::Value::String(token.clone());
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is im-cowork-gateway running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
