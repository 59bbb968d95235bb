#![forbid(unsafe_code)]

//! `im-cowork-gateway` — IM-to-agent gateway server binary.
//!
//! Bootstraps configuration, persistence, the agent runner and
//! multiplexer, every enabled chat-platform transport, and the local IPC
//! control socket.
//!
//! Grounded on the teacher's `main.rs` bootstrap sequence (config load →
//! credential load → DB connect → retention spawn → shared state →
//! startup recovery scan → transport/IPC spawn → signal-driven graceful
//! shutdown), retargeted from a single MCP/Slack server to the gateway's
//! multi-platform transport fleet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use im_cowork_gateway::audit::{AuditEntry, AuditEventType, AuditLogger, JsonlAuditWriter};
use im_cowork_gateway::config::GlobalConfig;
use im_cowork_gateway::gateway::GatewayManager;
use im_cowork_gateway::ipc::server::{spawn_ipc_server, IpcState};
use im_cowork_gateway::models::session::SessionStatus;
use im_cowork_gateway::multiplexer::IMSessionMultiplexer;
use im_cowork_gateway::persistence::config_repo::ConfigRepo;
use im_cowork_gateway::persistence::message_repo::MessageRepo;
use im_cowork_gateway::persistence::session_repo::SessionRepo;
use im_cowork_gateway::persistence::{db, retention};
use im_cowork_gateway::runner::events::AgentEvent;
use im_cowork_gateway::runner::AgentRunner;
use im_cowork_gateway::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "im-cowork-gateway", about = "IM-to-agent gateway server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `config.toml` in the current working directory, which
    /// is the expected layout for a portable installation (binary +
    /// config.toml in the same folder).
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("im-cowork-gateway bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

/// Shared handles the shutdown sequence needs to unwind cleanly.
struct Runtime {
    session_repo: SessionRepo,
    runner: Arc<AgentRunner>,
    gateway: Arc<GatewayManager>,
    ipc_handle: tokio::task::JoinHandle<()>,
    retention_handle: tokio::task::JoinHandle<()>,
    audit_handle: tokio::task::JoinHandle<()>,
    audit: Arc<JsonlAuditWriter>,
}

async fn run(args: Cli) -> Result<()> {
    let config_text = std::fs::read_to_string(&args.config).map_err(|err| {
        AppError::Config(format!(
            "cannot read config file '{}': {err} — copy config.toml from the release \
             archive to the same directory as the binary, or pass --config <path>",
            args.config.display()
        ))
    })?;
    let mut config = GlobalConfig::from_toml_str(&config_text)?;

    if let Some(ws) = args.workspace {
        let canonical = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.workspace_root = canonical;
    }

    config.load_credentials()?;
    let config = Arc::new(config);
    info!("configuration loaded");

    let db_path = config.db_path().to_string_lossy().into_owned();
    let db = Arc::new(db::connect(&db_path).await?);
    info!("database connected");

    let ct = CancellationToken::new();
    let retention_handle = retention::spawn_retention_task(
        Arc::clone(&db),
        config.media_dir(),
        config.retention_days,
        ct.clone(),
    );
    info!("retention service started");

    let audit = Arc::new(JsonlAuditWriter::new(config.audit_log_dir())?);
    info!("audit logger ready");

    let session_repo = SessionRepo::new(Arc::clone(&db));
    let message_repo = MessageRepo::new(Arc::clone(&db));
    let config_repo = ConfigRepo::new(Arc::clone(&db));

    let runner = Arc::new(AgentRunner::new(message_repo, session_repo.clone()));
    let multiplexer = IMSessionMultiplexer::with_turn_timeout(
        Arc::clone(&runner),
        session_repo.clone(),
        Duration::from_secs(config.timeouts.turn_seconds),
    );

    let audit_handle = spawn_audit_subscriber(Arc::clone(&runner), Arc::clone(&audit));

    let gateway = Arc::new(GatewayManager::new(Arc::clone(&config), config_repo, Arc::clone(&multiplexer)));

    check_interrupted_on_startup(&session_repo).await;

    gateway.start_all_enabled().await;
    info!("enabled transports started");

    let ipc_state = Arc::new(IpcState {
        session_repo: session_repo.clone(),
        runner: Arc::clone(&runner),
        multiplexer: Arc::clone(&multiplexer),
        auth_token: None,
    });
    let ipc_handle = spawn_ipc_server(config.ipc_name.clone(), ipc_state, ct.clone())?;
    info!("IPC server started");

    let runtime = Runtime {
        session_repo,
        runner,
        gateway,
        ipc_handle,
        retention_handle,
        audit_handle,
        audit,
    };

    info!("im-cowork-gateway ready");

    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    ct.cancel();

    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    shutdown_with_timeout(runtime).await;
    info!("im-cowork-gateway shut down");

    Ok(())
}

/// Maximum time to wait for graceful shutdown before force-exiting.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

async fn shutdown_with_timeout(runtime: Runtime) {
    let Runtime { session_repo, runner, gateway, ipc_handle, retention_handle, audit_handle, audit } = runtime;

    let shutdown_fut = async {
        if let Err(err) = graceful_shutdown(&session_repo, &runner, &audit).await {
            error!(%err, "error during graceful shutdown persistence");
        }

        for platform in ["telegram", "wecom", "dingtalk", "feishu", "discord"] {
            gateway.stop(platform).await;
        }

        ipc_handle.abort();
        audit_handle.abort();
        let _ = retention_handle.await;
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_fut).await.is_err() {
        error!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "graceful shutdown timed out — exiting");
    }
}

/// Mark every running session as interrupted, denying any in-flight
/// permission wait (§5 "cancellation semantics": `stopSession` resolves
/// pending permissions `deny("aborted")`).
async fn graceful_shutdown(session_repo: &SessionRepo, runner: &AgentRunner, audit: &JsonlAuditWriter) -> Result<()> {
    let _span = tracing::info_span!("graceful_shutdown").entered();

    let running = session_repo.list_running().await.unwrap_or_default();
    for session in &running {
        runner.stop_session(&session.id).await;
        let mut interrupted = session.clone();
        interrupted.transition(SessionStatus::Error);
        if let Err(err) = session_repo.update_session(&interrupted).await {
            error!(session_id = %session.id, %err, "failed to persist interrupted session");
        }
        if let Err(err) = audit.log_entry(
            AuditEntry::new(AuditEventType::SessionInterrupt)
                .with_session(session.id.clone())
                .with_result("server shutdown".into()),
        ) {
            warn!(%err, "failed to record shutdown audit entry");
        }
    }

    info!(sessions = running.len(), "graceful shutdown persistence complete");
    Ok(())
}

/// Log any session left `running` at process start — it can only mean
/// the previous process died mid-turn — and mark it `error` so the next
/// inbound message on that conversation starts a fresh turn instead of
/// waiting on a session nothing will ever resume.
async fn check_interrupted_on_startup(session_repo: &SessionRepo) {
    let _span = tracing::info_span!("startup_recovery_check").entered();

    let running = session_repo.list_running().await.unwrap_or_default();
    if running.is_empty() {
        info!("no interrupted sessions found on startup");
        return;
    }

    info!(count = running.len(), "found sessions interrupted by a prior crash");
    for mut session in running {
        session.transition(SessionStatus::Error);
        if let Err(err) = session_repo.update_session(&session).await {
            error!(session_id = %session.id, %err, "failed to mark crashed session as errored");
        }
    }
}

/// Forward every runner event into the audit log, independent of which
/// conversation owns the session (§4.2, §7).
fn spawn_audit_subscriber(runner: Arc<AgentRunner>, audit: Arc<JsonlAuditWriter>) -> tokio::task::JoinHandle<()> {
    let mut events = runner.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(entry) = audit_entry_for(&event) {
                        if let Err(err) = audit.log_entry(entry) {
                            warn!(%err, "failed to write audit entry");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "audit subscriber lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn audit_entry_for(event: &AgentEvent) -> Option<AuditEntry> {
    match event {
        AgentEvent::PermissionRequest { session_id, request } => Some(
            AuditEntry::new(AuditEventType::ToolCall)
                .with_session(session_id.clone())
                .with_tool(request.tool_name.clone())
                .with_request_id(request.request_id.clone()),
        ),
        AgentEvent::Complete { session_id } => {
            Some(AuditEntry::new(AuditEventType::SessionComplete).with_session(session_id.clone()))
        }
        AgentEvent::Error { session_id, message } => Some(
            AuditEntry::new(AuditEventType::SessionError)
                .with_session(session_id.clone())
                .with_result(message.clone()),
        ),
        AgentEvent::Message { .. } | AgentEvent::MessageUpdate { .. } => None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
