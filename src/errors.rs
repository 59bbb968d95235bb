//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes
/// named in §7 (Error Handling Design).
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Transport (platform bot client) failure.
    Transport(String),
    /// Agent runner or child process failure.
    Runner(String),
    /// Tool-safety policy evaluation failure.
    Policy(String),
    /// Sandbox VM spawn, IPC, or readiness failure.
    Sandbox(String),
    /// Local control-socket communication failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// A permission or accumulator has already been resolved.
    AlreadyConsumed(String),
    /// A suspension point exceeded its deadline (§5 Timers).
    Timeout(String),
    /// A newer request superseded this one (§3 invariant, §7).
    Superseded(String),
    /// `stopSession` / `clearSessionForConversation` cancelled the operation.
    SessionAborted(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Runner(msg) => write!(f, "runner: {msg}"),
            Self::Policy(msg) => write!(f, "policy: {msg}"),
            Self::Sandbox(msg) => write!(f, "sandbox: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::AlreadyConsumed(msg) => write!(f, "already consumed: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Superseded(msg) => write!(f, "superseded: {msg}"),
            Self::SessionAborted(msg) => write!(f, "session aborted: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
