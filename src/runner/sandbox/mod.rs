//! Sandbox execution mode: runs the agent process in an isolated guest
//! VM reached over a private IPC channel instead of as a plain host
//! child process (§4.2 "Sandbox execution mode").
//!
//! Grounded on the teacher's `orchestrator::spawner` for the
//! spawn-with-retry shape, generalized from a single `Command::spawn`
//! attempt to the spec's three-attempt acceleration retry ladder.

pub mod host_tools;
pub mod ipc;
pub mod spawner;

pub use ipc::{IpcDirectory, IpcRequest, IpcResponse};
pub use spawner::{spawn_with_retry, SandboxAcceleration, SandboxHandle};
