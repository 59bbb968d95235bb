//! Sandbox VM spawn with acceleration retry ladder (§4.2).
//!
//! Grounded on the teacher's `orchestrator::spawner::spawn_session` for
//! the `Command` construction shape, generalized from a single spawn
//! attempt to the spec's three-attempt ladder: try the platform's
//! preferred hardware acceleration, retry via a session-helper relaunch
//! or software emulation on failure, and give the caller a clean signal
//! to fail over to local execution in `auto` mode.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, info_span, warn};

use crate::{AppError, Result};

use super::ipc::IpcDirectory;

/// Maximum spawn attempts before giving up (§4.2).
const MAX_ATTEMPTS: u32 = 3;

/// Host-native hardware acceleration backend to request from the VM
/// hypervisor, in preference order per platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxAcceleration {
    /// Apple Hypervisor.framework (macOS).
    Hvf,
    /// Windows Hypervisor Platform.
    Whpx,
    /// KVM/native acceleration (Linux).
    Native,
    /// Software emulation fallback (no hardware acceleration).
    Emulated,
}

impl SandboxAcceleration {
    #[must_use]
    fn preferred_for_host() -> Self {
        if cfg!(target_os = "macos") {
            Self::Hvf
        } else if cfg!(target_os = "windows") {
            Self::Whpx
        } else {
            Self::Native
        }
    }

    fn cli_flag(self) -> &'static str {
        match self {
            Self::Hvf => "hvf",
            Self::Whpx => "whpx",
            Self::Native => "kvm",
            Self::Emulated => "tcg",
        }
    }
}

/// A spawned sandbox VM and its IPC channel.
pub struct SandboxHandle {
    /// The VM host-process child handle.
    pub child: Child,
    /// The session's private IPC directory.
    pub ipc: IpcDirectory,
    /// Which acceleration backend the VM actually started with.
    pub acceleration: SandboxAcceleration,
}

/// Spawn a sandbox VM for `session_id`, retrying across the acceleration
/// ladder up to [`MAX_ATTEMPTS`] times.
///
/// # Errors
///
/// Returns [`AppError::Sandbox`] if every attempt in the ladder fails.
pub async fn spawn_with_retry(session_id: &str, ipc_base_dir: &Path, vm_image: &str) -> Result<SandboxHandle> {
    let span = info_span!("spawn_sandbox", session_id);
    let _guard = span.enter();

    let ladder = acceleration_ladder();
    let mut last_error = None;

    for (attempt, acceleration) in ladder.into_iter().enumerate().take(MAX_ATTEMPTS as usize) {
        info!(attempt, ?acceleration, "attempting sandbox spawn");
        let ipc = IpcDirectory::create(ipc_base_dir, session_id).await?;
        match spawn_vm(session_id, vm_image, acceleration) {
            Ok(child) => {
                return Ok(SandboxHandle { child, ipc, acceleration });
            }
            Err(err) => {
                warn!(attempt, ?acceleration, %err, "sandbox spawn attempt failed");
                ipc.cleanup().await;
                last_error = Some(err);
            }
        }
    }

    Err(AppError::Sandbox(format!(
        "sandbox spawn exhausted {MAX_ATTEMPTS} attempts: {}",
        last_error.map_or_else(|| "unknown error".to_owned(), |e| e.to_string())
    )))
}

fn acceleration_ladder() -> Vec<SandboxAcceleration> {
    let preferred = SandboxAcceleration::preferred_for_host();
    match preferred {
        SandboxAcceleration::Hvf => vec![SandboxAcceleration::Hvf, SandboxAcceleration::Hvf, SandboxAcceleration::Emulated],
        SandboxAcceleration::Whpx => vec![SandboxAcceleration::Whpx, SandboxAcceleration::Emulated, SandboxAcceleration::Emulated],
        other => vec![other, SandboxAcceleration::Emulated, SandboxAcceleration::Emulated],
    }
}

fn spawn_vm(session_id: &str, vm_image: &str, acceleration: SandboxAcceleration) -> Result<Child> {
    let helper = std::env::var("IM_COWORK_SANDBOX_HELPER").unwrap_or_else(|_| "im-cowork-sandbox-vm".to_owned());
    let mut cmd = Command::new(helper);
    cmd.args(["--image", vm_image, "--accel", acceleration.cli_flag()])
        .env("IM_COWORK_SESSION_ID", session_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn()
        .map_err(|err| AppError::Sandbox(format!("failed to launch sandbox VM helper: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_always_has_exactly_three_entries() {
        assert_eq!(acceleration_ladder().len(), 3);
    }

    #[test]
    fn ladder_ends_in_software_emulation() {
        let ladder = acceleration_ladder();
        assert_eq!(*ladder.last().unwrap(), SandboxAcceleration::Emulated);
    }
}
