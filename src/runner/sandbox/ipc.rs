//! File-based request/response IPC with a sandbox VM (§4.2).
//!
//! Each session owns a private directory: the host drops one JSON file
//! per outstanding request (`<request_id>.req`) and polls for the
//! matching `<request_id>.resp`. Correlation is always by `request_id`,
//! never by position — the guest is free to answer out of order.
//!
//! Grounded on the teacher's `ipc::server` JSON-line request/response
//! shape, adapted from a long-lived socket listener to a short-lived
//! polling file exchange (the guest side has no open host socket to
//! write back on).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::time::{sleep, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::{AppError, Result};

/// Poll interval while waiting on a heartbeat or response file.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Cap on VM readiness polling (§5 Timers).
const READINESS_CAP: Duration = Duration::from_secs(60);
/// A heartbeat older than this is considered stale.
const HEARTBEAT_FRESHNESS: Duration = Duration::from_secs(10);

/// A request sent to the sandbox guest over the IPC directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Correlates this request to its eventual response.
    pub request_id: String,
    /// Request payload (turn input, permission decision, host-tool reply).
    pub payload: serde_json::Value,
}

/// A response received from the sandbox guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// The request this response answers.
    pub request_id: String,
    /// Response payload.
    pub payload: serde_json::Value,
}

/// Owns one session's private IPC directory on the host side.
pub struct IpcDirectory {
    root: PathBuf,
}

impl IpcDirectory {
    /// Create (or reuse) the private IPC directory for `session_id` under
    /// `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Sandbox`] if the directory cannot be created.
    pub async fn create(base_dir: &Path, session_id: &str) -> Result<Self> {
        let root = base_dir.join(session_id);
        fs::create_dir_all(&root)
            .await
            .map_err(|err| AppError::Sandbox(format!("creating IPC directory: {err}")))?;
        Ok(Self { root })
    }

    fn heartbeat_path(&self) -> PathBuf {
        self.root.join("heartbeat")
    }

    fn request_path(&self, request_id: &str) -> PathBuf {
        self.root.join(format!("{request_id}.req"))
    }

    fn response_path(&self, request_id: &str) -> PathBuf {
        self.root.join(format!("{request_id}.resp"))
    }

    /// Write a request file and poll for its matching response, up to
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Timeout`] if no response file appears in time,
    /// or [`AppError::Sandbox`] on an I/O failure.
    pub async fn send_request(&self, payload: serde_json::Value, timeout: Duration) -> Result<IpcResponse> {
        let request_id = Uuid::new_v4().to_string();
        let request = IpcRequest { request_id: request_id.clone(), payload };
        let body = serde_json::to_vec(&request).map_err(|err| AppError::Sandbox(err.to_string()))?;
        fs::write(self.request_path(&request_id), body)
            .await
            .map_err(|err| AppError::Sandbox(format!("writing IPC request: {err}")))?;

        let deadline = Instant::now() + timeout;
        loop {
            let response_path = self.response_path(&request_id);
            if let Ok(bytes) = fs::read(&response_path).await {
                let response: IpcResponse =
                    serde_json::from_slice(&bytes).map_err(|err| AppError::Sandbox(err.to_string()))?;
                let _ = fs::remove_file(&response_path).await;
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(AppError::Timeout(format!(
                    "no IPC response for request {request_id} within {timeout:?}"
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll the heartbeat file until it reports a fresh timestamp and the
    /// IPC directory is mounted, or [`READINESS_CAP`] elapses.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Timeout`] if the VM never becomes ready.
    pub async fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READINESS_CAP;
        loop {
            if let Ok(bytes) = fs::read(self.heartbeat_path()).await {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    if let Ok(epoch_secs) = text.trim().parse::<i64>() {
                        let now = chrono::Utc::now().timestamp();
                        let age = now.saturating_sub(epoch_secs);
                        if (0..HEARTBEAT_FRESHNESS.as_secs() as i64).contains(&age) {
                            debug!(session_ipc = %self.root.display(), "sandbox VM reported ready");
                            return Ok(());
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(AppError::Timeout("sandbox VM did not become ready within 60s".into()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Remove the IPC directory and everything in it.
    pub async fn cleanup(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_request_times_out_when_no_response_file_appears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipc = IpcDirectory::create(dir.path(), "sess-1").await.expect("create");
        let result = ipc
            .send_request(serde_json::json!({"ping": true}), Duration::from_millis(150))
            .await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }

    #[tokio::test]
    async fn wait_ready_succeeds_once_a_fresh_heartbeat_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ipc = IpcDirectory::create(dir.path(), "sess-2").await.expect("create");
        let now = chrono::Utc::now().timestamp();
        fs::write(ipc.heartbeat_path(), now.to_string())
            .await
            .expect("write heartbeat");
        ipc.wait_ready().await.expect("fresh heartbeat is ready");
    }
}
