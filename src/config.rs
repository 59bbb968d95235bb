//! Global configuration parsing and validation (§6 "Session mapping
//! persistence schema" siblings: platform credentials, timeouts, retention).
//!
//! Grounded on the teacher's `config::GlobalConfig` — same
//! load-from-TOML-then-validate shape — retargeted from a single Slack
//! config block to a per-platform [`TransportConfig`] map plus the
//! gateway's turn/permission/VM-readiness timeouts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Per-platform transport credentials and enable flag.
///
/// Field presence requirements vary by platform (§6 "Transport
/// connectivity hints"): Telegram needs `bot_token`; DingTalk needs
/// `client_id` + `client_secret`; WeCom needs `gateway_url` + `token`
/// (+ `encoding_aes_key` for callback decryption); Feishu needs
/// `app_id` + `app_secret`; Discord needs `bot_token`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TransportConfig {
    /// Whether this platform's transport should be started.
    pub enabled: bool,
    /// Bot API token (Telegram, Discord).
    pub bot_token: Option<String>,
    /// OAuth client id (DingTalk).
    pub client_id: Option<String>,
    /// OAuth client secret (DingTalk).
    pub client_secret: Option<String>,
    /// App id (Feishu).
    pub app_id: Option<String>,
    /// App secret (Feishu).
    pub app_secret: Option<String>,
    /// Relay base URL (WeCom).
    pub gateway_url: Option<String>,
    /// Callback verification token (WeCom).
    pub token: Option<String>,
    /// Base64-encoded 43-character `EncodingAESKey` (WeCom).
    pub encoding_aes_key: Option<String>,
}

/// Configurable timeout values (seconds) for blocking agent interactions
/// (§5 Timers).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Per-turn timeout.
    #[serde(default = "default_turn_seconds")]
    pub turn_seconds: u64,
    /// Per-permission text-confirmation timeout.
    #[serde(default = "default_permission_seconds")]
    pub permission_seconds: u64,
    /// Sandbox VM readiness poll cap.
    #[serde(default = "default_vm_readiness_seconds")]
    pub vm_readiness_seconds: u64,
}

const fn default_turn_seconds() -> u64 {
    300
}

const fn default_permission_seconds() -> u64 {
    60
}

const fn default_vm_readiness_seconds() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            turn_seconds: default_turn_seconds(),
            permission_seconds: default_permission_seconds(),
            vm_readiness_seconds: default_vm_readiness_seconds(),
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Absolute workspace root used as the parent of every per-conversation
    /// session workspace.
    pub workspace_root: PathBuf,
    /// Per-platform transport configuration, keyed by platform name
    /// (`"telegram"`, `"wecom"`, `"dingtalk"`, `"feishu"`, `"discord"`).
    #[serde(default)]
    pub transports: HashMap<String, TransportConfig>,
    /// Authorized sender ids allowed to start sessions, keyed by platform.
    #[serde(default)]
    pub authorized_user_ids: HashMap<String, Vec<String>>,
    /// Maximum concurrent agent sessions.
    pub max_concurrent_sessions: u32,
    /// Host CLI binary driving the agent runtime (e.g. `claude`).
    pub host_cli: String,
    /// Default arguments for the host CLI.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Named pipe / Unix socket identifier for the control CLI.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Timeout configuration for blocking flows.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Days a completed/errored session (and its media) is retained before
    /// purge (§5 Timers: 7-day media GC).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_ipc_name() -> String {
    "im-cowork-gateway".to_owned()
}

const fn default_retention_days() -> u32 {
    7
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute path to the workspace root.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Derived path for the persisted `SQLite` database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.workspace_root.join(".im-cowork").join("gateway.db")
    }

    /// Derived path for the daily-rotating audit log.
    #[must_use]
    pub fn audit_log_dir(&self) -> PathBuf {
        self.workspace_root.join(".im-cowork").join("logs")
    }

    /// Derived path for downloaded media attachments.
    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.workspace_root.join(".im-cowork").join("media")
    }

    /// Validate that a sender is authorized to start or continue a session
    /// on a given platform.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthorized` if the sender is not in the
    /// platform's allowed list. A platform with no configured allowlist
    /// permits every sender.
    pub fn ensure_authorized(&self, platform: &str, sender_id: &str) -> Result<()> {
        match self.authorized_user_ids.get(platform) {
            None => Ok(()),
            Some(allowed) if allowed.is_empty() => Ok(()),
            Some(allowed) if allowed.iter().any(|id| id == sender_id) => Ok(()),
            Some(_) => Err(AppError::Unauthorized(format!(
                "sender {sender_id} is not authorized on {platform}"
            ))),
        }
    }

    /// Load platform credentials from the OS keyring, falling back to the
    /// values already present from TOML/env when the keyring has no entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a keyring lookup fails for a reason
    /// other than "no entry" (e.g. the platform keyring service is
    /// unavailable).
    pub fn load_credentials(&mut self) -> Result<()> {
        for (platform, transport) in &mut self.transports {
            if transport.bot_token.is_none() {
                transport.bot_token = keyring_lookup(platform, "bot_token")?;
            }
            if transport.client_secret.is_none() {
                transport.client_secret = keyring_lookup(platform, "client_secret")?;
            }
            if transport.app_secret.is_none() {
                transport.app_secret = keyring_lookup(platform, "app_secret")?;
            }
            if transport.encoding_aes_key.is_none() {
                transport.encoding_aes_key = keyring_lookup(platform, "encoding_aes_key")?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.host_cli.trim().is_empty() {
            return Err(AppError::Config("host_cli must not be empty".into()));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}

/// Look up a credential in the OS keyring under service `im-cowork-gateway`
/// and username `<platform>:<field>`. A missing entry is not an error.
fn keyring_lookup(platform: &str, field: &str) -> Result<Option<String>> {
    let username = format!("{platform}:{field}");
    let entry = keyring::Entry::new("im-cowork-gateway", &username)
        .map_err(|err| AppError::Config(format!("keyring unavailable: {err}")))?;
    match entry.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(AppError::Config(format!(
            "keyring lookup failed for {username}: {err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml(workspace: &str) -> String {
        format!(
            r#"
workspace_root = "{workspace}"
max_concurrent_sessions = 4
host_cli = "claude"

[transports.telegram]
enabled = true
bot_token = "123:abc"
"#
        )
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let dir = std::env::temp_dir();
        let config = GlobalConfig::from_toml_str(&sample_toml(&dir.to_string_lossy())).expect("parse");
        assert_eq!(config.max_concurrent_sessions, 4);
        assert_eq!(config.timeouts.turn_seconds, 300);
        assert_eq!(config.timeouts.permission_seconds, 60);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.ipc_name, "im-cowork-gateway");
        assert!(config.transports["telegram"].enabled);
    }

    #[test]
    fn rejects_zero_max_concurrent_sessions() {
        let dir = std::env::temp_dir();
        let mut raw = sample_toml(&dir.to_string_lossy());
        raw = raw.replace("max_concurrent_sessions = 4", "max_concurrent_sessions = 0");
        let err = GlobalConfig::from_toml_str(&raw).expect_err("should reject");
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn ensure_authorized_allows_any_sender_when_allowlist_absent() {
        let dir = std::env::temp_dir();
        let config = GlobalConfig::from_toml_str(&sample_toml(&dir.to_string_lossy())).expect("parse");
        assert!(config.ensure_authorized("telegram", "anyone").is_ok());
    }

    #[test]
    fn ensure_authorized_rejects_sender_outside_configured_allowlist() {
        let dir = std::env::temp_dir();
        let mut config = GlobalConfig::from_toml_str(&sample_toml(&dir.to_string_lossy())).expect("parse");
        config
            .authorized_user_ids
            .insert("telegram".into(), vec!["u1".into()]);
        assert!(config.ensure_authorized("telegram", "u1").is_ok());
        assert!(config.ensure_authorized("telegram", "u2").is_err());
    }

    #[test]
    fn db_and_audit_paths_nest_under_workspace_root() {
        let dir = std::env::temp_dir();
        let config = GlobalConfig::from_toml_str(&sample_toml(&dir.to_string_lossy())).expect("parse");
        assert!(config.db_path().starts_with(&config.workspace_root));
        assert!(config.audit_log_dir().starts_with(&config.workspace_root));
        assert!(config.media_dir().starts_with(&config.workspace_root));
    }
}
