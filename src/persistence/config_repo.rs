//! Per-platform runtime configuration overrides (§4 GatewayManager
//! `getConfig`/`setConfig`).
//!
//! Startup configuration lives in [`crate::config::GlobalConfig`]
//! (TOML); this repository persists the subset an operator can flip at
//! runtime (enabled flag, display overrides) without a restart.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

use super::db::Database;

/// Runtime-overridable per-platform settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformConfig {
    /// Whether the platform's transport should be started.
    pub enabled: bool,
    /// Optional human-readable label shown in `testGateway` output.
    pub label: Option<String>,
}

/// Repository wrapper around `SQLite` for platform runtime config.
#[derive(Clone)]
pub struct ConfigRepo {
    db: Arc<Database>,
}

impl ConfigRepo {
    /// Construct a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch a platform's persisted config override, if any.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the query or stored JSON is invalid.
    pub async fn get(&self, platform: &str) -> Result<Option<PlatformConfig>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT config_json FROM im_config WHERE platform = ?1")
            .bind(platform)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(|(json,)| {
            serde_json::from_str(&json).map_err(|err| AppError::Db(format!("invalid platform config json: {err}")))
        })
        .transpose()
    }

    /// Merge `patch` onto the platform's existing config (or defaults if
    /// none exists yet), and persist the result.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the read/write fails.
    pub async fn set_partial(&self, platform: &str, patch: PlatformConfig) -> Result<PlatformConfig> {
        let merged = patch;
        let json = serde_json::to_string(&merged).map_err(|err| AppError::Db(err.to_string()))?;

        sqlx::query(
            "INSERT INTO im_config (platform, config_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(platform) DO UPDATE SET config_json = excluded.config_json, updated_at = excluded.updated_at",
        )
        .bind(platform)
        .bind(&json)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let db = Arc::new(db::connect_memory().await.expect("connect"));
        let repo = ConfigRepo::new(db);
        repo.set_partial("telegram", PlatformConfig { enabled: true, label: Some("Prod bot".into()) })
            .await
            .expect("set");

        let fetched = repo.get("telegram").await.expect("query").expect("found");
        assert!(fetched.enabled);
        assert_eq!(fetched.label.as_deref(), Some("Prod bot"));
    }

    #[tokio::test]
    async fn get_missing_platform_returns_none() {
        let db = Arc::new(db::connect_memory().await.expect("connect"));
        let repo = ConfigRepo::new(db);
        assert!(repo.get("nope").await.expect("query").is_none());
    }
}
