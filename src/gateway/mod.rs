//! Transport lifecycle and connectivity surface (§4.3 `GatewayManager`).
//!
//! Grounded on the teacher's `orchestrator` module's pattern of one
//! supervisor owning a map of spawned task handles plus their
//! cancellation tokens, generalized here from agent sessions to chat
//! platform transports.

pub mod connectivity;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{GlobalConfig, TransportConfig};
use crate::multiplexer::IMSessionMultiplexer;
use crate::persistence::config_repo::{ConfigRepo, PlatformConfig};
use crate::transport::telegram::TelegramTransport;
use crate::transport::Transport;
use crate::{AppError, Result};

use connectivity::{test_gateway, ActivitySnapshot, GatewayTestReport};

/// The set of platform names this gateway knows how to construct a
/// transport for (§6 "Transport connectivity hints").
const KNOWN_PLATFORMS: &[&str] = &["telegram", "wecom", "dingtalk", "feishu", "discord"];

struct TransportHandle {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
    last_inbound_at: StdMutex<Option<DateTime<Utc>>>,
    last_outbound_at: StdMutex<Option<DateTime<Utc>>>,
}

/// Owns every running platform transport and the runtime config overrides
/// layered on top of [`GlobalConfig`] (§4.3).
pub struct GatewayManager {
    global_config: Arc<GlobalConfig>,
    config_repo: ConfigRepo,
    multiplexer: Arc<IMSessionMultiplexer>,
    handles: Mutex<HashMap<String, TransportHandle>>,
}

impl GatewayManager {
    /// Construct a manager over the given global config, runtime config
    /// repository, and multiplexer transports hand messages to.
    #[must_use]
    pub fn new(global_config: Arc<GlobalConfig>, config_repo: ConfigRepo, multiplexer: Arc<IMSessionMultiplexer>) -> Self {
        Self { global_config, config_repo, multiplexer, handles: Mutex::new(HashMap::new()) }
    }

    fn transport_config(&self, platform: &str) -> TransportConfig {
        self.global_config.transports.get(platform).cloned().unwrap_or_default()
    }

    /// Fetch the effective runtime config for `platform`: the persisted
    /// override if one exists, else derived from the static `enabled`
    /// flag in `GlobalConfig` (§4.3 `getConfig`).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the override lookup fails.
    pub async fn get_config(&self, platform: &str) -> Result<PlatformConfig> {
        if let Some(stored) = self.config_repo.get(platform).await? {
            return Ok(stored);
        }
        Ok(PlatformConfig { enabled: self.transport_config(platform).enabled, label: None })
    }

    /// Merge `patch` onto the platform's runtime config and persist it
    /// (§4.3 `setConfig`). Does not itself start or stop the transport;
    /// callers combine this with [`Self::start`]/[`Self::stop`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the write fails.
    pub async fn set_config(&self, platform: &str, patch: PlatformConfig) -> Result<PlatformConfig> {
        self.config_repo.set_partial(platform, patch).await
    }

    fn build_transport(&self, platform: &str, cancel: CancellationToken) -> Result<Arc<dyn Transport>> {
        match platform {
            "telegram" => {
                let config = self.transport_config(platform);
                let bot_token = config
                    .bot_token
                    .ok_or_else(|| AppError::Config("transports.telegram.bot_token is not set".into()))?;
                Ok(Arc::new(TelegramTransport::new(bot_token, Arc::clone(&self.multiplexer), None, cancel)))
            }
            "wecom" => Err(AppError::Config(
                "wecom has no running transport loop; callbacks are handled inline by the relay-facing decoder".into(),
            )),
            other if KNOWN_PLATFORMS.contains(&other) => {
                Err(AppError::Config(format!("{other} transport is not implemented in this build")))
            }
            other => Err(AppError::Config(format!("unknown platform: {other}"))),
        }
    }

    /// Start `platform`'s transport if it is not already running
    /// (§4.3 `start`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the platform is unknown or its
    /// credentials are missing.
    pub async fn start(&self, platform: &str) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if handles.contains_key(platform) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let transport = self.build_transport(platform, cancel.clone())?;
        let run_transport = Arc::clone(&transport);
        let join = tokio::spawn(async move {
            if let Err(err) = run_transport.run().await {
                warn!(platform = run_transport.platform(), %err, "transport run loop exited with error");
            }
        });

        handles.insert(
            platform.to_owned(),
            TransportHandle {
                transport,
                cancel,
                join: Some(join),
                last_inbound_at: StdMutex::new(None),
                last_outbound_at: StdMutex::new(None),
            },
        );
        info!(platform, "transport started");
        Ok(())
    }

    /// Stop `platform`'s transport if running; idempotent (§4.3 `stop`).
    pub async fn stop(&self, platform: &str) {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(platform) {
            handle.cancel.cancel();
            if let Some(join) = handle.join {
                join.abort();
            }
            info!(platform, "transport stopped");
        }
    }

    /// Start every platform whose persisted or static config marks it
    /// enabled (§4.3 `startAllEnabled`). Failures for individual
    /// platforms are logged, not propagated, so one bad credential does
    /// not block the rest of the fleet from starting.
    pub async fn start_all_enabled(&self) {
        for platform in KNOWN_PLATFORMS {
            let config = match self.get_config(platform).await {
                Ok(config) => config,
                Err(err) => {
                    warn!(platform, %err, "failed to load runtime config; skipping");
                    continue;
                }
            };
            if !config.enabled {
                continue;
            }
            if let Err(err) = self.start(platform).await {
                warn!(platform, %err, "failed to start enabled transport");
            }
        }
    }

    /// Attempt to restart every enabled platform whose transport is
    /// currently disconnected (§4.3 `reconnectAllDisconnected`).
    pub async fn reconnect_all_disconnected(&self) {
        let disconnected: Vec<String> = {
            let handles = self.handles.lock().await;
            handles
                .iter()
                .filter(|(_, handle)| !handle.transport.is_connected())
                .map(|(platform, _)| platform.clone())
                .collect()
        };
        for platform in disconnected {
            self.stop(&platform).await;
            if let Err(err) = self.start(&platform).await {
                warn!(platform = %platform, %err, "reconnect attempt failed");
            }
        }
    }

    /// Whether `platform`'s transport is currently running and connected
    /// (§4.3 `isConnected`).
    pub async fn is_connected(&self, platform: &str) -> bool {
        self.handles
            .lock()
            .await
            .get(platform)
            .is_some_and(|handle| handle.transport.is_connected())
    }

    /// Send an out-of-band notification through `platform`'s transport
    /// (§4.3 `sendNotification`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the platform has no running
    /// transport or the send fails.
    pub async fn send_notification(&self, platform: &str, text: &str) -> Result<()> {
        let transport = {
            let handles = self.handles.lock().await;
            handles
                .get(platform)
                .map(|handle| Arc::clone(&handle.transport))
                .ok_or_else(|| AppError::Transport(format!("{platform} has no running transport")))?
        };
        let result = transport.send_notification(text).await;
        if result.is_ok() {
            self.mark_outbound(platform).await;
        }
        result
    }

    async fn mark_outbound(&self, platform: &str) {
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(platform) {
            if let Ok(mut ts) = handle.last_outbound_at.lock() {
                *ts = Some(Utc::now());
            }
        }
    }

    /// Record that `platform` just delivered an inbound message, for the
    /// activity-threshold check in [`Self::test_gateway`].
    pub async fn mark_inbound(&self, platform: &str) {
        let handles = self.handles.lock().await;
        if let Some(handle) = handles.get(platform) {
            if let Ok(mut ts) = handle.last_inbound_at.lock() {
                *ts = Some(Utc::now());
            }
        }
    }

    /// Run the `testGateway` connectivity pipeline for `platform`, using
    /// `override_config` in place of the configured credentials if given
    /// (§4.3 `testGateway`).
    pub async fn test_gateway(&self, platform: &str, override_config: Option<TransportConfig>) -> GatewayTestReport {
        let config = override_config.unwrap_or_else(|| self.transport_config(platform));
        let enabled = self.get_config(platform).await.map(|c| c.enabled).unwrap_or(false);

        let handles = self.handles.lock().await;
        let handle = handles.get(platform);
        let activity = handle.map_or_else(ActivitySnapshot::default, |h| ActivitySnapshot {
            last_inbound_at: h.last_inbound_at.lock().ok().and_then(|g| *g),
            last_outbound_at: h.last_outbound_at.lock().ok().and_then(|g| *g),
        });
        let transport = handle.map(|h| h.transport.as_ref());

        test_gateway(platform, &config, enabled, transport, activity).await
    }
}
