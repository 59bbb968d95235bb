//! Retention service for time-based data purge (§2 Supplemented
//! Features, §5 Timers: 7-day media GC, daily).
//!
//! Grounded on the teacher's `persistence::retention::spawn_retention_task`
//! — same cancellable daily-interval background task shape — retargeted
//! from terminated-session/child-table purge to completed/errored agent
//! sessions and their downloaded attachment media.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::db::Database;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Spawn the retention purge background task.
///
/// Runs once a day. On each tick, deletes agent sessions (and their
/// message logs) that finished more than `retention_days` ago, then
/// removes any media files under `media_dir` older than the same window.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    media_dir: PathBuf,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge_sessions(&db, retention_days).await {
                        error!(?err, "session retention purge failed");
                    }
                    if let Err(err) = purge_media(&media_dir, retention_days).await {
                        error!(?err, "media retention purge failed");
                    }
                }
            }
        }
    })
}

async fn purge_sessions(db: &Database, retention_days: u32) -> Result<()> {
    let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();

    let stale_ids: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM agent_session WHERE status IN ('completed', 'error') AND updated_at < ?1",
    )
    .bind(&cutoff)
    .fetch_all(db)
    .await?;

    for (id,) in &stale_ids {
        sqlx::query("DELETE FROM agent_message WHERE session_id = ?1")
            .bind(id)
            .execute(db)
            .await?;
        sqlx::query("DELETE FROM agent_session WHERE id = ?1")
            .bind(id)
            .execute(db)
            .await?;
        sqlx::query("DELETE FROM session_mapping WHERE agent_session_id = ?1")
            .bind(id)
            .execute(db)
            .await?;
    }

    info!(purged = stale_ids.len(), retention_days, "session retention purge completed");
    Ok(())
}

async fn purge_media(media_dir: &std::path::Path, retention_days: u32) -> Result<()> {
    let Ok(mut entries) = tokio::fs::read_dir(media_dir).await else {
        return Ok(());
    };
    let cutoff = std::time::SystemTime::now() - Duration::from_secs(u64::from(retention_days) * 24 * 3600);
    let mut purged = 0usize;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if modified < cutoff {
            if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                warn!(path = %entry.path().display(), %err, "failed to purge stale media file");
                continue;
            }
            purged += 1;
        }
    }

    info!(purged, "media retention purge completed");
    Ok(())
}
