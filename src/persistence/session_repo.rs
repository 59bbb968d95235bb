//! Repository for [`AgentSession`] and [`SessionMapping`] persistence
//! (§6).
//!
//! Grounded on the teacher's `persistence::session_repo::SessionRepo` —
//! same row-struct-plus-parse-helpers shape — retargeted at the spec's
//! two entities instead of the Slack-bound `Session` record.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{AgentSession, ConversationKey, ExecutionMode, SessionMapping, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session and mapping records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct AgentSessionRow {
    id: String,
    workspace_root: String,
    cwd: String,
    system_prompt: String,
    claude_session_id: Option<String>,
    execution_mode: String,
    status: String,
    created_at: String,
    updated_at: String,
}

fn parse_rfc3339(label: &str, value: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid {label}: {err}")))
}

fn parse_execution_mode(s: &str) -> Result<ExecutionMode> {
    match s {
        "local" => Ok(ExecutionMode::Local),
        "sandbox" => Ok(ExecutionMode::Sandbox),
        "auto" => Ok(ExecutionMode::Auto),
        other => Err(AppError::Db(format!("invalid execution_mode: {other}"))),
    }
}

fn execution_mode_str(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Local => "local",
        ExecutionMode::Sandbox => "sandbox",
        ExecutionMode::Auto => "auto",
    }
}

fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "idle" => Ok(SessionStatus::Idle),
        "running" => Ok(SessionStatus::Running),
        "completed" => Ok(SessionStatus::Completed),
        "error" => Ok(SessionStatus::Error),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Idle => "idle",
        SessionStatus::Running => "running",
        SessionStatus::Completed => "completed",
        SessionStatus::Error => "error",
    }
}

impl AgentSessionRow {
    fn into_session(self) -> Result<AgentSession> {
        Ok(AgentSession {
            id: self.id,
            workspace_root: self.workspace_root,
            cwd: self.cwd,
            system_prompt: self.system_prompt,
            claude_session_id: self.claude_session_id,
            execution_mode: parse_execution_mode(&self.execution_mode)?,
            status: parse_status(&self.status)?,
            messages: Vec::new(),
            created_at: parse_rfc3339("created_at", &self.created_at)?,
            updated_at: parse_rfc3339("updated_at", &self.updated_at)?,
        })
    }
}

impl SessionRepo {
    /// Construct a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new agent session (messages persist separately via
    /// [`super::message_repo::MessageRepo`]).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the insert fails.
    pub async fn create_session(&self, session: &AgentSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_session
             (id, workspace_root, cwd, system_prompt, claude_session_id, execution_mode, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&session.id)
        .bind(&session.workspace_root)
        .bind(&session.cwd)
        .bind(&session.system_prompt)
        .bind(&session.claude_session_id)
        .bind(execution_mode_str(session.execution_mode))
        .bind(status_str(session.status))
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch an agent session by id, without its message log.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the query fails.
    pub async fn get_session(&self, id: &str) -> Result<Option<AgentSession>> {
        let row: Option<AgentSessionRow> = sqlx::query_as("SELECT * FROM agent_session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(AgentSessionRow::into_session).transpose()
    }

    /// Persist the mutable fields of a session (status, prompt,
    /// continuation token, cwd, timestamps).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the update fails.
    pub async fn update_session(&self, session: &AgentSession) -> Result<()> {
        sqlx::query(
            "UPDATE agent_session
             SET cwd = ?1, system_prompt = ?2, claude_session_id = ?3, execution_mode = ?4,
                 status = ?5, updated_at = ?6
             WHERE id = ?7",
        )
        .bind(&session.cwd)
        .bind(&session.system_prompt)
        .bind(&session.claude_session_id)
        .bind(execution_mode_str(session.execution_mode))
        .bind(status_str(session.status))
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Delete an agent session and its messages.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if either delete fails.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_message WHERE session_id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        sqlx::query("DELETE FROM agent_session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Look up the durable conversation → session mapping.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the query fails.
    pub async fn get_mapping(&self, key: &ConversationKey) -> Result<Option<SessionMapping>> {
        let mapping: Option<SessionMapping> = sqlx::query_as(
            "SELECT im_conversation_id, platform, agent_session_id, created_at, last_active_at
             FROM session_mapping WHERE im_conversation_id = ?1 AND platform = ?2",
        )
        .bind(&key.conversation_id)
        .bind(&key.platform)
        .fetch_optional(self.db.as_ref())
        .await?;
        Ok(mapping)
    }

    /// Insert or replace a mapping for a conversation, updating
    /// `last_active_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the write fails.
    pub async fn upsert_mapping(&self, mapping: &SessionMapping) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_mapping (im_conversation_id, platform, agent_session_id, created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(im_conversation_id, platform) DO UPDATE SET
                 agent_session_id = excluded.agent_session_id,
                 last_active_at = excluded.last_active_at",
        )
        .bind(&mapping.im_conversation_id)
        .bind(&mapping.platform)
        .bind(&mapping.agent_session_id)
        .bind(mapping.created_at.to_rfc3339())
        .bind(mapping.last_active_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Remove a conversation's mapping. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the delete fails.
    pub async fn delete_mapping(&self, key: &ConversationKey) -> Result<()> {
        sqlx::query("DELETE FROM session_mapping WHERE im_conversation_id = ?1 AND platform = ?2")
            .bind(&key.conversation_id)
            .bind(&key.platform)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// List every interrupted-looking session (status `running` at the
    /// time of an unclean shutdown), used by the startup recovery scan.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the query fails.
    pub async fn list_running(&self) -> Result<Vec<AgentSession>> {
        let rows: Vec<AgentSessionRow> =
            sqlx::query_as("SELECT * FROM agent_session WHERE status = 'running'")
                .fetch_all(self.db.as_ref())
                .await?;
        rows.into_iter().map(AgentSessionRow::into_session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn create_then_get_round_trips_a_session() {
        let db = Arc::new(db::connect_memory().await.expect("connect"));
        let repo = SessionRepo::new(db);
        let session = AgentSession::new("/tmp/ws".into(), "sys".into(), ExecutionMode::Local);
        repo.create_session(&session).await.expect("create");

        let fetched = repo.get_session(&session.id).await.expect("query").expect("found");
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn mapping_upsert_then_get_round_trips() {
        let db = Arc::new(db::connect_memory().await.expect("connect"));
        let repo = SessionRepo::new(db);
        let key = ConversationKey::new("telegram", "123");
        let mapping = SessionMapping::new(&key, "sess-1".into());
        repo.upsert_mapping(&mapping).await.expect("upsert");

        let fetched = repo.get_mapping(&key).await.expect("query").expect("found");
        assert_eq!(fetched.agent_session_id, "sess-1");
    }

    #[tokio::test]
    async fn delete_mapping_is_idempotent() {
        let db = Arc::new(db::connect_memory().await.expect("connect"));
        let repo = SessionRepo::new(db);
        let key = ConversationKey::new("telegram", "missing");
        repo.delete_mapping(&key).await.expect("first delete");
        repo.delete_mapping(&key).await.expect("second delete is a no-op");
    }
}
