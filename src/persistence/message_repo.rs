//! Repository for a session's ordered [`AgentMessage`] log (§6).
//!
//! AgentRunner is the log's single writer; the Multiplexer only reads it
//! (via [`crate::runner::events::AgentEvent`], not this repository
//! directly) per the shared-resource policy in §4.2.

use std::sync::Arc;

use chrono::Utc;

use crate::models::agent_message::{AgentMessage, AgentMessageMetadata, AgentMessageType};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for a session's message log.
#[derive(Clone)]
pub struct MessageRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct AgentMessageRow {
    id: String,
    message_type: String,
    content: String,
    metadata_json: String,
}

fn parse_message_type(s: &str) -> Result<AgentMessageType> {
    match s {
        "user" => Ok(AgentMessageType::User),
        "assistant" => Ok(AgentMessageType::Assistant),
        "tool_use" => Ok(AgentMessageType::ToolUse),
        "tool_result" => Ok(AgentMessageType::ToolResult),
        "system" => Ok(AgentMessageType::System),
        other => Err(AppError::Db(format!("invalid message_type: {other}"))),
    }
}

fn message_type_str(t: AgentMessageType) -> &'static str {
    match t {
        AgentMessageType::User => "user",
        AgentMessageType::Assistant => "assistant",
        AgentMessageType::ToolUse => "tool_use",
        AgentMessageType::ToolResult => "tool_result",
        AgentMessageType::System => "system",
    }
}

impl AgentMessageRow {
    fn into_message(self) -> Result<AgentMessage> {
        let metadata: AgentMessageMetadata = serde_json::from_str(&self.metadata_json)
            .map_err(|err| AppError::Db(format!("invalid message metadata json: {err}")))?;
        Ok(AgentMessage {
            id: self.id,
            message_type: parse_message_type(&self.message_type)?,
            content: self.content,
            metadata,
        })
    }
}

impl MessageRepo {
    /// Construct a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a message to a session's ordered log.
    ///
    /// `seq` is the caller-assigned position (the session's in-memory
    /// message count at append time), preserving total append order on
    /// replay.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the insert fails.
    pub async fn append(&self, session_id: &str, seq: i64, message: &AgentMessage) -> Result<()> {
        let metadata_json = serde_json::to_string(&message.metadata)
            .map_err(|err| AppError::Db(format!("failed to serialize message metadata: {err}")))?;

        sqlx::query(
            "INSERT INTO agent_message (id, session_id, seq, message_type, content, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&message.id)
        .bind(session_id)
        .bind(seq)
        .bind(message_type_str(message.message_type))
        .bind(&message.content)
        .bind(&metadata_json)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Replace an already-appended message's content and metadata
    /// in-place (streaming `messageUpdate` application).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the update fails.
    pub async fn update_content(&self, message_id: &str, content: &str, metadata: &AgentMessageMetadata) -> Result<()> {
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|err| AppError::Db(format!("failed to serialize message metadata: {err}")))?;
        sqlx::query("UPDATE agent_message SET content = ?1, metadata_json = ?2 WHERE id = ?3")
            .bind(content)
            .bind(&metadata_json)
            .bind(message_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// List a session's messages in append order.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Db`] if the query fails.
    pub async fn list(&self, session_id: &str) -> Result<Vec<AgentMessage>> {
        let rows: Vec<AgentMessageRow> = sqlx::query_as(
            "SELECT id, message_type, content, metadata_json FROM agent_message
             WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(AgentMessageRow::into_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::db;

    #[tokio::test]
    async fn append_then_list_preserves_order() {
        let db = Arc::new(db::connect_memory().await.expect("connect"));
        let repo = MessageRepo::new(db);
        let session_id = "sess-1";

        let first = AgentMessage::new(AgentMessageType::User, "hello".into());
        let second = AgentMessage::new(AgentMessageType::Assistant, "hi there".into());
        repo.append(session_id, 0, &first).await.expect("append first");
        repo.append(session_id, 1, &second).await.expect("append second");

        let messages = repo.list(session_id).await.expect("list");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].content, "hi there");
    }
}
