//! `SQLite` schema bootstrap logic (§6 persisted schema).
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every server startup. Produces a convergent result.
//!
//! Grounded on the teacher's `persistence::schema::bootstrap_schema` for
//! the raw-SQL-blob-plus-index convention, generalized from the
//! orchestrator's session/approval/checkpoint tables to the spec's
//! `session_mapping`/`agent_session`/`agent_message`/`im_config` tables.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS agent_session (
    id                TEXT PRIMARY KEY NOT NULL,
    workspace_root    TEXT NOT NULL,
    cwd               TEXT NOT NULL,
    system_prompt     TEXT NOT NULL,
    claude_session_id TEXT,
    execution_mode    TEXT NOT NULL CHECK(execution_mode IN ('local','sandbox','auto')),
    status            TEXT NOT NULL CHECK(status IN ('idle','running','completed','error')),
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_mapping (
    im_conversation_id TEXT NOT NULL,
    platform           TEXT NOT NULL,
    agent_session_id   TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    last_active_at     TEXT NOT NULL,
    PRIMARY KEY (im_conversation_id, platform)
);

CREATE TABLE IF NOT EXISTS agent_message (
    id            TEXT PRIMARY KEY NOT NULL,
    session_id    TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    message_type  TEXT NOT NULL CHECK(message_type IN ('user','assistant','tool_use','tool_result','system')),
    content       TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS im_config (
    platform      TEXT PRIMARY KEY NOT NULL,
    config_json   TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_mapping_agent_session ON session_mapping(agent_session_id);
CREATE INDEX IF NOT EXISTS idx_agent_message_session_seq ON agent_message(session_id, seq);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
