//! Shared test helpers for multiplexer-level integration tests.
//!
//! Provides reusable construction of an in-memory-backed
//! [`IMSessionMultiplexer`] and the env-var plumbing the runner's child
//! process spawn reads, so individual test modules can focus on
//! behaviour rather than boilerplate.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use im_cowork_gateway::models::im_message::IMMessage;
use im_cowork_gateway::multiplexer::IMSessionMultiplexer;
use im_cowork_gateway::persistence::db::{self, Database};
use im_cowork_gateway::persistence::message_repo::MessageRepo;
use im_cowork_gateway::persistence::session_repo::SessionRepo;
use im_cowork_gateway::runner::AgentRunner;

/// Absolute path to a fixture fake host CLI script under `tests/fixtures/`.
pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

/// Point the process-global workspace-root and host-CLI env vars at a
/// fresh temp directory and the given fixture script.
///
/// Callers must be `#[serial_test::serial]`: both env vars are
/// process-global mutable state.
pub fn configure_env(workspace_root: &Path, host_cli_fixture: &str) {
    std::env::set_var("IM_COWORK_WORKSPACE_ROOT", workspace_root);
    std::env::set_var("IM_COWORK_HOST_CLI", fixture(host_cli_fixture));
}

/// Build a multiplexer backed by a fresh in-memory database and the
/// given per-turn timeout.
pub async fn build_multiplexer(turn_timeout: Duration) -> (Arc<IMSessionMultiplexer>, Arc<Database>) {
    let database = Arc::new(db::connect_memory().await.expect("connect"));
    let message_repo = MessageRepo::new(Arc::clone(&database));
    let session_repo = SessionRepo::new(Arc::clone(&database));
    let runner = Arc::new(AgentRunner::new(message_repo, session_repo.clone()));
    let multiplexer = IMSessionMultiplexer::with_turn_timeout(runner, session_repo, turn_timeout);
    (multiplexer, database)
}

/// Build an inbound chat message addressed to the given conversation.
pub fn test_message(platform: &str, conversation_id: &str, content: &str) -> IMMessage {
    IMMessage {
        platform: platform.into(),
        conversation_id: conversation_id.into(),
        message_id: uuid::Uuid::new_v4().to_string(),
        sender_id: "U_TEST".into(),
        content: content.into(),
        attachments: Vec::new(),
        media_group_id: None,
        timestamp_ms: 0,
    }
}
