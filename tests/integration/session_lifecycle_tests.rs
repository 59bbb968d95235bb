//! Integration tests for session creation, reuse, and staleness recovery
//! (§4.1 scenarios "first message creates a session" and "staleness
//! recovery").

use std::time::Duration;

use serial_test::serial;
use tempfile::tempdir;

use im_cowork_gateway::models::session::{ConversationKey, SessionMapping};
use im_cowork_gateway::persistence::session_repo::SessionRepo;

use super::test_helpers::{build_multiplexer, configure_env, test_message};

#[tokio::test]
#[serial]
async fn first_message_creates_a_session_and_mapping() {
    let workspace = tempdir().expect("tempdir");
    configure_env(workspace.path(), "reply_once.sh");
    let (multiplexer, db) = build_multiplexer(Duration::from_secs(5)).await;

    let reply = multiplexer
        .process_message(test_message("telegram", "chat-1", "hello"))
        .await
        .expect("turn completes");
    assert_eq!(reply, "Hello from the agent.");

    let session_repo = SessionRepo::new(db);
    let key = ConversationKey::new("telegram", "chat-1");
    let mapping = session_repo
        .get_mapping(&key)
        .await
        .expect("query")
        .expect("mapping created on first message");

    session_repo
        .get_session(&mapping.agent_session_id)
        .await
        .expect("query")
        .expect("session persisted");
}

#[tokio::test]
#[serial]
async fn second_message_on_the_same_conversation_reuses_the_session() {
    let workspace = tempdir().expect("tempdir");
    configure_env(workspace.path(), "reply_once.sh");
    let (multiplexer, db) = build_multiplexer(Duration::from_secs(5)).await;

    multiplexer
        .process_message(test_message("telegram", "chat-2", "first"))
        .await
        .expect("first turn completes");

    let session_repo = SessionRepo::new(db);
    let key = ConversationKey::new("telegram", "chat-2");
    let first_session_id = session_repo
        .get_mapping(&key)
        .await
        .expect("query")
        .expect("mapping present after first message")
        .agent_session_id;

    multiplexer
        .process_message(test_message("telegram", "chat-2", "second"))
        .await
        .expect("second turn completes");

    let second_session_id = session_repo
        .get_mapping(&key)
        .await
        .expect("query")
        .expect("mapping present after second message")
        .agent_session_id;

    assert_eq!(first_session_id, second_session_id, "same conversation must reuse its session");
}

#[tokio::test]
#[serial]
async fn a_mapping_pointing_at_a_deleted_session_is_recreated_transparently() {
    let workspace = tempdir().expect("tempdir");
    configure_env(workspace.path(), "reply_once.sh");
    let (multiplexer, db) = build_multiplexer(Duration::from_secs(5)).await;

    let session_repo = SessionRepo::new(db.clone());
    let key = ConversationKey::new("telegram", "chat-stale");
    let mapping = SessionMapping::new(&key, "does-not-exist".into());
    session_repo.upsert_mapping(&mapping).await.expect("seed dangling mapping");

    let reply = multiplexer
        .process_message(test_message("telegram", "chat-stale", "hello"))
        .await
        .expect("turn completes despite the dangling mapping");
    assert_eq!(reply, "Hello from the agent.");

    let refreshed = session_repo.get_mapping(&key).await.expect("query").expect("mapping present");
    assert_ne!(refreshed.agent_session_id, "does-not-exist", "a fresh session must replace the dangling one");
}
