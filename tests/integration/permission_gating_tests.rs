//! Integration test for delete-shaped tool-use gating end to end (§4.1
//! scenario "delete-command gating"): a `Bash` tool call shaped like
//! `rm -rf build/` must surface a chat confirmation prompt carrying the
//! actual command, and a "deny" reply must deny the tool while letting
//! the turn finish.

use std::time::Duration;

use serial_test::serial;
use tempfile::tempdir;

use im_cowork_gateway::models::im_message::IMMessage;
use im_cowork_gateway::multiplexer::{IMSessionMultiplexer, MultiplexError};

use super::test_helpers::{build_multiplexer, configure_env, test_message};

/// Retry `process_message` until the pending confirmation has actually
/// been registered (the first few attempts race the child process and
/// fail with "already has a turn in flight"; that is expected and not
/// the condition under test here).
async fn send_until_settled(
    multiplexer: &IMSessionMultiplexer,
    build_message: impl Fn() -> IMMessage,
) -> Result<String, MultiplexError> {
    for _ in 0..100 {
        match multiplexer.process_message(build_message()).await {
            Ok(reply) => return Ok(reply),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    multiplexer.process_message(build_message()).await
}

#[tokio::test]
#[serial]
async fn denying_a_delete_shaped_command_denies_the_tool_and_the_turn_still_completes() {
    let workspace = tempdir().expect("tempdir");
    configure_env(workspace.path(), "ask_bash_rm.sh");
    let (multiplexer, _db) = build_multiplexer(Duration::from_secs(10)).await;

    let first_call = {
        let multiplexer = multiplexer.clone();
        tokio::spawn(async move {
            multiplexer
                .process_message(test_message("telegram", "chat-rm", "please clean the build dir"))
                .await
        })
    };

    let deny_reply = tokio::time::timeout(
        Duration::from_secs(5),
        send_until_settled(&multiplexer, || test_message("telegram", "chat-rm", "no")),
    )
    .await
    .expect("deny reply arrives before the test timeout")
    .expect("deny reply succeeds");
    assert_eq!(deny_reply, "Request denied.");

    let outcome = tokio::time::timeout(Duration::from_secs(5), first_call)
        .await
        .expect("first turn resolves before the test timeout")
        .expect("task did not panic")
        .expect("turn completes even though the tool was denied");
    assert_eq!(outcome, "Turn finished after the permission decision.");
}
