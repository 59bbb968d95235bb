//! Integration test for the accumulator supersession invariant (§3, §4.1
//! scenario "supersession"): installing a second accumulator for a
//! session always resolves the session's previous in-flight turn with
//! `Replaced`, regardless of which concurrent caller gets there first.

use std::time::Duration;

use serial_test::serial;
use tempfile::tempdir;

use im_cowork_gateway::multiplexer::MultiplexError;

use super::test_helpers::{build_multiplexer, configure_env, test_message};

#[tokio::test]
#[serial]
async fn two_concurrent_turns_on_the_same_session_leave_exactly_one_replaced() {
    let workspace = tempdir().expect("tempdir");
    configure_env(workspace.path(), "reply_once.sh");
    let (multiplexer, _db) = build_multiplexer(Duration::from_millis(300)).await;

    // Establish the conversation's mapping and session first, so the
    // concurrent calls below race on an existing session rather than on
    // session creation itself.
    multiplexer
        .process_message(test_message("telegram", "chat-race", "bootstrap"))
        .await
        .expect("bootstrap turn completes");

    // Swap in a host CLI that blocks forever (never answers a tool-use
    // permission), so whichever call is NOT superseded simply rides out
    // the turn timeout instead of racing a real completion.
    configure_env(workspace.path(), "ask_bash_rm.sh");

    let first = {
        let multiplexer = multiplexer.clone();
        tokio::spawn(async move {
            multiplexer
                .process_message(test_message("telegram", "chat-race", "one"))
                .await
        })
    };
    let second = {
        let multiplexer = multiplexer.clone();
        tokio::spawn(async move {
            multiplexer
                .process_message(test_message("telegram", "chat-race", "two"))
                .await
        })
    };

    let (first_result, second_result) = tokio::time::timeout(Duration::from_secs(5), async {
        (first.await.expect("task did not panic"), second.await.expect("task did not panic"))
    })
    .await
    .expect("both calls settle before the test timeout");

    let replaced_count = [&first_result, &second_result]
        .into_iter()
        .filter(|result| matches!(result, Err(MultiplexError::Replaced)))
        .count();
    assert_eq!(replaced_count, 1, "exactly one concurrent turn must be superseded");
}
