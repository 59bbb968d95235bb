#![allow(clippy::expect_used, clippy::unwrap_used, missing_docs)]

mod integration {
    mod test_helpers;

    mod permission_gating_tests;
    mod session_lifecycle_tests;
    mod supersession_tests;
}
