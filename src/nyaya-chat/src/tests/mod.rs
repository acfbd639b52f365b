//! Session-level tests for nyaya-chat.

mod http_session_tests;
pub(crate) mod support;
