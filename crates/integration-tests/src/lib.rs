//! Shared helpers of the Rewind integration tests.

/// Engine, logging and mock node helpers
pub mod test_utils;
