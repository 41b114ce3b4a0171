//! ID generation utilities for codeloop
//!
//! Provides functions for generating identifiers for artifacts, invocations and remote runs.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a unique artifact ID
///
/// Format: `art-{session}-{iteration}-{timestamp_ms}-{random_hex}`
/// Example: `art-s1-3-1738300800123-a1b2`
pub fn generate_artifact_id(session_id: &str, iteration: u32) -> String {
    let random: u16 = rand::rng().random();
    format!("art-{}-{}-{}-{:04x}", session_id, iteration, now_ms(), random)
}

/// Generate an invocation ID
///
/// One invocation is one process-level call into the orchestrator for a session.
/// Format: `inv-{timestamp_ms}-{random_hex}`
pub fn generate_invocation_id() -> String {
    let random: u16 = rand::rng().random();
    format!("inv-{}-{:04x}", now_ms(), random)
}

/// Generate a session ID
///
/// Format: `{timestamp_ms}-{random_hex}`
pub fn generate_session_id() -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{:04x}", now_ms(), random)
}
