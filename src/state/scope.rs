//! State scopes and the ephemeral key marker.

use serde::{Deserialize, Serialize};

/// Key prefix reserved for ephemeral state.
///
/// A key carrying this marker can never reach the durable tier, whatever
/// scope the caller asked for.
pub const EPHEMERAL_MARKER: &str = "temp:";

/// Which tier a state entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Survives across invocations and process restarts
    Durable,
    /// Lives for the current iteration only, never persisted
    Ephemeral,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Durable => write!(f, "durable"),
            Scope::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Returns true if the key name carries the ephemeral marker.
pub fn is_ephemeral_key(key: &str) -> bool {
    key.starts_with(EPHEMERAL_MARKER)
}

/// Build an ephemeral key name from a plain name.
pub fn ephemeral_key(name: &str) -> String {
    if is_ephemeral_key(name) {
        name.to_string()
    } else {
        format!("{}{}", EPHEMERAL_MARKER, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ephemeral_key() {
        assert!(is_ephemeral_key("temp:stage_token"));
        assert!(!is_ephemeral_key("session_summary"));
        assert!(!is_ephemeral_key("my_temp:thing"));
    }

    #[test]
    fn test_ephemeral_key_is_idempotent() {
        assert_eq!(ephemeral_key("stage_token"), "temp:stage_token");
        assert_eq!(ephemeral_key("temp:stage_token"), "temp:stage_token");
    }

    #[test]
    fn test_scope_serialization() {
        assert_eq!(serde_json::to_string(&Scope::Durable).unwrap(), "\"durable\"");
        assert_eq!(serde_json::to_string(&Scope::Ephemeral).unwrap(), "\"ephemeral\"");
        assert_eq!(Scope::Ephemeral.to_string(), "ephemeral");
    }
}
