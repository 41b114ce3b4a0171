//! Stage tokens gating hand-offs between iteration stages.

use serde::{Deserialize, Serialize};

use crate::state::ephemeral_key;

/// Ephemeral key holding the current stage token.
pub const STAGE_TOKEN_KEY: &str = "temp:stage_token";

/// Ephemeral key holding the execution result of `artifact_id`.
pub fn result_key(artifact_id: &str) -> String {
    ephemeral_key(&format!("result:{}", artifact_id))
}

/// Stage a token was written by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Written by Generate, consumed by Dispatch
    Delegated,
    /// Written by Dispatch, consumed by Inject
    Executed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Delegated => write!(f, "delegated"),
            Stage::Executed => write!(f, "executed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToken {
    pub iteration: u32,
    pub artifact_id: String,
    pub stage: Stage,
}

impl StageToken {
    pub fn new(iteration: u32, artifact_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            iteration,
            artifact_id: artifact_id.into(),
            stage,
        }
    }

    /// A consumer acts only on a token written for its own iteration and artifact.
    pub fn matches(&self, iteration: u32, artifact_id: &str, stage: Stage) -> bool {
        self.iteration == iteration && self.artifact_id == artifact_id && self.stage == stage
    }
}

impl std::fmt::Display for StageToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.iteration, self.artifact_id, self.stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::is_ephemeral_key;

    #[test]
    fn test_keys_are_ephemeral() {
        assert!(is_ephemeral_key(STAGE_TOKEN_KEY));
        assert!(is_ephemeral_key(&result_key("art-1")));
        assert_eq!(result_key("art-1"), "temp:result:art-1");
    }

    #[test]
    fn test_token_matches_all_fields() {
        let token = StageToken::new(2, "B", Stage::Delegated);
        assert!(token.matches(2, "B", Stage::Delegated));
        assert!(!token.matches(1, "B", Stage::Delegated));
        assert!(!token.matches(2, "A", Stage::Delegated));
        assert!(!token.matches(2, "B", Stage::Executed));
    }

    #[test]
    fn test_token_serialization() {
        let token = StageToken::new(1, "A", Stage::Executed);
        let json = serde_json::to_value(&token).unwrap();
        assert_eq!(json["stage"], "executed");
        let back: StageToken = serde_json::from_value(json).unwrap();
        assert_eq!(back, token);
    }
}
