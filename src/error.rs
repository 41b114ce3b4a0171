//! Error types for codeloop
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::registry::ArtifactStatus;

/// All error types that can occur in codeloop
#[derive(Debug, Error)]
pub enum CodeloopError {
    /// A second open artifact was requested for a session
    #[error("Conflict: session {session_id} already has open artifact {artifact_id}")]
    Conflict { session_id: String, artifact_id: String },

    /// Status skip or reversal
    #[error("Invalid transition for artifact {artifact_id}: {from} -> {to}")]
    InvalidTransition {
        artifact_id: String,
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    /// Artifact not found in the registry
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Write attempted on a consumed or failed artifact
    #[error("Artifact is immutable: {0}")]
    Immutable(String),

    /// An ephemeral key reached the durable tier
    #[error("Ephemeral key in durable delta: {0}")]
    EphemeralLeak(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Execution backend error (not an execution failure, which is data)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Code generator or analyzer failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for codeloop operations
pub type Result<T> = std::result::Result<T, CodeloopError>;
