//! Artifact records and their lifecycle.
//!
//! An artifact is one unit of generated code plus its execution outcome. Its
//! status only ever moves forward:
//!
//! ```text
//! created -> delegated -> executing -> executed -> consumed
//!                                        \-------> failed
//! ```
//!
//! `failed` may also close an artifact that never reached `executed` (the
//! iteration died before analysis). Terminal artifacts are immutable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::{generate_artifact_id, now_ms};
use crate::storage::HasId;

/// Lifecycle status of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    /// Code generated, registered
    Created,
    /// Handed to the dispatch stage
    Delegated,
    /// Running on the execution backend
    Executing,
    /// Execution finished, result available
    Executed,
    /// Result analyzed
    Consumed,
    /// Closed without a usable analysis
    Failed,
}

impl ArtifactStatus {
    /// Statuses that count as "open" for the single-open-artifact rule.
    pub const OPEN: [ArtifactStatus; 4] = [
        ArtifactStatus::Created,
        ArtifactStatus::Delegated,
        ArtifactStatus::Executing,
        ArtifactStatus::Executed,
    ];

    /// Returns true for consumed and failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Consumed | ArtifactStatus::Failed)
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// The status reachable through `advance` from this one.
    pub fn next(&self) -> Option<ArtifactStatus> {
        match self {
            ArtifactStatus::Created => Some(ArtifactStatus::Delegated),
            ArtifactStatus::Delegated => Some(ArtifactStatus::Executing),
            ArtifactStatus::Executing => Some(ArtifactStatus::Executed),
            ArtifactStatus::Executed | ArtifactStatus::Consumed | ArtifactStatus::Failed => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ArtifactStatus::Created => 0,
            ArtifactStatus::Delegated => 1,
            ArtifactStatus::Executing => 2,
            ArtifactStatus::Executed => 3,
            ArtifactStatus::Consumed | ArtifactStatus::Failed => 4,
        }
    }

    /// Whether `to` can follow `self` in a recorded history.
    pub fn precedes(&self, to: ArtifactStatus) -> bool {
        match to {
            ArtifactStatus::Consumed => *self == ArtifactStatus::Executed,
            ArtifactStatus::Failed => self.is_open(),
            _ => self.next() == Some(to),
        }
    }

    /// Check that a sequence of observed statuses never skips or reverses.
    pub fn is_monotonic(history: &[ArtifactStatus]) -> bool {
        history.windows(2).all(|w| w[0].rank() < w[1].rank() && w[0].precedes(w[1]))
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactStatus::Created => "created",
            ArtifactStatus::Delegated => "delegated",
            ArtifactStatus::Executing => "executing",
            ArtifactStatus::Executed => "executed",
            ArtifactStatus::Consumed => "consumed",
            ArtifactStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Terminal outcome requested through `finalize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOutcome {
    Consumed,
    Failed(String),
}

impl ArtifactOutcome {
    pub fn status(&self) -> ArtifactStatus {
        match self {
            ArtifactOutcome::Consumed => ArtifactStatus::Consumed,
            ArtifactOutcome::Failed(_) => ArtifactStatus::Failed,
        }
    }
}

/// Where the generated code lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CodeRef {
    /// Source text carried inline
    Inline { source: String },
    /// Script file on disk
    Path { path: PathBuf },
}

impl CodeRef {
    pub fn inline(source: impl Into<String>) -> Self {
        CodeRef::Inline { source: source.into() }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        CodeRef::Path { path: path.into() }
    }

    /// SHA-256 of the inline source or of the path string.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            CodeRef::Inline { source } => hasher.update(source.as_bytes()),
            CodeRef::Path { path } => hasher.update(path.to_string_lossy().as_bytes()),
        }
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for CodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeRef::Inline { source } => write!(f, "inline:{}b", source.len()),
            CodeRef::Path { path } => write!(f, "path:{}", path.display()),
        }
    }
}

/// Durable registry row for one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    //=== Identity ===
    /// Unique artifact identifier
    pub id: String,
    pub session_id: String,
    /// Invocation that created the artifact
    pub invocation_id: String,
    pub iteration: u32,
    pub artifact_type: String,

    //=== Lifecycle ===
    pub status: ArtifactStatus,
    /// Every status the artifact has held, oldest first
    pub history: Vec<ArtifactStatus>,
    pub failure_reason: Option<String>,

    //=== Code and results ===
    pub code_ref: CodeRef,
    pub code_sha256: String,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,
    pub result_ref: Option<String>,
    pub metadata: serde_json::Value,

    //=== Timestamps ===
    pub created_at: i64,
    pub updated_at: i64,
    pub consumed_at: Option<i64>,
}

impl HasId for Artifact {
    fn id(&self) -> &str {
        &self.id
    }
}

impl Artifact {
    /// A fresh artifact in `created` status
    pub fn new(
        session_id: &str,
        invocation_id: &str,
        iteration: u32,
        artifact_type: &str,
        code_ref: CodeRef,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_artifact_id(session_id, iteration),
            session_id: session_id.to_string(),
            invocation_id: invocation_id.to_string(),
            iteration,
            artifact_type: artifact_type.to_string(),
            status: ArtifactStatus::Created,
            history: vec![ArtifactStatus::Created],
            failure_reason: None,
            code_sha256: code_ref.digest(),
            code_ref,
            stdout_ref: None,
            stderr_ref: None,
            result_ref: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            consumed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub(crate) fn set_status(&mut self, status: ArtifactStatus) {
        self.status = status;
        self.history.push(status);
        self.updated_at = now_ms();
    }
}
