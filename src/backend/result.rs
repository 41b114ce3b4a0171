//! Normalized execution results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::HasId;

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Execution succeeded
    #[default]
    None,
    /// The code ran and failed (non-zero exit, exception)
    RuntimeError,
    /// Deadline reached or polling cancelled
    Timeout,
    /// The backend itself failed (spawn error, remote infrastructure)
    InfraError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::None => "none",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::Timeout => "timeout",
            FailureKind::InfraError => "infra_error",
        };
        write!(f, "{}", s)
    }
}

/// Uniform result returned by every execution backend
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, if one was observed
    pub exit_status: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
    /// Output was cut to the backend's byte limit
    pub truncated: bool,
    pub failure_kind: FailureKind,
    /// Remote run identifier
    pub run_id: Option<String>,
    /// Link to the remote run, when the backend provides one
    pub run_url: Option<String>,
}

impl ExecutionResult {
    /// A run that reached an exit status.
    pub fn completed(stdout: String, stderr: String, exit_status: Option<i32>, duration: Duration) -> Self {
        let success = exit_status == Some(0);
        Self {
            stdout,
            stderr,
            exit_status,
            success,
            duration_ms: duration.as_millis() as u64,
            failure_kind: if success {
                FailureKind::None
            } else {
                FailureKind::RuntimeError
            },
            ..Default::default()
        }
    }

    /// A run stopped at its deadline (or whose polling was cancelled).
    pub fn timed_out(stdout: String, stderr: String, duration: Duration) -> Self {
        Self {
            stdout,
            stderr,
            duration_ms: duration.as_millis() as u64,
            failure_kind: FailureKind::Timeout,
            ..Default::default()
        }
    }

    /// The backend could not run the code at all.
    pub fn infra_error(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            stderr: message.into(),
            duration_ms: duration.as_millis() as u64,
            failure_kind: FailureKind::InfraError,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>, run_url: Option<String>) -> Self {
        self.run_id = Some(run_id.into());
        self.run_url = run_url;
        self
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Short human-readable summary, safe to keep in durable state.
    pub fn summary(&self) -> String {
        let mut line = match self.failure_kind {
            FailureKind::None => format!("succeeded in {}ms", self.duration_ms),
            FailureKind::RuntimeError => format!(
                "runtime_error (exit {}) after {}ms",
                self.exit_status.map(|c| c.to_string()).unwrap_or_else(|| "?".to_string()),
                self.duration_ms
            ),
            FailureKind::Timeout => format!("timeout after {}ms", self.duration_ms),
            FailureKind::InfraError => format!("infra_error: {}", truncate_string(self.stderr.trim(), 200)),
        };
        if self.truncated {
            line.push_str(" [output truncated]");
        }
        line
    }
}

/// Persisted copy of a result, addressed by `result_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    /// Artifact the result belongs to
    pub id: String,
    pub session_id: String,
    pub result: ExecutionResult,
    pub recorded_at: i64,
}

impl HasId for StoredResult {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Truncate a string to at most `max` bytes on a char boundary.
pub fn truncate_string(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
