//! Execution backends.
//!
//! Every backend runs a code reference under a hard deadline and returns a
//! normalized [`ExecutionResult`]. Execution failures are data in the result,
//! never errors, so callers do not branch on which backend ran the code.

mod cancel;
mod http;
mod local;
mod orphan;
mod remote;
mod result;

use std::time::Duration;

use async_trait::async_trait;

use crate::registry::CodeRef;

pub use cancel::{CancelHandle, Cancellation, cancellation};
pub use http::{HttpJobClient, HttpJobConfig};
pub use local::{LocalBackend, LocalConfig};
pub use orphan::{OrphanTracker, OrphanedRun, ReconcileReport};
pub use remote::{OrphanSink, PollPolicy, RemoteBackend, RemoteJobClient, RemotePayload, RunReport, RunStatus};
pub use result::{ExecutionResult, FailureKind, StoredResult, truncate_string};

/// A place code can run
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name for logs (`local`, `remote`)
    fn name(&self) -> &str;

    /// Run `code` and wait for its result, for at most `timeout`.
    async fn submit_and_wait(&self, code: &CodeRef, timeout: Duration, cancel: &Cancellation) -> ExecutionResult;
}

/// Which backend to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}
