//! Remote execution backend - submit a job, then poll it to completion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cancel::Cancellation;
use super::result::{ExecutionResult, FailureKind};
use super::ExecutionBackend;
use crate::error::Result;
use crate::registry::CodeRef;

/// Status reported by the remote job service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    InfraError,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::InfraError)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::InfraError => "infra_error",
        };
        write!(f, "{}", s)
    }
}

/// One poll response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    #[serde(default)]
    pub result_ref: Option<String>,
}

impl RunReport {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            result_ref: None,
        }
    }

    pub fn with_result(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }
}

/// Result payload published by a finished remote run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotePayload {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub run_url: Option<String>,
}

/// Client for a remote job service
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Submit code, returning the remote run id
    async fn submit(&self, code: &CodeRef) -> Result<String>;

    async fn poll(&self, run_id: &str) -> Result<RunReport>;

    async fn fetch_result(&self, result_ref: &str) -> Result<RemotePayload>;
}

/// Receives runs the backend stopped waiting for
pub trait OrphanSink: Send + Sync {
    fn record(&self, run_id: &str, reason: &str) -> Result<()>;
}

/// Bounded exponential backoff between polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
    /// Consecutive poll errors tolerated before giving up with `infra_error`
    pub max_poll_errors: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 10_000,
            multiplier: 2,
            max_poll_errors: 3,
        }
    }
}

impl PollPolicy {
    /// Delay before poll number `attempt` (0-based), capped at `max_ms`.
    ///
    /// `initial_ms` is floored at 1ms so a zero never disables backoff, and the
    /// cap never falls below the first delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_ms.max(1);
        let cap = self.max_ms.max(initial);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(attempt.min(32));
        Duration::from_millis(initial.saturating_mul(factor).min(cap))
    }
}

enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

impl<T> Bounded<T> {
    fn reason(&self) -> &'static str {
        match self {
            Bounded::Cancelled => "cancelled",
            _ => "timeout",
        }
    }
}

/// Race `fut` against the deadline and the cancellation.
async fn bounded<F: Future>(fut: F, deadline: Instant, cancel: &Cancellation) -> Bounded<F::Output> {
    tokio::select! {
        out = fut => Bounded::Done(out),
        _ = tokio::time::sleep_until(deadline) => Bounded::TimedOut,
        _ = cancel.cancelled() => Bounded::Cancelled,
    }
}

/// Backend that runs code as a separately scheduled remote job.
///
/// Polling stops at the deadline or on cancellation. The remote job is left
/// running and its run id is handed to the orphan sink.
pub struct RemoteBackend<C: RemoteJobClient> {
    client: C,
    policy: PollPolicy,
    orphans: Option<Arc<dyn OrphanSink>>,
}

impl<C: RemoteJobClient> RemoteBackend<C> {
    pub fn new(client: C, policy: PollPolicy) -> Self {
        Self {
            client,
            policy,
            orphans: None,
        }
    }

    pub fn with_orphan_sink(mut self, sink: Arc<dyn OrphanSink>) -> Self {
        self.orphans = Some(sink);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn orphan(&self, run_id: &str, reason: &str) {
        warn!(run_id, reason, "abandoning remote run");
        if let Some(sink) = &self.orphans
            && let Err(e) = sink.record(run_id, reason)
        {
            warn!(run_id, error = %e, "failed to record orphaned run");
        }
    }

    /// Turn a terminal report into a result.
    async fn finish(
        &self,
        run_id: &str,
        report: RunReport,
        started: Instant,
        deadline: Instant,
        cancel: &Cancellation,
    ) -> ExecutionResult {
        let payload = match &report.result_ref {
            Some(result_ref) => match bounded(self.client.fetch_result(result_ref), deadline, cancel).await {
                Bounded::Done(Ok(payload)) => Some(payload),
                Bounded::Done(Err(e)) => {
                    warn!(run_id, result_ref = %result_ref, error = %e, "failed to fetch remote result");
                    if report.status == RunStatus::Succeeded {
                        return ExecutionResult::infra_error(format!("result fetch failed: {}", e), started.elapsed())
                            .with_run(run_id, None);
                    }
                    None
                }
                other => {
                    self.orphan(run_id, other.reason());
                    return ExecutionResult::timed_out(String::new(), String::new(), started.elapsed())
                        .with_run(run_id, None);
                }
            },
            None => None,
        };

        let elapsed = started.elapsed();
        let payload = payload.unwrap_or_default();
        let kind = match report.status {
            RunStatus::Succeeded if payload.success || payload.exit_code == Some(0) => FailureKind::None,
            // No payload published: trust the run status
            RunStatus::Succeeded if report.result_ref.is_none() => FailureKind::None,
            RunStatus::InfraError => FailureKind::InfraError,
            _ => FailureKind::RuntimeError,
        };
        ExecutionResult {
            stdout: payload.stdout,
            stderr: payload.stderr,
            exit_status: payload.exit_code,
            success: kind == FailureKind::None,
            duration_ms: elapsed.as_millis() as u64,
            failure_kind: kind,
            ..Default::default()
        }
        .with_run(run_id, payload.run_url)
    }
}

#[async_trait]
impl<C: RemoteJobClient> ExecutionBackend for RemoteBackend<C> {
    fn name(&self) -> &str {
        "remote"
    }

    async fn submit_and_wait(&self, code: &CodeRef, timeout: Duration, cancel: &Cancellation) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + timeout;

        if cancel.is_cancelled() {
            debug!(code = %code, "cancelled before submit");
            return ExecutionResult::timed_out(String::new(), String::new(), started.elapsed());
        }

        let run_id = match bounded(self.client.submit(code), deadline, cancel).await {
            Bounded::Done(Ok(run_id)) => run_id,
            Bounded::Done(Err(e)) => {
                warn!(code = %code, error = %e, "remote submit failed");
                return ExecutionResult::infra_error(format!("submit failed: {}", e), started.elapsed());
            }
            _ => {
                warn!(code = %code, "remote submit did not complete before deadline");
                return ExecutionResult::timed_out(String::new(), String::new(), started.elapsed());
            }
        };
        info!(run_id = %run_id, code = %code, "submitted remote run");

        let mut attempt = 0u32;
        let mut poll_errors = 0u32;
        loop {
            match bounded(self.client.poll(&run_id), deadline, cancel).await {
                Bounded::Done(Ok(report)) => {
                    poll_errors = 0;
                    debug!(run_id = %run_id, status = %report.status, attempt, "polled remote run");
                    if report.status.is_terminal() {
                        let result = self.finish(&run_id, report, started, deadline, cancel).await;
                        info!(run_id = %run_id, failure_kind = %result.failure_kind, "remote run finished");
                        return result;
                    }
                }
                Bounded::Done(Err(e)) => {
                    poll_errors += 1;
                    warn!(run_id = %run_id, error = %e, poll_errors, "remote poll failed");
                    if poll_errors > self.policy.max_poll_errors {
                        self.orphan(&run_id, "poll_errors");
                        return ExecutionResult::infra_error(format!("poll failed: {}", e), started.elapsed())
                            .with_run(run_id, None);
                    }
                }
                stopped => {
                    self.orphan(&run_id, stopped.reason());
                    return ExecutionResult::timed_out(String::new(), String::new(), started.elapsed())
                        .with_run(run_id, None);
                }
            }

            let wake = (Instant::now() + self.policy.delay(attempt)).min(deadline);
            attempt += 1;
            let slept = bounded(tokio::time::sleep_until(wake), deadline, cancel).await;
            if matches!(slept, Bounded::Cancelled) || Instant::now() >= deadline {
                self.orphan(&run_id, slept.reason());
                return ExecutionResult::timed_out(String::new(), String::new(), started.elapsed())
                    .with_run(run_id, None);
            }
        }
    }
}
