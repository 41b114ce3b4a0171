//! Tracking of remote runs the poller gave up on.
//!
//! A run abandoned at its deadline keeps executing remotely. It is recorded
//! here and later reconciled: each unresolved run is polled once, and runs
//! that reached a terminal status are marked resolved. Artifacts are never
//! touched by reconciliation.

use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::remote::{OrphanSink, RemoteJobClient, RunStatus};
use crate::error::Result;
use crate::id::now_ms;
use crate::storage::{Filter, HasId, ORPHANED_RUNS_COLLECTION, Storage};

/// A remote run nobody is waiting for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanedRun {
    /// Remote run id
    pub id: String,
    /// Why polling stopped (`timeout`, `cancelled`, `poll_errors`)
    pub reason: String,
    pub recorded_at: i64,
    pub resolved_at: Option<i64>,
    pub final_status: Option<RunStatus>,
}

impl HasId for OrphanedRun {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub resolved: Vec<(String, RunStatus)>,
    pub still_running: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// Durable list of orphaned runs
pub struct OrphanTracker<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> OrphanTracker<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub fn unresolved(&self) -> Result<Vec<OrphanedRun>> {
        let mut runs: Vec<OrphanedRun> = self
            .storage
            .query(ORPHANED_RUNS_COLLECTION, &[Filter::eq("resolved_at", serde_json::Value::Null)])?;
        runs.sort_by_key(|r| r.recorded_at);
        Ok(runs)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<OrphanedRun>> {
        self.storage.get(ORPHANED_RUNS_COLLECTION, run_id)
    }

    /// Poll every unresolved run once.
    pub async fn reconcile<C: RemoteJobClient + ?Sized>(&self, client: &C) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for mut run in self.unresolved()? {
            report.checked += 1;
            match client.poll(&run.id).await {
                Ok(status) if status.status.is_terminal() => {
                    run.resolved_at = Some(now_ms());
                    run.final_status = Some(status.status);
                    self.storage.update(ORPHANED_RUNS_COLLECTION, &run)?;
                    info!("Orphaned run {} resolved as {}", run.id, status.status);
                    report.resolved.push((run.id, status.status));
                }
                Ok(_) => report.still_running.push(run.id),
                Err(e) => {
                    warn!("Failed to poll orphaned run {}: {}", run.id, e);
                    report.errors.push((run.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

impl<S: Storage> OrphanSink for OrphanTracker<S> {
    fn record(&self, run_id: &str, reason: &str) -> Result<()> {
        let run = OrphanedRun {
            id: run_id.to_string(),
            reason: reason.to_string(),
            recorded_at: now_ms(),
            resolved_at: None,
            final_status: None,
        };
        self.storage.upsert(ORPHANED_RUNS_COLLECTION, &run)?;
        info!("Recorded orphaned run {} ({})", run_id, reason);
        Ok(())
    }
}
