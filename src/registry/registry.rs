//! Durable artifact registry with per-session compare-and-swap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use super::artifact::{Artifact, ArtifactOutcome, ArtifactStatus, CodeRef};
use crate::error::{CodeloopError, Result};
use crate::id::now_ms;
use crate::storage::{ARTIFACTS_COLLECTION, Filter, Storage};

/// Registry of generated-code artifacts.
///
/// Rows are written to storage before any call returns. Writers for one
/// session are serialized by a per-session lock, and every mutation re-reads
/// the row under that lock before checking the transition.
pub struct ArtifactRegistry<S: Storage> {
    storage: Arc<S>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: Storage> std::fmt::Debug for ArtifactRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRegistry").finish_non_exhaustive()
    }
}

fn lock_err<E: std::fmt::Display>(e: E) -> CodeloopError {
    CodeloopError::Storage(format!("registry lock poisoned: {}", e))
}

impl<S: Storage> ArtifactRegistry<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock().map_err(lock_err)?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Drop the session's lock once nobody else holds it.
    ///
    /// Clones are only handed out under the map lock, so a count of one means
    /// no caller is waiting on it.
    fn release_lock(&self, session_id: &str) {
        if let Ok(mut locks) = self.locks.lock()
            && locks.get(session_id).is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(session_id);
        }
    }

    fn load(&self, artifact_id: &str) -> Result<Artifact> {
        self.storage
            .get(ARTIFACTS_COLLECTION, artifact_id)?
            .ok_or_else(|| CodeloopError::ArtifactNotFound(artifact_id.to_string()))
    }

    /// Register a new artifact in `created` status.
    ///
    /// Fails with `Conflict` while the session still has an open artifact.
    pub fn create(
        &self,
        session_id: &str,
        invocation_id: &str,
        iteration: u32,
        artifact_type: &str,
        code_ref: CodeRef,
    ) -> Result<Artifact> {
        let lock = self.session_lock(session_id)?;
        let _guard = lock.lock().map_err(lock_err)?;

        if let Some(open) = self.open_unlocked(session_id)? {
            return Err(CodeloopError::Conflict {
                session_id: session_id.to_string(),
                artifact_id: open.id,
            });
        }

        let artifact = Artifact::new(session_id, invocation_id, iteration, artifact_type, code_ref);
        self.storage.create(ARTIFACTS_COLLECTION, &artifact)?;
        info!(
            "Created artifact {} (session {}, iteration {})",
            artifact.id, session_id, iteration
        );
        Ok(artifact)
    }

    /// Move an open artifact to the immediately following status.
    pub fn advance(&self, artifact_id: &str, next_status: ArtifactStatus) -> Result<Artifact> {
        self.mutate(artifact_id, |artifact| {
            if artifact.status.next() != Some(next_status) {
                return Err(CodeloopError::InvalidTransition {
                    artifact_id: artifact.id.clone(),
                    from: artifact.status,
                    to: next_status,
                });
            }
            artifact.set_status(next_status);
            Ok(())
        })
    }

    /// Record where the captured output of an execution lives.
    pub fn attach_result(&self, artifact_id: &str, stdout_ref: &str, stderr_ref: &str) -> Result<Artifact> {
        self.mutate(artifact_id, |artifact| {
            if !matches!(artifact.status, ArtifactStatus::Executing | ArtifactStatus::Executed) {
                return Err(CodeloopError::InvalidTransition {
                    artifact_id: artifact.id.clone(),
                    from: artifact.status,
                    to: artifact.status,
                });
            }
            artifact.stdout_ref = Some(stdout_ref.to_string());
            artifact.stderr_ref = Some(stderr_ref.to_string());
            artifact.updated_at = now_ms();
            Ok(())
        })
    }

    /// Close an artifact. After this it is immutable.
    ///
    /// `Consumed` requires `executed`; `Failed` may close any open artifact.
    pub fn finalize(
        &self,
        artifact_id: &str,
        outcome: ArtifactOutcome,
        result_ref: Option<String>,
    ) -> Result<Artifact> {
        let artifact = self.mutate(artifact_id, |artifact| {
            let to = outcome.status();
            if !artifact.status.precedes(to) {
                return Err(CodeloopError::InvalidTransition {
                    artifact_id: artifact.id.clone(),
                    from: artifact.status,
                    to,
                });
            }
            artifact.set_status(to);
            if result_ref.is_some() {
                artifact.result_ref = result_ref.clone();
            }
            match &outcome {
                ArtifactOutcome::Consumed => artifact.consumed_at = Some(artifact.updated_at),
                ArtifactOutcome::Failed(reason) => artifact.failure_reason = Some(reason.clone()),
            }
            Ok(())
        })?;

        match &artifact.failure_reason {
            Some(reason) => warn!("Artifact {} failed: {}", artifact.id, reason),
            None => info!("Artifact {} consumed", artifact.id),
        }
        self.release_lock(&artifact.session_id);
        Ok(artifact)
    }

    /// The session's open artifact, if any.
    pub fn get_open(&self, session_id: &str) -> Result<Option<Artifact>> {
        let open = {
            let lock = self.session_lock(session_id)?;
            let _guard = lock.lock().map_err(lock_err)?;
            self.open_unlocked(session_id)?
        };
        if open.is_none() {
            self.release_lock(session_id);
        }
        Ok(open)
    }

    pub fn get(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        self.storage.get(ARTIFACTS_COLLECTION, artifact_id)
    }

    /// All artifacts of a session, ordered by iteration.
    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<Artifact>> {
        let mut artifacts: Vec<Artifact> = self
            .storage
            .query(ARTIFACTS_COLLECTION, &[Filter::eq("session_id", session_id)])?;
        artifacts.sort_by_key(|a| (a.iteration, a.created_at));
        Ok(artifacts)
    }

    /// Statuses the artifact went through, oldest first.
    pub fn history(&self, artifact_id: &str) -> Result<Vec<ArtifactStatus>> {
        Ok(self.load(artifact_id)?.history)
    }

    fn open_unlocked(&self, session_id: &str) -> Result<Option<Artifact>> {
        let mut open: Vec<Artifact> = self.storage.query(
            ARTIFACTS_COLLECTION,
            &[
                Filter::eq("session_id", session_id),
                Filter::one_of("status", &ArtifactStatus::OPEN),
            ],
        )?;
        if open.len() > 1 {
            return Err(CodeloopError::Storage(format!(
                "session {} has {} open artifacts",
                session_id,
                open.len()
            )));
        }
        Ok(open.pop())
    }

    /// Read-check-write under the session lock.
    fn mutate(&self, artifact_id: &str, f: impl FnOnce(&mut Artifact) -> Result<()>) -> Result<Artifact> {
        let session_id = self.load(artifact_id)?.session_id;
        let lock = self.session_lock(&session_id)?;
        let _guard = lock.lock().map_err(lock_err)?;

        let mut artifact = self.load(artifact_id)?;
        if artifact.status.is_terminal() {
            return Err(CodeloopError::Immutable(artifact.id));
        }
        let from = artifact.status;
        f(&mut artifact)?;
        self.storage.update(ARTIFACTS_COLLECTION, &artifact)?;
        debug!("Artifact {}: {} -> {}", artifact.id, from, artifact.status);
        Ok(artifact)
    }
}
