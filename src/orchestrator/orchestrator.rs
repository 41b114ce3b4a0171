//! Loop orchestrator - runs the stage-gated iteration state machine.
//!
//! Each iteration runs Generate, Dispatch, Inject, Analyze and Prune. Hand-offs
//! between stages go through a stage token in ephemeral state; a stage whose
//! token does not name its own iteration and artifact does nothing. Prune
//! runs on every path out of an iteration, so the session's artifact is always
//! closed and ephemeral state never outlives its iteration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::collaborators::{AnalysisDecision, Analyzer, CodeGenerator, GenerationContext};
use super::stage::{STAGE_TOKEN_KEY, Stage, StageToken, result_key};
use super::termination::{Decision, TerminalReason, TerminationController};
use crate::backend::{Cancellation, ExecutionBackend, ExecutionResult, FailureKind, StoredResult};
use crate::error::{CodeloopError, Result};
use crate::id::{generate_invocation_id, now_ms};
use crate::registry::{Artifact, ArtifactOutcome, ArtifactRegistry, ArtifactStatus};
use crate::state::{Scope, StateStore};
use crate::storage::{RESULTS_COLLECTION, Storage};

/// Durable key: summary written by the last analysis.
pub const SUMMARY_KEY: &str = "session_summary";
/// Durable key: one-line summary of the most recent execution.
pub const LAST_RESULT_KEY: &str = "last_result";
/// Durable key: number of the last iteration run.
pub const ITERATION_KEY: &str = "iteration";

pub const ITERATION_CAP_EXHAUSTED: &str = "iteration_cap_exhausted";
pub const STALE_STAGE_TOKEN: &str = "stale_stage_token";
pub const ABANDONED_BY_PREVIOUS_INVOCATION: &str = "abandoned_by_previous_invocation";
/// Fatal reason recorded once the orchestrator's cancellation has fired.
pub const CANCELLED: &str = "cancelled";

/// Where an artifact's persisted result lives.
pub fn result_ref(artifact_id: &str) -> String {
    format!("{}/{}", RESULTS_COLLECTION, artifact_id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_iterations: u32,
    /// Stale tokens tolerated before the session is stopped (0 = never)
    pub stale_token_limit: u32,
    pub artifact_type: String,
    pub execution_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stale_token_limit: 3,
            artifact_type: "analysis_code".to_string(),
            execution_timeout: Duration::from_secs(60),
        }
    }
}

/// What happened in one iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationOutcome {
    pub session_id: String,
    pub invocation_id: String,
    pub iteration: u32,
    pub artifact_id: Option<String>,
    pub artifact_status: Option<ArtifactStatus>,
    pub failure_kind: Option<FailureKind>,
    /// Summary of the execution result
    pub result_summary: Option<String>,
    /// Summary returned by the analyzer
    pub summary: Option<String>,
    /// Stage that found a stale token, if any
    pub inconsistency: Option<String>,
    pub decision: Decision,
}

impl IterationOutcome {
    fn new(session_id: &str, invocation_id: &str, iteration: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            invocation_id: invocation_id.to_string(),
            iteration,
            artifact_id: None,
            artifact_status: None,
            failure_kind: None,
            result_summary: None,
            summary: None,
            inconsistency: None,
            decision: Decision::Continue,
        }
    }

    pub fn terminal_reason(&self) -> Option<&TerminalReason> {
        match &self.decision {
            Decision::Stop(reason) => Some(reason),
            Decision::Continue => None,
        }
    }
}

/// Result of running a session to a stop
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    pub iterations: Vec<IterationOutcome>,
    pub reason: TerminalReason,
    pub summary: Option<String>,
}

pub(crate) struct Session<S: Storage> {
    pub(crate) state: StateStore<S>,
    pub(crate) controller: TerminationController,
}

/// Drives generate/execute/analyze iterations for any number of sessions.
///
/// Iterations of one session are serialized by a per-session async lock;
/// different sessions run concurrently.
pub struct LoopOrchestrator<S: Storage, G: CodeGenerator, A: Analyzer> {
    storage: Arc<S>,
    registry: Arc<ArtifactRegistry<S>>,
    backend: Arc<dyn ExecutionBackend>,
    generator: Arc<G>,
    analyzer: Arc<A>,
    config: OrchestratorConfig,
    invocation_id: String,
    cancel: Cancellation,
    sessions: Mutex<HashMap<String, Arc<AsyncMutex<Session<S>>>>>,
}

impl<S: Storage, G: CodeGenerator, A: Analyzer> LoopOrchestrator<S, G, A> {
    pub fn new(
        storage: Arc<S>,
        registry: Arc<ArtifactRegistry<S>>,
        backend: Arc<dyn ExecutionBackend>,
        generator: Arc<G>,
        analyzer: Arc<A>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            backend,
            generator,
            analyzer,
            config,
            invocation_id: generate_invocation_id(),
            cancel: Cancellation::never(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Backend calls stop waiting once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ArtifactRegistry<S> {
        &self.registry
    }

    /// Run iterations until the session stops.
    pub async fn run_session(&self, session_id: &str) -> Result<SessionReport> {
        let mut iterations = Vec::new();
        let reason = loop {
            let outcome = self.run_iteration(session_id).await?;
            let reason = outcome.terminal_reason().cloned();
            iterations.push(outcome);
            if let Some(reason) = reason {
                break reason;
            }
        };
        info!(session_id, iterations = iterations.len(), reason = %reason, "session stopped");

        Ok(SessionReport {
            session_id: session_id.to_string(),
            iterations,
            reason,
            summary: self.get_session_summary(session_id).await?,
        })
    }

    /// Run one iteration of `session_id`.
    ///
    /// A session that cannot start another iteration (cap already reached, or
    /// cancellation fired) returns its terminal decision without running
    /// anything. A session is dropped from memory once it stops; running it
    /// again reopens it from durable state.
    pub async fn run_iteration(&self, session_id: &str) -> Result<IterationOutcome> {
        let handle = self.session(session_id)?;
        let outcome = {
            let mut guard = handle.lock().await;
            self.iterate(&mut guard, session_id).await
        };
        if outcome.decision.is_stop() {
            self.evict(session_id, &handle)?;
        }
        Ok(outcome)
    }

    async fn iterate(&self, session: &mut Session<S>, session_id: &str) -> IterationOutcome {
        let iterations_run = session.controller.iterations_run();
        if self.cancel.is_cancelled() {
            warn!(session_id, "cancellation requested, not starting iteration");
            session.controller.record_fatal(CANCELLED);
        }
        if let Decision::Stop(reason) = session.controller.decide() {
            info!(session_id, reason = %reason, "session stopped before iteration");
            let mut outcome = IterationOutcome::new(session_id, &self.invocation_id, iterations_run);
            outcome.decision = Decision::Stop(reason);
            return outcome;
        }

        let mut outcome = IterationOutcome::new(session_id, &self.invocation_id, iterations_run + 1);
        info!(session_id, iteration = outcome.iteration, "iteration started");

        let analysis = match self.run_stages(session, &mut outcome).await {
            Ok(analysis) => analysis,
            Err(e) => {
                error!(session_id, iteration = outcome.iteration, error = %e, "iteration aborted");
                session.controller.record_fatal(e.to_string());
                None
            }
        };
        self.prune(session, &mut outcome, analysis);
        outcome
    }

    /// Forget a stopped session unless another caller already replaced it.
    fn evict(&self, session_id: &str, handle: &Arc<AsyncMutex<Session<S>>>) -> Result<()> {
        let mut sessions = self.sessions.lock().map_err(sessions_lock_err)?;
        if sessions.get(session_id).is_some_and(|s| Arc::ptr_eq(s, handle)) {
            sessions.remove(session_id);
            debug!(session_id, "evicted stopped session");
        }
        Ok(())
    }

    /// Latest durable summary of a session.
    pub async fn get_session_summary(&self, session_id: &str) -> Result<Option<String>> {
        if let Some(handle) = self.loaded_session(session_id)? {
            let session = handle.lock().await;
            return session.state.get_as(SUMMARY_KEY, Scope::Durable);
        }
        // Read-only view; opening a session here would run recovery
        let state = StateStore::open(self.storage.clone(), session_id)?;
        state.get_as(SUMMARY_KEY, Scope::Durable)
    }

    fn loaded_session(&self, session_id: &str) -> Result<Option<Arc<AsyncMutex<Session<S>>>>> {
        let sessions = self.sessions.lock().map_err(sessions_lock_err)?;
        Ok(sessions.get(session_id).cloned())
    }

    fn session(&self, session_id: &str) -> Result<Arc<AsyncMutex<Session<S>>>> {
        let mut sessions = self.sessions.lock().map_err(sessions_lock_err)?;
        if let Some(session) = sessions.get(session_id) {
            return Ok(session.clone());
        }

        self.recover(session_id)?;
        let state = StateStore::open(self.storage.clone(), session_id)?;
        let done: u32 = state.get_as(ITERATION_KEY, Scope::Durable)?.unwrap_or(0);
        let controller =
            TerminationController::new(self.config.max_iterations, self.config.stale_token_limit).resume_from(done);
        debug!(session_id, iterations_run = done, "opened session");

        let session = Arc::new(AsyncMutex::new(Session { state, controller }));
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Close an artifact left open by an earlier invocation.
    fn recover(&self, session_id: &str) -> Result<()> {
        if let Some(open) = self.registry.get_open(session_id)?
            && open.invocation_id != self.invocation_id
        {
            warn!(
                session_id,
                artifact_id = %open.id,
                previous_invocation = %open.invocation_id,
                status = %open.status,
                "closing artifact abandoned by previous invocation"
            );
            self.registry.finalize(
                &open.id,
                ArtifactOutcome::Failed(ABANDONED_BY_PREVIOUS_INVOCATION.to_string()),
                None,
            )?;
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        session: &mut Session<S>,
        outcome: &mut IterationOutcome,
    ) -> Result<Option<AnalysisDecision>> {
        let iteration = outcome.iteration;

        let artifact = self.generate(session, iteration).await?;
        outcome.artifact_id = Some(artifact.id.clone());

        if !self.dispatch(session, iteration, &artifact).await? {
            return Ok(self.stale(session, outcome, "dispatch"));
        }

        let Some(result) = self.inject(session, iteration, &artifact.id)? else {
            return Ok(self.stale(session, outcome, "inject"));
        };
        outcome.failure_kind = Some(result.failure_kind);
        outcome.result_summary = Some(result.summary());

        let decision = self.analyze(session, &result).await?;
        Ok(Some(decision))
    }

    fn stale(&self, session: &mut Session<S>, outcome: &mut IterationOutcome, stage: &str) -> Option<AnalysisDecision> {
        outcome.inconsistency = Some(format!("{} at {}", STALE_STAGE_TOKEN, stage));
        session.controller.record_stale_token();
        None
    }

    /// Generate: create the artifact and hand it to Dispatch.
    async fn generate(&self, session: &mut Session<S>, iteration: u32) -> Result<Artifact> {
        let session_id = session.state.session_id().to_string();
        let context = GenerationContext {
            session_id: session_id.clone(),
            iteration,
            summary: session.state.get_as(SUMMARY_KEY, Scope::Durable)?,
            durable: session.state.snapshot(),
        };
        let code = self.generator.generate(&context).await?;

        let artifact = self.registry.create(
            &session_id,
            &self.invocation_id,
            iteration,
            &self.config.artifact_type,
            code,
        )?;
        let artifact = self.registry.advance(&artifact.id, ArtifactStatus::Delegated)?;
        session.state.set(
            STAGE_TOKEN_KEY,
            Scope::Ephemeral,
            StageToken::new(iteration, &artifact.id, Stage::Delegated),
        )?;
        debug!(session_id = %session_id, iteration, artifact_id = %artifact.id, code = %artifact.code_ref, "generated artifact");
        Ok(artifact)
    }

    /// Dispatch: execute the artifact if the token hands it to this iteration.
    pub(crate) async fn dispatch(&self, session: &mut Session<S>, iteration: u32, artifact: &Artifact) -> Result<bool> {
        let token: Option<StageToken> = session.state.get_as(STAGE_TOKEN_KEY, Scope::Ephemeral)?;
        if !token
            .as_ref()
            .is_some_and(|t| t.matches(iteration, &artifact.id, Stage::Delegated))
        {
            warn!(
                iteration,
                expected_artifact = %artifact.id,
                token = ?token,
                "dispatch skipped: stale stage token"
            );
            return Ok(false);
        }

        self.registry.advance(&artifact.id, ArtifactStatus::Executing)?;
        info!(
            artifact_id = %artifact.id,
            backend = self.backend.name(),
            timeout_ms = self.config.execution_timeout.as_millis() as u64,
            "executing artifact"
        );
        let result = self
            .backend
            .submit_and_wait(&artifact.code_ref, self.config.execution_timeout, &self.cancel)
            .await;
        self.registry.advance(&artifact.id, ArtifactStatus::Executed)?;

        let stored = StoredResult {
            id: artifact.id.clone(),
            session_id: artifact.session_id.clone(),
            result: result.clone(),
            recorded_at: now_ms(),
        };
        self.storage.upsert(RESULTS_COLLECTION, &stored)?;
        let result_ref = result_ref(&artifact.id);
        self.registry.attach_result(
            &artifact.id,
            &format!("{}#stdout", result_ref),
            &format!("{}#stderr", result_ref),
        )?;

        session.state.set(LAST_RESULT_KEY, Scope::Durable, result.summary())?;
        session.state.set(&result_key(&artifact.id), Scope::Ephemeral, &result)?;
        session.state.set(
            STAGE_TOKEN_KEY,
            Scope::Ephemeral,
            StageToken::new(iteration, &artifact.id, Stage::Executed),
        )?;
        info!(artifact_id = %artifact.id, failure_kind = %result.failure_kind, duration_ms = result.duration_ms, "artifact executed");
        Ok(true)
    }

    /// Inject: fetch the result only for this iteration's executed artifact.
    pub(crate) fn inject(
        &self,
        session: &mut Session<S>,
        iteration: u32,
        artifact_id: &str,
    ) -> Result<Option<ExecutionResult>> {
        let token: Option<StageToken> = session.state.get_as(STAGE_TOKEN_KEY, Scope::Ephemeral)?;
        if !token
            .as_ref()
            .is_some_and(|t| t.matches(iteration, artifact_id, Stage::Executed))
        {
            warn!(iteration, expected_artifact = %artifact_id, token = ?token, "inject skipped: stale stage token");
            return Ok(None);
        }

        let result: Option<ExecutionResult> = session.state.get_as(&result_key(artifact_id), Scope::Ephemeral)?;
        if result.is_none() {
            warn!(artifact_id, "inject skipped: no result for executed artifact");
        }
        Ok(result)
    }

    /// Analyze: ask the analyzer and record its summary durably.
    async fn analyze(&self, session: &mut Session<S>, result: &ExecutionResult) -> Result<AnalysisDecision> {
        let previous: Option<String> = session.state.get_as(SUMMARY_KEY, Scope::Durable)?;
        let decision = self.analyzer.analyze(result, previous.as_deref()).await?;

        session.state.set(SUMMARY_KEY, Scope::Durable, &decision.summary)?;
        session.state.merge_delta(decision.state_updates.clone());
        debug!(continue_loop = decision.continue_loop, summary = %decision.summary, "analysis complete");
        Ok(decision)
    }

    /// Prune: close the artifact, drop ephemeral state, commit durable state.
    fn prune(&self, session: &mut Session<S>, outcome: &mut IterationOutcome, analysis: Option<AnalysisDecision>) {
        session.controller.record_iteration();
        if let Err(e) = session.state.set(ITERATION_KEY, Scope::Durable, outcome.iteration) {
            session.controller.record_fatal(e.to_string());
        }

        let continue_loop = match &analysis {
            Some(decision) => {
                outcome.summary = Some(decision.summary.clone());
                if !decision.continue_loop {
                    session.controller.request_exit();
                }
                decision.continue_loop
            }
            None => false,
        };

        if let Err(e) = self.close_artifact(session, outcome, analysis.is_some(), continue_loop) {
            error!(session_id = %outcome.session_id, error = %e, "failed to close artifact");
            session.controller.record_fatal(e.to_string());
        }

        session.state.prune_ephemeral();
        match session.state.commit_delta() {
            Ok(delta) => debug!(session_id = %outcome.session_id, changes = delta.changes.len(), "committed durable state"),
            Err(e) => {
                error!(session_id = %outcome.session_id, error = %e, "durable commit failed");
                session.controller.record_fatal(e.to_string());
            }
        }

        if self.cancel.is_cancelled() {
            session.controller.record_fatal(CANCELLED);
        }
        outcome.decision = session.controller.decide();
        info!(
            session_id = %outcome.session_id,
            iteration = outcome.iteration,
            artifact_status = ?outcome.artifact_status,
            decision = ?outcome.decision,
            "iteration finished"
        );
    }

    fn close_artifact(
        &self,
        session: &mut Session<S>,
        outcome: &mut IterationOutcome,
        analyzed: bool,
        continue_loop: bool,
    ) -> Result<()> {
        let Some(open) = self.registry.get_open(&outcome.session_id)? else {
            return Ok(());
        };
        if outcome.artifact_id.is_none() {
            outcome.artifact_id = Some(open.id.clone());
        }

        let controller = &session.controller;
        let failure = if let Some(fatal) = controller.fatal_error() {
            Some(format!("fatal_error:{}", fatal))
        } else if !analyzed {
            Some(STALE_STAGE_TOKEN.to_string())
        } else if continue_loop && controller.cap_reached() {
            Some(ITERATION_CAP_EXHAUSTED.to_string())
        } else {
            None
        };
        let stored: Option<StoredResult> = self.storage.get(RESULTS_COLLECTION, &open.id)?;
        let stored_ref = stored.map(|_| result_ref(&open.id));

        let requested = match failure {
            Some(reason) => ArtifactOutcome::Failed(reason),
            None => ArtifactOutcome::Consumed,
        };
        let closed = match self.registry.finalize(&open.id, requested, stored_ref) {
            Ok(artifact) => artifact,
            Err(e @ CodeloopError::InvalidTransition { .. }) => {
                session.controller.record_fatal(e.to_string());
                self.registry
                    .finalize(&open.id, ArtifactOutcome::Failed(format!("fatal_error:{}", e)), None)?
            }
            Err(e) => return Err(e),
        };
        outcome.artifact_status = Some(closed.status);
        Ok(())
    }
}

fn sessions_lock_err<E: std::fmt::Display>(e: E) -> CodeloopError {
    CodeloopError::Storage(format!("session map lock poisoned: {}", e))
}
