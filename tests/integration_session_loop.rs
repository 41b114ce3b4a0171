//! Session loop integration tests
//!
//! Drives whole sessions through the local `sh` backend with JSONL storage.

use std::sync::Arc;
use std::time::Duration;

use codeloop::backend::{ExecutionBackend, FailureKind, LocalBackend, LocalConfig, StoredResult};
use codeloop::orchestrator::{
    ABANDONED_BY_PREVIOUS_INVOCATION, ExitStatusAnalyzer, ITERATION_CAP_EXHAUSTED, LoopOrchestrator,
    OrchestratorConfig, ScriptGenerator, TerminalReason, result_ref,
};
use codeloop::registry::{ArtifactRegistry, ArtifactStatus, CodeRef};
use codeloop::state::{Scope, StateStore, is_ephemeral_key};
use codeloop::storage::{JsonlStorage, RESULTS_COLLECTION, SESSION_STATE_COLLECTION, Storage};
use tempfile::TempDir;

type Orchestrator = LoopOrchestrator<JsonlStorage, ScriptGenerator, ExitStatusAnalyzer>;

struct Env {
    storage: Arc<JsonlStorage>,
    registry: Arc<ArtifactRegistry<JsonlStorage>>,
    work: TempDir,
    _data: TempDir,
}

impl Env {
    fn new() -> Self {
        let data = TempDir::new().unwrap();
        let storage = Arc::new(JsonlStorage::new(data.path()).unwrap());
        Self {
            registry: Arc::new(ArtifactRegistry::new(storage.clone())),
            storage,
            work: TempDir::new().unwrap(),
            _data: data,
        }
    }

    fn orchestrator(&self, source: &str, max_iterations: u32, timeout: Duration) -> Orchestrator {
        let backend: Arc<dyn ExecutionBackend> =
            Arc::new(LocalBackend::new(LocalConfig::default().work_dir(self.work.path())));
        let config = OrchestratorConfig {
            max_iterations,
            execution_timeout: timeout,
            ..Default::default()
        };
        LoopOrchestrator::new(
            self.storage.clone(),
            self.registry.clone(),
            backend,
            Arc::new(ScriptGenerator::new(CodeRef::inline(source))),
            Arc::new(ExitStatusAnalyzer::default()),
            config,
        )
    }
}

#[tokio::test]
async fn test_successful_script_stops_after_one_iteration() {
    let env = Env::new();
    let orchestrator = env.orchestrator("echo answer=42", 5, Duration::from_secs(10));

    let report = orchestrator.run_session("s1").await.unwrap();
    assert_eq!(report.reason, TerminalReason::StoppedByAgent);
    assert_eq!(report.iterations.len(), 1);
    assert!(report.summary.as_deref().unwrap().contains("answer=42"));

    let artifacts = env.registry.list_for_session("s1").unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].status, ArtifactStatus::Consumed);
    assert_eq!(artifacts[0].result_ref, Some(result_ref(&artifacts[0].id)));

    let stored: StoredResult = env.storage.get(RESULTS_COLLECTION, &artifacts[0].id).unwrap().unwrap();
    assert!(stored.result.success);
    assert!(stored.result.stdout.contains("answer=42"));
}

#[tokio::test]
async fn test_failing_script_hits_iteration_cap() {
    let env = Env::new();
    let orchestrator = env.orchestrator("echo nope >&2; exit 1", 3, Duration::from_secs(10));

    let report = orchestrator.run_session("s1").await.unwrap();
    assert_eq!(report.reason, TerminalReason::IterationCap);
    assert_eq!(report.iterations.len(), 3);

    let artifacts = env.registry.list_for_session("s1").unwrap();
    let statuses: Vec<ArtifactStatus> = artifacts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![ArtifactStatus::Consumed, ArtifactStatus::Consumed, ArtifactStatus::Failed]
    );
    assert_eq!(artifacts[2].failure_reason.as_deref(), Some(ITERATION_CAP_EXHAUSTED));
    assert!(artifacts.iter().all(|a| ArtifactStatus::is_monotonic(&a.history)));
}

#[tokio::test]
async fn test_script_succeeds_on_retry() {
    let env = Env::new();
    let orchestrator = env.orchestrator(
        "if [ -f marker ]; then echo recovered; else touch marker; exit 1; fi",
        5,
        Duration::from_secs(10),
    );

    let report = orchestrator.run_session("s1").await.unwrap();
    assert_eq!(report.reason, TerminalReason::StoppedByAgent);
    assert_eq!(report.iterations.len(), 2);
    assert_eq!(report.iterations[0].failure_kind, Some(FailureKind::RuntimeError));
    assert_eq!(report.iterations[1].failure_kind, Some(FailureKind::None));
    assert!(report.summary.unwrap().contains("recovered"));
}

#[tokio::test]
async fn test_timeout_is_reported_to_analysis() {
    let env = Env::new();
    let orchestrator = env.orchestrator("sleep 10", 1, Duration::from_secs(1));

    let started = std::time::Instant::now();
    let outcome = orchestrator.run_iteration("s1").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(outcome.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(outcome.terminal_reason(), Some(&TerminalReason::IterationCap));
    assert_eq!(outcome.artifact_status, Some(ArtifactStatus::Failed));
}

#[tokio::test]
async fn test_session_resumes_across_invocations() {
    let env = Env::new();
    let first = env.orchestrator("exit 1", 2, Duration::from_secs(10));
    let report = first.run_session("s1").await.unwrap();
    assert_eq!(report.iterations.len(), 2);

    // A later invocation with a higher cap continues the numbering
    let second = env.orchestrator("echo done", 4, Duration::from_secs(10));
    let outcome = second.run_iteration("s1").await.unwrap();
    assert_eq!(outcome.iteration, 3);
    assert_eq!(outcome.terminal_reason(), Some(&TerminalReason::StoppedByAgent));
    assert_ne!(first.invocation_id(), second.invocation_id());
}

#[tokio::test]
async fn test_abandoned_artifact_is_failed_on_open() {
    let env = Env::new();
    let stranded = env
        .registry
        .create("s1", "inv-crashed", 1, "analysis_code", CodeRef::inline("echo x"))
        .unwrap();
    env.registry.advance(&stranded.id, ArtifactStatus::Delegated).unwrap();
    env.registry.advance(&stranded.id, ArtifactStatus::Executing).unwrap();

    let orchestrator = env.orchestrator("echo fine", 5, Duration::from_secs(10));
    let outcome = orchestrator.run_iteration("s1").await.unwrap();
    assert_eq!(outcome.artifact_status, Some(ArtifactStatus::Consumed));

    let stranded = env.registry.get(&stranded.id).unwrap().unwrap();
    assert_eq!(stranded.status, ArtifactStatus::Failed);
    assert_eq!(stranded.failure_reason.as_deref(), Some(ABANDONED_BY_PREVIOUS_INVOCATION));
}

#[tokio::test]
async fn test_no_ephemeral_state_reaches_storage() {
    let env = Env::new();
    let orchestrator = env.orchestrator("exit 1", 3, Duration::from_secs(10));
    orchestrator.run_session("s1").await.unwrap();

    let rows: Vec<serde_json::Value> = env.storage.list(SESSION_STATE_COLLECTION).unwrap();
    assert!(!rows.is_empty());
    for row in &rows {
        assert!(!is_ephemeral_key(row["key"].as_str().unwrap()), "leaked row {}", row);
    }

    let state = StateStore::open(env.storage.clone(), "s1").unwrap();
    assert!(state.ephemeral_keys().is_empty());
    assert!(state.get("session_summary", Scope::Durable).is_some());
}
