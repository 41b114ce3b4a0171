//! Loop orchestration: stage gating, collaborators and termination.

mod collaborators;
#[allow(clippy::module_inception)]
mod orchestrator;
mod stage;
mod termination;

pub use collaborators::{AnalysisDecision, Analyzer, CodeGenerator, ExitStatusAnalyzer, GenerationContext, ScriptGenerator};
pub use orchestrator::{
    ABANDONED_BY_PREVIOUS_INVOCATION, CANCELLED, ITERATION_CAP_EXHAUSTED, ITERATION_KEY, IterationOutcome, LAST_RESULT_KEY,
    LoopOrchestrator, OrchestratorConfig, STALE_STAGE_TOKEN, SUMMARY_KEY, SessionReport, result_ref,
};
pub use stage::{STAGE_TOKEN_KEY, Stage, StageToken, result_key};
pub use termination::{Decision, REPEATED_STALE_TOKEN, TerminalReason, TerminationController};
