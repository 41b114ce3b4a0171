//! External collaborators of the loop: code generation and result analysis.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::backend::{ExecutionResult, FailureKind, truncate_string};
use crate::error::Result;
use crate::registry::CodeRef;
use crate::state::StateChange;

/// What the generator knows when producing code for an iteration
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub session_id: String,
    pub iteration: u32,
    /// Durable summary left by the previous analysis
    pub summary: Option<String>,
    /// Durable state of the session
    pub durable: BTreeMap<String, serde_json::Value>,
}

/// Produces the code run by an iteration
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, context: &GenerationContext) -> Result<CodeRef>;
}

/// Verdict of an analysis step
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisDecision {
    pub continue_loop: bool,
    /// Written to durable state as the session summary
    pub summary: String,
    /// Extra durable changes, committed with the iteration
    pub state_updates: Vec<StateChange>,
}

impl AnalysisDecision {
    pub fn continue_with(summary: impl Into<String>) -> Self {
        Self {
            continue_loop: true,
            summary: summary.into(),
            state_updates: Vec::new(),
        }
    }

    pub fn stop_with(summary: impl Into<String>) -> Self {
        Self {
            continue_loop: false,
            summary: summary.into(),
            state_updates: Vec::new(),
        }
    }
}

/// Inspects an execution result and decides whether to go on
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, result: &ExecutionResult, summary: Option<&str>) -> Result<AnalysisDecision>;
}

/// Generator that hands out the same code every iteration.
#[derive(Debug, Clone)]
pub struct ScriptGenerator {
    code: CodeRef,
}

impl ScriptGenerator {
    pub fn new(code: CodeRef) -> Self {
        Self { code }
    }
}

#[async_trait]
impl CodeGenerator for ScriptGenerator {
    async fn generate(&self, _context: &GenerationContext) -> Result<CodeRef> {
        Ok(self.code.clone())
    }
}

/// Stops on success and retries on failure.
#[derive(Debug, Clone, Default)]
pub struct ExitStatusAnalyzer {
    /// Keep going after a success too
    pub continue_on_success: bool,
}

const SUMMARY_OUTPUT_BYTES: usize = 200;

#[async_trait]
impl Analyzer for ExitStatusAnalyzer {
    async fn analyze(&self, result: &ExecutionResult, _summary: Option<&str>) -> Result<AnalysisDecision> {
        let mut summary = result.summary();
        let tail = match result.failure_kind {
            FailureKind::None => result.stdout.trim(),
            _ => result.stderr.trim(),
        };
        if !tail.is_empty() {
            summary.push_str(": ");
            summary.push_str(&truncate_string(tail, SUMMARY_OUTPUT_BYTES));
        }

        Ok(AnalysisDecision {
            continue_loop: !result.success || self.continue_on_success,
            summary,
            state_updates: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_script_generator_repeats_code() {
        let generator = ScriptGenerator::new(CodeRef::inline("echo hi"));
        let context = GenerationContext {
            iteration: 3,
            ..Default::default()
        };
        assert_eq!(generator.generate(&context).await.unwrap(), CodeRef::inline("echo hi"));
    }

    #[tokio::test]
    async fn test_exit_status_analyzer_stops_on_success() {
        let result = ExecutionResult::completed("42\n".into(), String::new(), Some(0), Duration::from_millis(3));
        let decision = ExitStatusAnalyzer::default().analyze(&result, None).await.unwrap();
        assert!(!decision.continue_loop);
        assert_eq!(decision.summary, "succeeded in 3ms: 42");
    }

    #[tokio::test]
    async fn test_exit_status_analyzer_retries_on_failure() {
        let result = ExecutionResult::completed(String::new(), "bad input".into(), Some(1), Duration::ZERO);
        let decision = ExitStatusAnalyzer::default().analyze(&result, Some("prev")).await.unwrap();
        assert!(decision.continue_loop);
        assert!(decision.summary.ends_with("bad input"));
    }

    #[tokio::test]
    async fn test_continue_on_success() {
        let analyzer = ExitStatusAnalyzer {
            continue_on_success: true,
        };
        let result = ExecutionResult::completed(String::new(), String::new(), Some(0), Duration::ZERO);
        assert!(analyzer.analyze(&result, None).await.unwrap().continue_loop);
    }
}
