//! Termination controller - decides whether another iteration starts.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Fatal reason set when stale stage tokens keep appearing.
pub const REPEATED_STALE_TOKEN: &str = "repeated_stale_stage_token";

/// Why a session stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    StoppedByAgent,
    IterationCap,
    FatalError(String),
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::StoppedByAgent => write!(f, "stopped_by_agent"),
            TerminalReason::IterationCap => write!(f, "iteration_cap"),
            TerminalReason::FatalError(reason) => write!(f, "fatal_error:{}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Continue,
    Stop(TerminalReason),
}

impl Decision {
    pub fn is_stop(&self) -> bool {
        matches!(self, Decision::Stop(_))
    }
}

#[derive(Debug, Clone)]
pub struct TerminationController {
    iterations_run: u32,
    max_iterations: u32,
    exit_requested: bool,
    fatal_error: Option<String>,
    stale_tokens: u32,
    stale_token_limit: u32,
}

impl TerminationController {
    pub fn new(max_iterations: u32, stale_token_limit: u32) -> Self {
        Self {
            iterations_run: 0,
            max_iterations,
            exit_requested: false,
            fatal_error: None,
            stale_tokens: 0,
            stale_token_limit,
        }
    }

    /// Resume counting from iterations already run by earlier invocations.
    pub fn resume_from(mut self, iterations_run: u32) -> Self {
        self.iterations_run = iterations_run;
        self
    }

    pub fn iterations_run(&self) -> u32 {
        self.iterations_run
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn record_iteration(&mut self) {
        self.iterations_run += 1;
    }

    /// The agent asked to stop.
    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// Keeps the first fatal reason.
    pub fn record_fatal(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        match &self.fatal_error {
            Some(existing) => warn!(existing = %existing, ignored = %reason, "fatal error already recorded"),
            None => {
                warn!(reason = %reason, "fatal error recorded");
                self.fatal_error = Some(reason);
            }
        }
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal_error.as_deref()
    }

    /// Count a stale stage token; escalates once the limit is reached.
    pub fn record_stale_token(&mut self) {
        self.stale_tokens += 1;
        warn!(stale_tokens = self.stale_tokens, limit = self.stale_token_limit, "stale stage token");
        if self.stale_token_limit > 0 && self.stale_tokens >= self.stale_token_limit {
            self.record_fatal(REPEATED_STALE_TOKEN);
        }
    }

    pub fn stale_tokens(&self) -> u32 {
        self.stale_tokens
    }

    pub fn cap_reached(&self) -> bool {
        self.iterations_run >= self.max_iterations
    }

    pub fn decide(&self) -> Decision {
        if let Some(reason) = &self.fatal_error {
            Decision::Stop(TerminalReason::FatalError(reason.clone()))
        } else if self.exit_requested {
            Decision::Stop(TerminalReason::StoppedByAgent)
        } else if self.cap_reached() {
            Decision::Stop(TerminalReason::IterationCap)
        } else {
            Decision::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_until_cap() {
        let mut controller = TerminationController::new(2, 3);
        assert_eq!(controller.decide(), Decision::Continue);
        controller.record_iteration();
        assert_eq!(controller.decide(), Decision::Continue);
        controller.record_iteration();
        assert_eq!(controller.decide(), Decision::Stop(TerminalReason::IterationCap));
    }

    #[test]
    fn test_exit_requested_stops() {
        let mut controller = TerminationController::new(10, 3);
        controller.record_iteration();
        controller.request_exit();
        assert_eq!(controller.decide(), Decision::Stop(TerminalReason::StoppedByAgent));
    }

    #[test]
    fn test_reason_priority() {
        let mut controller = TerminationController::new(1, 3);
        controller.record_iteration();
        controller.request_exit();
        assert_eq!(controller.decide(), Decision::Stop(TerminalReason::StoppedByAgent));

        controller.record_fatal("backend gone");
        assert_eq!(
            controller.decide(),
            Decision::Stop(TerminalReason::FatalError("backend gone".into()))
        );
    }

    #[test]
    fn test_first_fatal_wins() {
        let mut controller = TerminationController::new(5, 3);
        controller.record_fatal("first");
        controller.record_fatal("second");
        assert_eq!(controller.fatal_error(), Some("first"));
    }

    #[test]
    fn test_stale_tokens_escalate() {
        let mut controller = TerminationController::new(10, 2);
        controller.record_stale_token();
        assert_eq!(controller.decide(), Decision::Continue);
        controller.record_stale_token();
        assert_eq!(
            controller.decide(),
            Decision::Stop(TerminalReason::FatalError(REPEATED_STALE_TOKEN.into()))
        );
    }

    #[test]
    fn test_zero_stale_limit_never_escalates() {
        let mut controller = TerminationController::new(10, 0);
        for _ in 0..5 {
            controller.record_stale_token();
        }
        assert!(controller.fatal_error().is_none());
    }

    #[test]
    fn test_resume_from_counts_earlier_iterations() {
        let controller = TerminationController::new(3, 3).resume_from(3);
        assert!(controller.cap_reached());
        assert_eq!(controller.decide(), Decision::Stop(TerminalReason::IterationCap));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(TerminalReason::StoppedByAgent.to_string(), "stopped_by_agent");
        assert_eq!(TerminalReason::IterationCap.to_string(), "iteration_cap");
        assert_eq!(
            TerminalReason::FatalError("repeated_stale_stage_token".into()).to_string(),
            "fatal_error:repeated_stale_stage_token"
        );
    }
}
