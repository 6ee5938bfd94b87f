//! Controller states, run termination and cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent::ToolContext;
use crate::error::{LlmError, OracleError, PipelineError, SessionError};
use crate::patch::PatchCandidate;
use crate::pipeline::Verdict;

/// Cooperative cancellation shared between a run and whoever started it.
///
/// Checked at every state transition; an in-flight LLM or oracle call is
/// allowed to finish first.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// States after INIT. Each state carries what the next step consumes.
pub(crate) enum RunState {
    Localize,
    ReasonAndPatch { task: String, ctx: ToolContext },
    Validate { candidates: Vec<PatchCandidate> },
    Retry { verdict: Verdict },
    Accept,
    Abandon(Terminal),
}

impl RunState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            RunState::Localize => "LOCALIZE",
            RunState::ReasonAndPatch { .. } => "REASON_AND_PATCH",
            RunState::Validate { .. } => "VALIDATE",
            RunState::Retry { .. } => "RETRY",
            RunState::Accept => "ACCEPT",
            RunState::Abandon(_) => "ABANDON",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Terminal {
    pub verdict: Verdict,
    pub fixed: bool,
    pub error: Option<String>,
    /// Set when a repeated-failure limit ended the run early.
    pub stop_reason: Option<String>,
}

impl Terminal {
    pub fn accepted() -> Self {
        Self {
            verdict: Verdict::Green,
            fixed: true,
            error: None,
            stop_reason: None,
        }
    }

    /// Iteration budget used up; the last iteration's verdict stands.
    pub fn exhausted(verdict: Verdict) -> Self {
        Self {
            verdict,
            fixed: false,
            error: None,
            stop_reason: None,
        }
    }

    /// Gave up with budget left because the same kind of failure kept
    /// recurring.
    pub fn stopped_early(verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            stop_reason: Some(reason.into()),
            ..Self::exhausted(verdict)
        }
    }

    /// Verify-only runs never count as fixed, whatever the suite says.
    pub fn verified(verdict: Verdict) -> Self {
        Self::exhausted(verdict)
    }

    pub fn abort(verdict: Verdict, error: impl Into<String>) -> Self {
        Self {
            verdict,
            fixed: false,
            error: Some(error.into()),
            stop_reason: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::abort(Verdict::Cancelled, "run cancelled")
    }

    pub fn from_oracle(err: &OracleError) -> Self {
        match err {
            OracleError::Timeout { .. } => Self::abort(Verdict::Timeout, err.to_string()),
            _ => Self::abort(Verdict::FatalError, err.to_string()),
        }
    }

    pub fn from_pipeline(err: &PipelineError) -> Self {
        match err {
            PipelineError::Oracle(e) => Self::from_oracle(e),
            PipelineError::Io(_) => Self::abort(Verdict::FatalError, err.to_string()),
        }
    }

    pub fn from_session(err: &SessionError) -> Self {
        match err {
            SessionError::Llm(LlmError::Timeout { .. }) => {
                Self::abort(Verdict::Timeout, err.to_string())
            }
            _ => Self::abort(Verdict::FatalError, err.to_string()),
        }
    }
}
