//! Validation pipeline: the gated sequence that turns a proposal into a verdict.
//!
//! Steps, in order, each skipped when its gate is off:
//!
//! 1. RED check (`tdd_gate`), once per run before any patch
//! 2. Apply, with the compile gate when enabled
//! 3. GREEN check (`tdd_gate`)
//! 4. Regression check against the pre-patch relevant-test baseline
//! 5. Full suite, always
//!
//! The first negative step ends the iteration with its verdict.

pub mod validate;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use validate::{RedCheck, ValidationPipeline, ValidationReport};

/// Outcome of one iteration, or of a whole run when it ends abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    RedConfirmed,
    PatchNotApplicable,
    CompileFailed,
    Green,
    RegressionDetected,
    NoPatchProduced,
    /// The bug could not be set up (e.g. trigger tests already pass).
    SetupError,
    Timeout,
    FatalError,
    Cancelled,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::RedConfirmed => "red-confirmed",
            Verdict::PatchNotApplicable => "patch-not-applicable",
            Verdict::CompileFailed => "compile-failed",
            Verdict::Green => "green",
            Verdict::RegressionDetected => "regression-detected",
            Verdict::NoPatchProduced => "no-patch-produced",
            Verdict::SetupError => "setup-error",
            Verdict::Timeout => "timeout",
            Verdict::FatalError => "fatal-error",
            Verdict::Cancelled => "cancelled",
        }
    }

    /// Verdicts that end the run instead of consuming an iteration.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            Verdict::SetupError | Verdict::Timeout | Verdict::FatalError | Verdict::Cancelled
        )
    }

    pub fn is_green(&self) -> bool {
        *self == Verdict::Green
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
            .map_err(|_| format!("unknown verdict '{s}'"))
    }
}

/// Pipeline steps, as recorded per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStep {
    RedCheck,
    Apply,
    CompileGate,
    GreenCheck,
    RegressionCheck,
    FullSuite,
}

impl fmt::Display for GateStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateStep::RedCheck => "red_check",
            GateStep::Apply => "apply",
            GateStep::CompileGate => "compile_gate",
            GateStep::GreenCheck => "green_check",
            GateStep::RegressionCheck => "regression_check",
            GateStep::FullSuite => "full_suite",
        };
        f.write_str(name)
    }
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: GateStep,
    pub passed: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_wire_names() {
        for verdict in [
            Verdict::RedConfirmed,
            Verdict::PatchNotApplicable,
            Verdict::CompileFailed,
            Verdict::Green,
            Verdict::RegressionDetected,
            Verdict::NoPatchProduced,
            Verdict::SetupError,
            Verdict::Timeout,
            Verdict::FatalError,
            Verdict::Cancelled,
        ] {
            let json = serde_json::to_string(&verdict).unwrap();
            assert_eq!(json, format!("\"{}\"", verdict.as_str()));
            assert_eq!(verdict.as_str().parse::<Verdict>().unwrap(), verdict);
        }
        assert!("purple".parse::<Verdict>().is_err());
    }

    #[test]
    fn test_run_level_verdicts() {
        assert!(Verdict::SetupError.is_run_level());
        assert!(Verdict::Cancelled.is_run_level());
        assert!(!Verdict::CompileFailed.is_run_level());
        assert!(!Verdict::NoPatchProduced.is_run_level());
    }
}
