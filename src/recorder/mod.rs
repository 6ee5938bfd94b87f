//! Run outcomes and their persistence.
//!
//! Every run, however it ends, produces exactly one [`Outcome`], which is
//! appended as a single JSON line through a [`ResultStore`].

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::ToolCallRecord;
use crate::localize::LocalizedSpan;
use crate::oracle::OracleCounters;
use crate::pipeline::{StepRecord, Verdict};
use crate::policy::GatePolicy;

pub use store::{JsonlResultStore, MemoryResultStore, ResultStore};

/// Wall-clock time spent per phase, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    /// Lock, checkout, index, baseline and RED check.
    pub setup_ms: u64,
    pub reasoning_ms: u64,
    pub validation_ms: u64,
    pub total_ms: u64,
}

/// Resource usage over the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub llm_turns: u32,
    pub tool_calls: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Proposals whose fingerprint matched an earlier one.
    pub duplicate_patches: u32,
    #[serde(default)]
    pub localization_calls: u32,
    #[serde(default)]
    pub patch_calls: u32,
    /// Patch candidates validated, over all iterations.
    #[serde(default)]
    pub candidates_tried: u32,
    pub oracle: OracleCounters,
}

/// How one candidate of a multi-candidate proposal fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<u32>,
}

/// Summary of one completed iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub verdict: Verdict,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// Localization context in effect when the iteration ended.
    #[serde(default)]
    pub localized_spans: Vec<LocalizedSpan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
    /// Iteration whose verdict was reused for a repeated patch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_patch_reason: Option<String>,
    /// Every candidate tried, in order; the last one decided the verdict.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateRecord>,
    pub llm_turns: u32,
    #[serde(default)]
    pub localization_calls: u32,
    #[serde(default)]
    pub patch_calls: u32,
    pub elapsed_ms: u64,
}

impl IterationRecord {
    pub fn new(iteration: u32, verdict: Verdict) -> Self {
        Self {
            iteration,
            verdict,
            steps: Vec::new(),
            tool_calls: Vec::new(),
            localized_spans: Vec::new(),
            canonical_patch: None,
            fingerprint: None,
            touched_files: Vec::new(),
            duplicate_of: None,
            no_patch_reason: None,
            candidates: Vec::new(),
            llm_turns: 0,
            localization_calls: 0,
            patch_calls: 0,
            elapsed_ms: 0,
        }
    }
}

/// The record of one bug run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub run_id: Uuid,
    pub benchmark: String,
    pub project_id: String,
    pub bug_id: String,
    pub model: String,
    pub variant: String,
    pub gate_policy: GatePolicy,
    pub fixed: bool,
    pub iterations_used: u32,
    pub terminal_verdict: Verdict,
    pub elapsed_ms: u64,
    pub timings: Timings,
    pub counters: RunCounters,
    /// Canonical diff of the accepted patch.
    pub final_patch: Option<String>,
    pub error: Option<String>,
    /// Why the run gave up before its iteration budget was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    /// Steps run before the first iteration (the RED check).
    #[serde(default)]
    pub setup_steps: Vec<StepRecord>,
    pub iterations: Vec<IterationRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    /// One-line human summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{}/{}-{} [{}] fixed={} iterations={} verdict={} ({:.1}s)",
            self.benchmark,
            self.project_id,
            self.bug_id,
            self.variant,
            self.fixed,
            self.iterations_used,
            self.terminal_verdict,
            self.elapsed_ms as f64 / 1000.0
        )
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_shape() {
        let outcome = fixtures::outcome("defects4j", "1");
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["terminal_verdict"], "green");
        assert_eq!(value["gate_policy"]["tdd_gate"], true);
        assert_eq!(value["iterations"][0]["verdict"], "green");
        assert!(value["iterations"][0].get("canonical_patch").is_none());
        assert!(value["error"].is_null());
        assert!(value.get("stop_reason").is_none());
        assert!(value["iterations"][0].get("candidates").is_none());

        let back: Outcome = serde_json::from_value(value).unwrap();
        assert_eq!(back.run_id, outcome.run_id);
    }

    #[test]
    fn test_summary() {
        let outcome = fixtures::outcome("defects4j", "7");
        assert_eq!(
            outcome.summary(),
            "defects4j/Lang-7 [G5] fixed=true iterations=1 verdict=green (1.5s)"
        );
    }
}
