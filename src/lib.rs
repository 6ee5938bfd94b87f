//! gated-repair: a gated, iterative LLM program-repair loop.
//!
//! This library drives an LLM agent through localize / patch / validate
//! iterations on benchmark bugs, with optional TDD, index-retrieval and
//! compile gates, and records one outcome per run.

// Core modules
pub mod agent;
pub mod batch;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod index;
pub mod llm;
pub mod localize;
pub mod oracle;
pub mod patch;
pub mod pipeline;
pub mod policy;
pub mod recorder;
pub mod retry;

// Re-export commonly used types
pub use config::{RepairConfig, RetryPolicy, SessionLimits};
pub use controller::{CancelFlag, IterationController};
pub use error::{
    ConfigError, IndexBuildError, IndexQueryError, LlmError, OracleError, PatchError,
    RecorderError, SessionError,
};
pub use oracle::{BugInstance, OracleAdapter, TestReport, TestStatus};
pub use pipeline::Verdict;
pub use policy::GatePolicy;
pub use recorder::{Outcome, ResultStore};
