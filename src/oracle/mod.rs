//! Build/test oracle boundary.
//!
//! Benchmarks plug in through [`OracleAdapter`]. The repair loop never calls
//! an adapter directly; it goes through [`GuardedOracle`], which applies the
//! per-call deadline, retries transient failures and counts invocations.

pub mod command;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;
use crate::error::OracleError;
use crate::retry::retry_transient;

pub use command::{CommandOracle, CommandOracleConfig};

/// One bug of one benchmark, bound to its working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugInstance {
    pub benchmark: String,
    pub project_id: String,
    pub bug_id: String,
    pub working_copy_path: PathBuf,
    /// Revision used to key the retrieval index. Defaults to `bug_id`.
    #[serde(default)]
    pub revision: Option<String>,
    /// Source language for the index. Defaults to the configured language.
    #[serde(default)]
    pub language: Option<String>,
    /// Tests known to fail on the unfixed bug, when the benchmark lists them.
    #[serde(default)]
    pub trigger_tests: Vec<String>,
}

impl BugInstance {
    pub fn new(
        benchmark: impl Into<String>,
        project_id: impl Into<String>,
        bug_id: impl Into<String>,
        working_copy_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            benchmark: benchmark.into(),
            project_id: project_id.into(),
            bug_id: bug_id.into(),
            working_copy_path: working_copy_path.into(),
            revision: None,
            language: None,
            trigger_tests: Vec::new(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_trigger_tests(mut self, tests: Vec<String>) -> Self {
        self.trigger_tests = tests;
        self
    }

    pub fn revision(&self) -> &str {
        self.revision.as_deref().unwrap_or(&self.bug_id)
    }

    /// `benchmark/project-bug`, used in logs.
    pub fn label(&self) -> String {
        format!("{}/{}-{}", self.benchmark, self.project_id, self.bug_id)
    }
}

impl fmt::Display for BugInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
}

/// Per-test results of one oracle test run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub results: BTreeMap<String, TestStatus>,
    pub raw_output: String,
}

impl TestReport {
    pub fn new(results: BTreeMap<String, TestStatus>, raw_output: impl Into<String>) -> Self {
        Self {
            results,
            raw_output: raw_output.into(),
        }
    }

    /// Convenience constructor for adapters and tests.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, TestStatus)>,
        S: Into<String>,
    {
        Self {
            results: pairs.into_iter().map(|(name, s)| (name.into(), s)).collect(),
            raw_output: String::new(),
        }
    }

    /// True when at least one test ran and none failed.
    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|s| *s == TestStatus::Pass)
    }

    pub fn failing(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, s)| **s == TestStatus::Fail)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn passing(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, s)| **s == TestStatus::Pass)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileReport {
    pub passed: bool,
    pub diagnostics: String,
}

impl CompileReport {
    pub fn passed() -> Self {
        Self {
            passed: true,
            diagnostics: String::new(),
        }
    }

    pub fn failed(diagnostics: impl Into<String>) -> Self {
        Self {
            passed: false,
            diagnostics: diagnostics.into(),
        }
    }
}

/// Per-benchmark build/test driver.
///
/// `checkout` must be idempotent: calling it on an existing working copy
/// is either a no-op or a safe refresh.
#[async_trait]
pub trait OracleAdapter: Send + Sync {
    async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError>;

    async fn run_trigger_tests(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError>;

    async fn run_relevant_tests(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError>;

    async fn run_full_suite(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError>;

    async fn compile(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<CompileReport, OracleError>;
}

/// How many times each oracle step was invoked during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleCounters {
    pub checkouts: u32,
    pub trigger_runs: u32,
    pub relevant_runs: u32,
    pub full_suite_runs: u32,
    pub compiles: u32,
}

impl OracleCounters {
    pub fn total(&self) -> u32 {
        self.checkouts + self.trigger_runs + self.relevant_runs + self.full_suite_runs + self.compiles
    }
}

#[derive(Debug, Default)]
struct AtomicCounters {
    checkouts: AtomicU32,
    trigger_runs: AtomicU32,
    relevant_runs: AtomicU32,
    full_suite_runs: AtomicU32,
    compiles: AtomicU32,
}

/// Deadline + retry + accounting around an [`OracleAdapter`].
#[derive(Clone)]
pub struct GuardedOracle {
    adapter: Arc<dyn OracleAdapter>,
    retry: RetryPolicy,
    timeout: Duration,
    counters: Arc<AtomicCounters>,
}

impl GuardedOracle {
    pub fn new(adapter: Arc<dyn OracleAdapter>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            adapter,
            retry,
            timeout,
            counters: Arc::new(AtomicCounters::default()),
        }
    }

    pub fn counters(&self) -> OracleCounters {
        OracleCounters {
            checkouts: self.counters.checkouts.load(Ordering::Relaxed),
            trigger_runs: self.counters.trigger_runs.load(Ordering::Relaxed),
            relevant_runs: self.counters.relevant_runs.load(Ordering::Relaxed),
            full_suite_runs: self.counters.full_suite_runs.load(Ordering::Relaxed),
            compiles: self.counters.compiles.load(Ordering::Relaxed),
        }
    }

    async fn guarded<T, F, Fut>(&self, step: &'static str, op: F) -> Result<T, OracleError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OracleError>>,
    {
        let timeout = self.timeout;
        retry_transient(&self.retry, step, || {
            let fut = op();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(OracleError::Timeout {
                        step: step.to_string(),
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        })
        .await
    }

    pub async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError> {
        self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
        self.guarded("checkout", || self.adapter.checkout(bug)).await
    }

    pub async fn run_trigger_tests(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        self.counters.trigger_runs.fetch_add(1, Ordering::Relaxed);
        self.guarded("trigger_tests", || self.adapter.run_trigger_tests(bug, working_copy))
            .await
    }

    pub async fn run_relevant_tests(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        self.counters.relevant_runs.fetch_add(1, Ordering::Relaxed);
        self.guarded("relevant_tests", || self.adapter.run_relevant_tests(bug, working_copy))
            .await
    }

    pub async fn run_full_suite(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        self.counters.full_suite_runs.fetch_add(1, Ordering::Relaxed);
        self.guarded("full_suite", || self.adapter.run_full_suite(bug, working_copy))
            .await
    }

    pub async fn compile(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<CompileReport, OracleError> {
        self.counters.compiles.fetch_add(1, Ordering::Relaxed);
        self.guarded("compile", || self.adapter.compile(bug, working_copy)).await
    }
}

impl fmt::Debug for GuardedOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedOracle")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("counters", &self.counters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FlakyOracle {
        failures_left: Mutex<u32>,
        slow: bool,
    }

    #[async_trait]
    impl OracleAdapter for FlakyOracle {
        async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError> {
            Ok(bug.working_copy_path.clone())
        }

        async fn run_trigger_tests(
            &self,
            _bug: &BugInstance,
            _working_copy: &Path,
        ) -> Result<TestReport, OracleError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(OracleError::Transient("runner unavailable".to_string()));
                }
            }
            Ok(TestReport::from_pairs([("T1", TestStatus::Fail)]))
        }

        async fn run_relevant_tests(
            &self,
            _bug: &BugInstance,
            _working_copy: &Path,
        ) -> Result<TestReport, OracleError> {
            Err(OracleError::Fatal("no relevant tests".to_string()))
        }

        async fn run_full_suite(
            &self,
            _bug: &BugInstance,
            _working_copy: &Path,
        ) -> Result<TestReport, OracleError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(TestReport::default())
        }

        async fn compile(
            &self,
            _bug: &BugInstance,
            _working_copy: &Path,
        ) -> Result<CompileReport, OracleError> {
            Ok(CompileReport::passed())
        }
    }

    fn guarded(failures: u32, slow: bool) -> GuardedOracle {
        let adapter = FlakyOracle {
            failures_left: Mutex::new(failures),
            slow,
        };
        GuardedOracle::new(
            Arc::new(adapter),
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
            Duration::from_millis(50),
        )
    }

    fn bug() -> BugInstance {
        BugInstance::new("d4j", "Lang", "1", "/tmp/lang-1")
    }

    #[test]
    fn test_report_helpers() {
        let report = TestReport::from_pairs([
            ("a", TestStatus::Pass),
            ("b", TestStatus::Fail),
            ("c", TestStatus::Pass),
        ]);
        assert!(!report.all_passed());
        assert_eq!(report.failing(), vec!["b"]);
        assert_eq!(report.passing(), vec!["a", "c"]);
        assert!(!TestReport::default().all_passed());
    }

    #[test]
    fn test_bug_instance_defaults() {
        let bug = bug();
        assert_eq!(bug.revision(), "1");
        assert_eq!(bug.with_revision("abc123").revision(), "abc123");

        let parsed: BugInstance = serde_json::from_str(
            r#"{"benchmark":"d4j","project_id":"Lang","bug_id":"1","working_copy_path":"/w"}"#,
        )
        .unwrap();
        assert!(parsed.trigger_tests.is_empty());
        assert_eq!(parsed.label(), "d4j/Lang-1");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let oracle = guarded(2, false);
        let report = oracle.run_trigger_tests(&bug(), Path::new("/tmp")).await.unwrap();
        assert_eq!(report.failing(), vec!["T1"]);
        assert_eq!(oracle.counters().trigger_runs, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_escalate() {
        let oracle = guarded(5, false);
        let err = oracle
            .run_trigger_tests(&bug(), Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Transient(_)));
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let oracle = guarded(0, false);
        let err = oracle
            .run_relevant_tests(&bug(), Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_deadline_maps_to_timeout() {
        let oracle = guarded(0, true);
        let err = oracle
            .run_full_suite(&bug(), Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Timeout { ref step, .. } if step == "full_suite"));
        assert_eq!(oracle.counters().full_suite_runs, 1);
        assert_eq!(oracle.counters().total(), 1);
    }
}
