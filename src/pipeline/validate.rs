//! Gate execution against the oracle.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{GateStep, StepRecord, Verdict};
use crate::error::{OracleError, PipelineError};
use crate::oracle::{BugInstance, GuardedOracle, TestReport, TestStatus};
use crate::patch::{AppliedPatch, ApplyResult, PatchStage, ProposedEdit};
use crate::policy::GatePolicy;

/// Result of the pre-patch RED check.
#[derive(Debug, Clone)]
pub struct RedCheck {
    pub report: TestReport,
    /// True when at least one trigger test failed, i.e. the bug reproduces.
    pub confirmed: bool,
    pub step: StepRecord,
}

/// Everything one validation produced.
#[derive(Debug)]
pub struct ValidationReport {
    pub verdict: Verdict,
    pub steps: Vec<StepRecord>,
    pub canonical_patch: Option<String>,
    pub fingerprint: Option<String>,
    pub touched_files: Vec<String>,
    /// Present when the patch is still on disk; the caller decides whether
    /// to keep it (green) or roll it back.
    pub applied: Option<AppliedPatch>,
    /// Oracle output explaining a negative verdict.
    pub failure_output: String,
}

impl ValidationReport {
    fn new(verdict: Verdict, steps: Vec<StepRecord>) -> Self {
        Self {
            verdict,
            steps,
            canonical_patch: None,
            fingerprint: None,
            touched_files: Vec::new(),
            applied: None,
            failure_output: String::new(),
        }
    }
}

/// Runs the gated validation steps for one bug.
pub struct ValidationPipeline<'a> {
    oracle: &'a GuardedOracle,
    policy: GatePolicy,
    bug: &'a BugInstance,
    /// Names of the trigger tests, from the bug and the RED check.
    trigger_tests: BTreeSet<String>,
}

impl<'a> ValidationPipeline<'a> {
    pub fn new(oracle: &'a GuardedOracle, policy: GatePolicy, bug: &'a BugInstance) -> Self {
        Self {
            oracle,
            policy,
            bug,
            trigger_tests: bug.trigger_tests.iter().cloned().collect(),
        }
    }

    /// Also treat the tests failing in `report` as trigger tests.
    pub fn learn_trigger_tests(&mut self, report: &TestReport) {
        self.trigger_tests
            .extend(report.failing().into_iter().map(String::from));
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    /// Step 1: trigger tests must fail before any patch.
    pub async fn red_check(&self) -> Result<RedCheck, OracleError> {
        let started = Instant::now();
        let report = self
            .oracle
            .run_trigger_tests(self.bug, &self.bug.working_copy_path)
            .await?;
        let confirmed = !report.all_passed();
        info!(bug = %self.bug, confirmed, failing = report.failing().len(), "RED check");
        let step = record(
            GateStep::RedCheck,
            confirmed,
            started,
            (!confirmed).then(|| "trigger tests already pass on the unpatched copy".to_string()),
        );
        Ok(RedCheck {
            report,
            confirmed,
            step,
        })
    }

    /// Relevant-test results on the unpatched working copy.
    pub async fn capture_baseline(&self) -> Result<TestReport, OracleError> {
        let report = self
            .oracle
            .run_relevant_tests(self.bug, &self.bug.working_copy_path)
            .await?;
        debug!(
            bug = %self.bug,
            passing = report.passing().len(),
            failing = report.failing().len(),
            "Captured relevant-test baseline"
        );
        Ok(report)
    }

    /// Steps 2-5 for one proposal.
    ///
    /// A green patch stays applied; for every other verdict the working copy
    /// is either untouched (not applicable, compile failure) or still holds
    /// the patch in `applied` for the caller to roll back.
    pub async fn validate(
        &self,
        stage: &PatchStage,
        proposal: &ProposedEdit,
        baseline: &TestReport,
    ) -> Result<ValidationReport, PipelineError> {
        let mut steps = Vec::new();
        let started = Instant::now();
        let gate = self.policy.compile_gate.then_some((self.oracle, self.bug));

        let applied = match stage.apply_proposed(proposal, gate).await? {
            ApplyResult::NotApplicable { reason } => {
                info!(bug = %self.bug, reason = %reason, "Patch not applicable");
                steps.push(record(GateStep::Apply, false, started, Some(reason.clone())));
                let mut report = ValidationReport::new(Verdict::PatchNotApplicable, steps);
                report.failure_output = reason;
                return Ok(report);
            }
            ApplyResult::CompileFailed {
                canonical,
                fingerprint,
                diagnostics,
            } => {
                steps.push(record(GateStep::Apply, true, started, None));
                steps.push(record(GateStep::CompileGate, false, started, None));
                let mut report = ValidationReport::new(Verdict::CompileFailed, steps);
                report.canonical_patch = Some(canonical);
                report.fingerprint = Some(fingerprint);
                report.failure_output = diagnostics;
                return Ok(report);
            }
            ApplyResult::Applied(applied) => applied,
        };
        steps.push(record(GateStep::Apply, true, started, None));
        if self.policy.compile_gate {
            steps.push(record(GateStep::CompileGate, true, started, None));
        }

        let checks = self.post_apply_checks(baseline, &mut steps).await;
        let (verdict, failure_output) = match checks {
            Ok(result) => result,
            Err(e) => {
                // Leave the working copy clean before surfacing the failure.
                if let Err(io) = stage.rollback(&applied.snapshot) {
                    warn!(error = %io, "Rollback after oracle failure failed");
                }
                return Err(e.into());
            }
        };

        let mut report = ValidationReport::new(verdict, steps);
        report.canonical_patch = Some(applied.canonical.clone());
        report.fingerprint = Some(applied.fingerprint.clone());
        report.touched_files = applied.touched_files.clone();
        report.applied = Some(applied);
        report.failure_output = failure_output;
        Ok(report)
    }

    /// Steps 4-5 on the unpatched copy (`max_iters = 0`).
    pub async fn verify_only(&self, baseline: &TestReport) -> Result<ValidationReport, PipelineError> {
        let mut steps = Vec::new();
        let (verdict, failure_output) = self.regression_and_suite(baseline, &mut steps).await?;
        let mut report = ValidationReport::new(verdict, steps);
        report.failure_output = failure_output;
        Ok(report)
    }

    async fn post_apply_checks(
        &self,
        baseline: &TestReport,
        steps: &mut Vec<StepRecord>,
    ) -> Result<(Verdict, String), OracleError> {
        if self.policy.tdd_gate {
            let started = Instant::now();
            let green = self
                .oracle
                .run_trigger_tests(self.bug, &self.bug.working_copy_path)
                .await?;
            let passed = green.all_passed();
            steps.push(record(
                GateStep::GreenCheck,
                passed,
                started,
                (!passed).then(|| green.failing().join(", ")),
            ));
            if !passed {
                info!(bug = %self.bug, "GREEN check failed");
                return Ok((Verdict::RedConfirmed, green.raw_output));
            }
        }
        self.regression_and_suite(baseline, steps).await
    }

    async fn regression_and_suite(
        &self,
        baseline: &TestReport,
        steps: &mut Vec<StepRecord>,
    ) -> Result<(Verdict, String), OracleError> {
        let started = Instant::now();
        let relevant = self
            .oracle
            .run_relevant_tests(self.bug, &self.bug.working_copy_path)
            .await?;
        let regressions = newly_failing(baseline, &relevant);
        steps.push(record(
            GateStep::RegressionCheck,
            regressions.is_empty(),
            started,
            (!regressions.is_empty()).then(|| regressions.join(", ")),
        ));
        if !regressions.is_empty() {
            info!(bug = %self.bug, regressions = ?regressions, "Regression detected");
            return Ok((Verdict::RegressionDetected, relevant.raw_output));
        }

        let started = Instant::now();
        let suite = self
            .oracle
            .run_full_suite(self.bug, &self.bug.working_copy_path)
            .await?;
        if suite.all_passed() {
            steps.push(record(GateStep::FullSuite, true, started, None));
            info!(bug = %self.bug, tests = suite.results.len(), "Full suite green");
            return Ok((Verdict::Green, String::new()));
        }

        let failing = suite.failing();
        let trigger_failing = failing.iter().any(|name| self.is_trigger_test(name));
        steps.push(record(GateStep::FullSuite, false, started, Some(failing.join(", "))));
        let verdict = if trigger_failing {
            Verdict::RedConfirmed
        } else {
            Verdict::RegressionDetected
        };
        info!(bug = %self.bug, verdict = %verdict, failing = failing.len(), "Full suite failed");
        Ok((verdict, suite.raw_output))
    }

    fn is_trigger_test(&self, name: &str) -> bool {
        let name = canonical_test_name(name);
        self.trigger_tests.iter().any(|t| {
            let t = canonical_test_name(t);
            t == name || t.ends_with(&format!(".{name}")) || name.ends_with(&format!(".{t}"))
        })
    }
}

/// Tests that passed in `baseline` and fail in `current`.
fn newly_failing(baseline: &TestReport, current: &TestReport) -> Vec<String> {
    current
        .results
        .iter()
        .filter(|(name, status)| {
            **status == TestStatus::Fail && baseline.results.get(*name) == Some(&TestStatus::Pass)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// `Class::method`, `Class#method` and `Class.method` name the same test.
fn canonical_test_name(name: &str) -> String {
    name.trim().replace("::", ".").replace('#', ".")
}

fn record(step: GateStep, passed: bool, started: Instant, detail: Option<String>) -> StepRecord {
    StepRecord {
        step,
        passed,
        elapsed_ms: started.elapsed().as_millis() as u64,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::oracle::{CompileReport, OracleAdapter};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const BUGGY: &str = "def add(a, b):\n    return a - b\n";
    const FIXED: &str = "def add(a, b):\n    return a + b\n";
    const FIX: &str = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n";
    const BREAK: &str = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a * b\n";

    /// Oracle that derives test results from the contents of calc.py.
    struct FileOracle {
        calls: Mutex<Vec<&'static str>>,
    }

    impl FileOracle {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn report(&self, step: &'static str, wc: &Path) -> TestReport {
            self.calls.lock().unwrap().push(step);
            let source = std::fs::read_to_string(wc.join("calc.py")).unwrap_or_default();
            let add_ok = source.contains("a + b");
            let other_ok = !source.contains("a * b");
            let status = |ok: bool| if ok { TestStatus::Pass } else { TestStatus::Fail };
            let mut report = match step {
                "trigger" => TestReport::from_pairs([("CalcTest::test_add", status(add_ok))]),
                _ => TestReport::from_pairs([
                    ("CalcTest.test_add", status(add_ok)),
                    ("CalcTest.test_other", status(other_ok)),
                ]),
            };
            report.raw_output = format!("{step} output");
            report
        }
    }

    #[async_trait]
    impl OracleAdapter for FileOracle {
        async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError> {
            Ok(bug.working_copy_path.clone())
        }
        async fn run_trigger_tests(&self, _: &BugInstance, wc: &Path) -> Result<TestReport, OracleError> {
            Ok(self.report("trigger", wc))
        }
        async fn run_relevant_tests(&self, _: &BugInstance, wc: &Path) -> Result<TestReport, OracleError> {
            Ok(self.report("relevant", wc))
        }
        async fn run_full_suite(&self, _: &BugInstance, wc: &Path) -> Result<TestReport, OracleError> {
            Ok(self.report("full", wc))
        }
        async fn compile(&self, _: &BugInstance, _: &Path) -> Result<CompileReport, OracleError> {
            self.calls.lock().unwrap().push("compile");
            Ok(CompileReport::passed())
        }
    }

    fn setup(oracle: Arc<FileOracle>) -> (TempDir, BugInstance, GuardedOracle) {
        let wc = TempDir::new().unwrap();
        std::fs::write(wc.path().join("calc.py"), BUGGY).unwrap();
        let bug = BugInstance::new("bench", "calc", "1", wc.path())
            .with_trigger_tests(vec!["CalcTest::test_add".to_string()]);
        let guarded = GuardedOracle::new(oracle, RetryPolicy::default(), Duration::from_secs(5));
        (wc, bug, guarded)
    }

    fn diff(text: &str) -> ProposedEdit {
        ProposedEdit::Diff {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_policy_green() {
        let oracle = Arc::new(FileOracle::new());
        let (wc, bug, guarded) = setup(oracle.clone());
        let pipeline = ValidationPipeline::new(&guarded, GatePolicy::full(), &bug);

        let red = pipeline.red_check().await.unwrap();
        assert!(red.confirmed);
        let baseline = pipeline.capture_baseline().await.unwrap();

        let stage = PatchStage::new(wc.path());
        let report = pipeline.validate(&stage, &diff(FIX), &baseline).await.unwrap();
        assert_eq!(report.verdict, Verdict::Green);
        assert!(report.applied.is_some());
        assert_eq!(std::fs::read_to_string(wc.path().join("calc.py")).unwrap(), FIXED);
        assert_eq!(
            oracle.calls(),
            vec!["trigger", "relevant", "compile", "trigger", "relevant", "full"]
        );
        let steps: Vec<GateStep> = report.steps.iter().map(|s| s.step).collect();
        assert_eq!(
            steps,
            vec![
                GateStep::Apply,
                GateStep::CompileGate,
                GateStep::GreenCheck,
                GateStep::RegressionCheck,
                GateStep::FullSuite
            ]
        );
    }

    #[tokio::test]
    async fn test_baseline_policy_runs_no_gated_steps() {
        let oracle = Arc::new(FileOracle::new());
        let (wc, bug, guarded) = setup(oracle.clone());
        let pipeline = ValidationPipeline::new(&guarded, GatePolicy::baseline(), &bug);
        let baseline = pipeline.capture_baseline().await.unwrap();

        let stage = PatchStage::new(wc.path());
        let report = pipeline.validate(&stage, &diff(FIX), &baseline).await.unwrap();
        assert_eq!(report.verdict, Verdict::Green);
        assert_eq!(oracle.calls(), vec!["relevant", "relevant", "full"]);
        assert_eq!(guarded.counters().trigger_runs, 0);
        assert_eq!(guarded.counters().compiles, 0);
    }

    #[tokio::test]
    async fn test_regression_detected_against_baseline() {
        let oracle = Arc::new(FileOracle::new());
        let (wc, bug, guarded) = setup(oracle.clone());
        let pipeline = ValidationPipeline::new(&guarded, GatePolicy::baseline(), &bug);
        let baseline = pipeline.capture_baseline().await.unwrap();

        let stage = PatchStage::new(wc.path());
        let report = pipeline.validate(&stage, &diff(BREAK), &baseline).await.unwrap();
        assert_eq!(report.verdict, Verdict::RegressionDetected);
        assert_eq!(report.failure_output, "relevant output");
        // The full suite is skipped after a negative verdict.
        assert_eq!(oracle.calls(), vec!["relevant", "relevant"]);
        assert!(report.applied.is_some());
    }

    #[tokio::test]
    async fn test_green_check_failure_is_red_confirmed() {
        let oracle = Arc::new(FileOracle::new());
        let (wc, bug, guarded) = setup(oracle.clone());
        let pipeline = ValidationPipeline::new(&guarded, GatePolicy::new(true, false, false), &bug);
        let baseline = pipeline.capture_baseline().await.unwrap();

        // Applies cleanly but leaves the bug in place.
        let noop = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,3 @@\n def add(a, b):\n+    # checked\n     return a - b\n";
        let stage = PatchStage::new(wc.path());
        let report = pipeline.validate(&stage, &diff(noop), &baseline).await.unwrap();
        assert_eq!(report.verdict, Verdict::RedConfirmed);
        assert_eq!(report.steps.last().unwrap().step, GateStep::GreenCheck);
    }

    #[tokio::test]
    async fn test_full_suite_failure_with_trigger_is_red_confirmed() {
        let oracle = Arc::new(FileOracle::new());
        let (_wc, bug, guarded) = setup(oracle.clone());
        let pipeline = ValidationPipeline::new(&guarded, GatePolicy::baseline(), &bug);
        let baseline = pipeline.capture_baseline().await.unwrap();

        // Unpatched: test_add fails in both baseline and suite.
        let report = pipeline.verify_only(&baseline).await.unwrap();
        assert_eq!(report.verdict, Verdict::RedConfirmed);
        assert_eq!(report.failure_output, "full output");
    }

    #[tokio::test]
    async fn test_not_applicable_touches_nothing() {
        let oracle = Arc::new(FileOracle::new());
        let (wc, bug, guarded) = setup(oracle.clone());
        let pipeline = ValidationPipeline::new(&guarded, GatePolicy::full(), &bug);
        let baseline = TestReport::default();

        let stale = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def mul(a, b):\n-    return a / b\n+    return a * b\n";
        let stage = PatchStage::new(wc.path());
        let report = pipeline.validate(&stage, &diff(stale), &baseline).await.unwrap();
        assert_eq!(report.verdict, Verdict::PatchNotApplicable);
        assert!(oracle.calls().is_empty());
        assert_eq!(std::fs::read_to_string(wc.path().join("calc.py")).unwrap(), BUGGY);
    }

    #[test]
    fn test_trigger_name_matching() {
        let oracle = GuardedOracle::new(
            Arc::new(FileOracle::new()),
            RetryPolicy::default(),
            Duration::from_secs(1),
        );
        let bug = BugInstance::new("b", "p", "1", "/tmp")
            .with_trigger_tests(vec!["org.FooTest::testBar".to_string()]);
        let mut pipeline = ValidationPipeline::new(&oracle, GatePolicy::baseline(), &bug);
        assert!(pipeline.is_trigger_test("org.FooTest.testBar"));
        assert!(pipeline.is_trigger_test("FooTest#testBar"));
        assert!(!pipeline.is_trigger_test("org.FooTest.testBaz"));

        pipeline.learn_trigger_tests(&TestReport::from_pairs([("org.X.y", TestStatus::Fail)]));
        assert!(pipeline.is_trigger_test("org.X.y"));
    }
}
