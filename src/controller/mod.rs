//! Iteration controller: takes one bug from setup to a recorded outcome.
//!
//! ```text
//! INIT -> LOCALIZE -> REASON_AND_PATCH -> VALIDATE -> ACCEPT
//!            ^                                |
//!            +------------ RETRY <------------+
//!                            |
//!                            +--> ABANDON (budget used up, fatal error,
//!                                          timeout, cancellation)
//! ```
//!
//! INIT locks and checks out the working copy, loads the retrieval index
//! when the policy asks for it, captures the relevant-test baseline and runs
//! the RED check. Localization context carries over between iterations; the
//! tool-call history does not.

mod run;
mod state;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{PromptSet, ReasoningSession, SessionConfig, ToolRegistry};
use crate::config::RepairConfig;
use crate::error::OracleError;
use crate::index::{IndexBuilder, IndexHandle};
use crate::llm::LlmProvider;
use crate::localize::{seed_from_output, LocalizationContext};
use crate::oracle::{BugInstance, GuardedOracle, OracleAdapter};
use crate::patch::WorkingCopyLock;
use crate::pipeline::{ValidationPipeline, Verdict};
use crate::policy::VariantSpec;
use crate::recorder::{Outcome, ResultStore};

use run::{elapsed_ms, Run, Tracker};
use state::{RunState, Terminal};

pub use state::CancelFlag;

/// Runs the repair loop for one variant against any number of bugs.
#[derive(Clone)]
pub struct IterationController {
    config: RepairConfig,
    variant: VariantSpec,
    oracle: Arc<dyn OracleAdapter>,
    llm: Arc<dyn LlmProvider>,
    store: Option<Arc<dyn ResultStore>>,
    cancel: CancelFlag,
}

impl IterationController {
    pub fn new(
        config: RepairConfig,
        variant: VariantSpec,
        oracle: Arc<dyn OracleAdapter>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            config,
            variant,
            oracle,
            llm,
            store: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Append every outcome to `store`.
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    pub fn variant(&self) -> &VariantSpec {
        &self.variant
    }

    /// Repair one bug. Every path, including setup failures and timeouts,
    /// ends in an [`Outcome`].
    pub async fn run(&self, bug: &BugInstance) -> Outcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let oracle = GuardedOracle::new(
            self.oracle.clone(),
            self.config.retry.clone(),
            self.config.oracle_timeout(),
        );
        let mut tracker = Tracker::default();

        info!(
            bug = %bug,
            variant = %self.variant.name,
            run_id = %run_id,
            max_iters = self.config.max_iters,
            "Starting repair run"
        );

        let terminal = match self.config.run_timeout_secs {
            Some(secs) => {
                let result = tokio::time::timeout(
                    Duration::from_secs(secs),
                    self.drive(bug, &oracle, &mut tracker),
                )
                .await;
                result.unwrap_or_else(|_| {
                    warn!(bug = %bug, seconds = secs, "Run deadline exceeded");
                    Terminal::abort(Verdict::Timeout, format!("run exceeded {secs}s"))
                })
            }
            None => self.drive(bug, &oracle, &mut tracker).await,
        };

        tracker.restore_pending();
        tracker.abort_iteration(terminal.verdict);
        tracker.locks.clear();

        let mut counters = tracker.counters;
        counters.oracle = oracle.counters();
        let mut timings = tracker.timings;
        timings.total_ms = elapsed_ms(started);

        let outcome = Outcome {
            run_id,
            benchmark: bug.benchmark.clone(),
            project_id: bug.project_id.clone(),
            bug_id: bug.bug_id.clone(),
            model: self.config.model.clone(),
            variant: self.variant.name.clone(),
            gate_policy: self.variant.policy,
            fixed: terminal.fixed,
            iterations_used: tracker.iterations.len() as u32,
            terminal_verdict: terminal.verdict,
            elapsed_ms: timings.total_ms,
            timings,
            counters,
            final_patch: if terminal.fixed { tracker.final_patch } else { None },
            error: terminal.error,
            stop_reason: terminal.stop_reason,
            setup_steps: tracker.setup_steps,
            iterations: tracker.iterations,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            bug = %bug,
            fixed = outcome.fixed,
            iterations = outcome.iterations_used,
            verdict = %outcome.terminal_verdict,
            elapsed_ms = outcome.elapsed_ms,
            "Repair run finished"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.append(&outcome).await {
                error!(bug = %bug, error = %e, "Failed to record outcome");
            }
        }
        outcome
    }

    async fn drive(&self, bug: &BugInstance, oracle: &GuardedOracle, tracker: &mut Tracker) -> Terminal {
        if self.cancel.is_cancelled() {
            return Terminal::cancelled();
        }
        let setup_started = Instant::now();

        match WorkingCopyLock::acquire(&bug.working_copy_path) {
            Ok(lock) => tracker.locks.push(lock),
            Err(e) => return Terminal::abort(Verdict::SetupError, e.to_string()),
        }
        let working_copy = match oracle.checkout(bug).await {
            Ok(path) => path,
            Err(e) => {
                warn!(bug = %bug, error = %e, "Checkout failed");
                return match e {
                    OracleError::Timeout { .. } => Terminal::from_oracle(&e),
                    _ => Terminal::abort(Verdict::SetupError, e.to_string()),
                };
            }
        };
        if working_copy != bug.working_copy_path {
            match WorkingCopyLock::acquire(&working_copy) {
                Ok(lock) => tracker.locks.push(lock),
                Err(e) => return Terminal::abort(Verdict::SetupError, e.to_string()),
            }
        }
        let mut bug = bug.clone();
        bug.working_copy_path = working_copy;

        let prepared = self.prepare(&bug, oracle, tracker).await;
        tracker.timings.setup_ms = elapsed_ms(setup_started);
        let mut run = match prepared {
            Ok(run) => run,
            Err(terminal) => return terminal,
        };

        if self.config.max_iters == 0 {
            if self.cancel.is_cancelled() {
                return Terminal::cancelled();
            }
            return run.verify_only(tracker).await;
        }
        self.iterate(&mut run, tracker).await
    }

    /// INIT after checkout: index, baseline, RED check and seeding.
    async fn prepare<'a>(
        &'a self,
        bug: &'a BugInstance,
        oracle: &'a GuardedOracle,
        tracker: &mut Tracker,
    ) -> Result<Run<'a>, Terminal> {
        let policy = self.variant.policy;
        let limits = self
            .variant
            .session
            .clone()
            .unwrap_or_else(|| self.config.session.clone());

        let index = if policy.index_retrieval {
            self.load_index(bug).await?
        } else {
            None
        };

        let mut pipeline = ValidationPipeline::new(oracle, policy, bug);
        let baseline = pipeline
            .capture_baseline()
            .await
            .map_err(|e| Terminal::from_oracle(&e))?;

        let failing_output = if policy.tdd_gate {
            let red = pipeline
                .red_check()
                .await
                .map_err(|e| Terminal::from_oracle(&e))?;
            tracker.setup_steps.push(red.step.clone());
            if !red.confirmed {
                warn!(bug = %bug, "Trigger tests already pass, nothing to repair");
                return Err(Terminal::abort(
                    Verdict::SetupError,
                    "trigger tests pass on the unpatched working copy",
                ));
            }
            pipeline.learn_trigger_tests(&red.report);
            red.report.raw_output
        } else {
            baseline.raw_output.clone()
        };

        let mut context = LocalizationContext::new();
        let seeded = context.extend(seed_from_output(&failing_output, &bug.working_copy_path));
        debug!(bug = %bug, seeded, "Seeded localization context from failing output");

        let prompts = PromptSet::with_overrides(&self.variant.prompts);
        let registry = ToolRegistry::for_policy(index.is_some());
        let session = ReasoningSession::new(
            self.llm.clone(),
            registry,
            prompts.clone(),
            SessionConfig::from_repair_config(&self.config, limits.clone()),
        );

        Ok(Run::new(
            bug,
            &self.config,
            pipeline,
            session,
            prompts,
            limits,
            index,
            context,
            baseline,
            failing_output,
        ))
    }

    async fn load_index(&self, bug: &BugInstance) -> Result<Option<IndexHandle>, Terminal> {
        let builder = IndexBuilder::new(self.config.index_dir.clone());
        let working_copy = bug.working_copy_path.clone();
        let benchmark = bug.benchmark.clone();
        let project_id = bug.project_id.clone();
        let revision = bug.revision().to_string();
        let language = bug
            .language
            .clone()
            .unwrap_or_else(|| self.config.default_language.clone());
        let force = self.config.force_index_rebuild;

        let built = tokio::task::spawn_blocking(move || {
            builder.build(&working_copy, &benchmark, &project_id, &revision, &language, force)
        })
        .await;

        let message = match built {
            Ok(Ok(handle)) => {
                info!(
                    bug = %bug,
                    cached = handle.cached,
                    symbols = handle.index.symbol_count(),
                    "Retrieval index ready"
                );
                return Ok(Some(handle));
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        if self.config.fallback_on_index_failure {
            warn!(bug = %bug, error = %message, "Index build failed, falling back to text search");
            Ok(None)
        } else {
            error!(bug = %bug, error = %message, "Index build failed");
            Err(Terminal::abort(
                Verdict::FatalError,
                format!("index build failed: {message}"),
            ))
        }
    }

    async fn iterate(&self, run: &mut Run<'_>, tracker: &mut Tracker) -> Terminal {
        let mut state = RunState::Localize;
        loop {
            if self.cancel.is_cancelled() && !matches!(state, RunState::Accept | RunState::Abandon(_)) {
                info!(bug = %run.bug, iteration = run.iteration, "Run cancelled");
                state = RunState::Abandon(Terminal::cancelled());
            }
            debug!(bug = %run.bug, iteration = run.iteration, state = %state, "Controller state");

            state = match state {
                RunState::Localize => run.localize(tracker),
                RunState::ReasonAndPatch { task, ctx } => {
                    run.reason_and_patch(&task, &ctx, tracker).await
                }
                RunState::Validate { candidates } => run.validate(candidates, tracker).await,
                RunState::Retry { verdict } => {
                    if run.iteration >= self.config.max_iters {
                        info!(
                            bug = %run.bug,
                            iterations = run.iteration,
                            verdict = %verdict,
                            "Iteration budget exhausted"
                        );
                        return Terminal::exhausted(verdict);
                    }
                    RunState::Localize
                }
                RunState::Accept => return Terminal::accepted(),
                RunState::Abandon(terminal) => return terminal,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationRequest, GenerationResponse, Message, Usage};
    use crate::oracle::{CompileReport, TestReport, TestStatus};
    use crate::recorder::MemoryResultStore;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const BUGGY: &str = "def add(a, b):\n    return a - b\n";
    const FIX: &str = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n";
    const WRONG: &str = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return b - a\n";

    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
        calls: Mutex<u32>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, _: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            *self.calls.lock().unwrap() += 1;
            let content = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| r#"{"tool": "no_patch", "arguments": {"reason": "out of ideas"}}"#.to_string());
            Ok(GenerationResponse {
                id: "test".to_string(),
                model: "test".to_string(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(content),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                },
            })
        }
    }

    /// Oracle whose test results follow the contents of calc.py.
    #[derive(Default)]
    struct CalcOracle {
        fail_relevant: bool,
        /// Check out somewhere other than the requested path.
        checkout_to: Option<PathBuf>,
    }

    impl CalcOracle {
        fn report(wc: &Path) -> TestReport {
            let source = std::fs::read_to_string(wc.join("calc.py")).unwrap_or_default();
            let status = if source.contains("a + b") {
                TestStatus::Pass
            } else {
                TestStatus::Fail
            };
            let mut report = TestReport::from_pairs([("test_calc.test_add", status)]);
            report.raw_output = "File \"calc.py\", line 2, in add\nAssertionError".to_string();
            report
        }
    }

    #[async_trait]
    impl OracleAdapter for CalcOracle {
        async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError> {
            Ok(self
                .checkout_to
                .clone()
                .unwrap_or_else(|| bug.working_copy_path.clone()))
        }
        async fn run_trigger_tests(&self, _: &BugInstance, wc: &Path) -> Result<TestReport, OracleError> {
            Ok(Self::report(wc))
        }
        async fn run_relevant_tests(&self, _: &BugInstance, wc: &Path) -> Result<TestReport, OracleError> {
            if self.fail_relevant {
                return Err(OracleError::Fatal("test runner missing".to_string()));
            }
            Ok(Self::report(wc))
        }
        async fn run_full_suite(&self, _: &BugInstance, wc: &Path) -> Result<TestReport, OracleError> {
            Ok(Self::report(wc))
        }
        async fn compile(&self, _: &BugInstance, _: &Path) -> Result<CompileReport, OracleError> {
            Ok(CompileReport::passed())
        }
    }

    fn propose(diff: &str) -> String {
        serde_json::json!({"tool": "propose_patch", "arguments": {"diff": diff}}).to_string()
    }

    fn controller(variant: &str, max_iters: u32, llm: Arc<ScriptedLlm>, oracle: CalcOracle) -> IterationController {
        let config = RepairConfig::default()
            .with_max_iters(max_iters)
            .with_retry(crate::config::RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 0,
            });
        IterationController::new(
            config,
            VariantSpec::builtin(variant).unwrap(),
            Arc::new(oracle),
            llm,
        )
    }

    fn bug(dir: &TempDir) -> BugInstance {
        let wc = dir.path().join("calc");
        std::fs::create_dir_all(&wc).unwrap();
        std::fs::write(wc.join("calc.py"), BUGGY).unwrap();
        BugInstance::new("bench", "calc", "1", wc).with_trigger_tests(vec!["test_calc.test_add".to_string()])
    }

    #[tokio::test]
    async fn test_repeated_patch_reuses_verdict() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let llm = Arc::new(ScriptedLlm::new(&[&propose(WRONG), &propose(WRONG), &propose(FIX)]));
        let store = Arc::new(MemoryResultStore::new());
        let controller = controller("G1", 3, llm.clone(), CalcOracle::default()).with_store(store.clone());

        let outcome = controller.run(&bug).await;
        assert!(outcome.fixed);
        assert_eq!(outcome.iterations_used, 3);
        assert_eq!(outcome.counters.duplicate_patches, 1);
        assert_eq!(outcome.iterations[1].duplicate_of, Some(1));
        assert_eq!(outcome.iterations[1].verdict, Verdict::RedConfirmed);
        // The repeat never reached the oracle: RED, GREEN x2, relevant x2, suite x1.
        assert_eq!(outcome.counters.oracle.trigger_runs, 3);
        assert_eq!(outcome.counters.oracle.full_suite_runs, 1);
        assert_eq!(outcome.counters.llm_turns, 3);
        assert_eq!(outcome.counters.prompt_tokens, 30);
        assert_eq!(store.outcomes().len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_context_reaches_iteration_record() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let llm = Arc::new(ScriptedLlm::new(&[&propose(FIX)]));
        let outcome = controller("G0", 1, llm, CalcOracle::default()).run(&bug).await;

        assert!(outcome.fixed);
        let spans = &outcome.iterations[0].localized_spans;
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].file, "calc.py");
        assert!(outcome.final_patch.unwrap().contains("+    return a + b"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let controller = controller("G5", 3, llm.clone(), CalcOracle::default());
        controller.cancel_flag().cancel();

        let outcome = controller.run(&bug).await;
        assert_eq!(outcome.terminal_verdict, Verdict::Cancelled);
        assert_eq!(outcome.iterations_used, 0);
        assert_eq!(outcome.counters.oracle.total(), 0);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_oracle_failure_is_fatal_outcome() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let llm = Arc::new(ScriptedLlm::new(&[]));
        let oracle = CalcOracle {
            fail_relevant: true,
            ..Default::default()
        };
        let outcome = controller("G0", 3, llm.clone(), oracle).run(&bug).await;

        assert_eq!(outcome.terminal_verdict, Verdict::FatalError);
        assert!(outcome.error.unwrap().contains("test runner missing"));
        assert_eq!(outcome.iterations_used, 0);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_locked_working_copy_is_setup_error() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let _held = WorkingCopyLock::acquire(&bug.working_copy_path).unwrap();
        let llm = Arc::new(ScriptedLlm::new(&[]));

        let outcome = controller("G0", 3, llm, CalcOracle::default()).run(&bug).await;
        assert_eq!(outcome.terminal_verdict, Verdict::SetupError);
        assert!(outcome.error.unwrap().contains("locked"));
    }

    #[tokio::test]
    async fn test_checked_out_path_is_locked_too() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let elsewhere = dir.path().join("checkouts").join("calc-1");
        std::fs::create_dir_all(&elsewhere).unwrap();
        std::fs::write(elsewhere.join("calc.py"), BUGGY).unwrap();
        let oracle = || CalcOracle {
            checkout_to: Some(elsewhere.clone()),
            ..Default::default()
        };

        let held = WorkingCopyLock::acquire(&elsewhere).unwrap();
        let llm = Arc::new(ScriptedLlm::new(&[&propose(FIX)]));
        let outcome = controller("G0", 1, llm.clone(), oracle()).run(&bug).await;
        assert_eq!(outcome.terminal_verdict, Verdict::SetupError);
        assert_eq!(llm.calls(), 0);

        drop(held);
        let outcome = controller("G0", 1, llm, oracle()).run(&bug).await;
        assert!(outcome.fixed, "{:?}", outcome.error);
        assert!(std::fs::read_to_string(elsewhere.join("calc.py")).unwrap().contains("a + b"));
        assert_eq!(std::fs::read_to_string(bug.working_copy_path.join("calc.py")).unwrap(), BUGGY);
        // Both locks were released with the run.
        let _again = WorkingCopyLock::acquire(&elsewhere).unwrap();
        let _requested = WorkingCopyLock::acquire(&bug.working_copy_path).unwrap();
    }

    #[tokio::test]
    async fn test_direct_patch_streak_stops_run_early() {
        let dir = TempDir::new().unwrap();
        let bug = bug(&dir);
        let llm = Arc::new(ScriptedLlm::new(&[&propose(WRONG), &propose(WRONG), &propose(FIX)]));
        let mut controller = controller("G0", 5, llm.clone(), CalcOracle::default());
        controller.config = controller.config.clone().with_max_consecutive_direct_patches(2);

        let outcome = controller.run(&bug).await;

        assert!(!outcome.fixed);
        assert_eq!(outcome.iterations_used, 2);
        assert_eq!(llm.calls(), 2);
        assert!(outcome.error.is_none());
        let reason = outcome.stop_reason.unwrap();
        assert!(reason.contains("without reading any code"), "{reason}");
        assert_eq!(std::fs::read_to_string(bug.working_copy_path.join("calc.py")).unwrap(), BUGGY);
    }

    #[tokio::test]
    async fn test_index_failure_falls_back_when_allowed() {
        let dir = TempDir::new().unwrap();
        let mut bug = bug(&dir);
        bug.language = Some("cobol".to_string());
        let llm = Arc::new(ScriptedLlm::new(&[&propose(FIX)]));

        let strict = controller("G2", 1, llm.clone(), CalcOracle::default());
        let outcome = strict.run(&bug).await;
        assert_eq!(outcome.terminal_verdict, Verdict::FatalError);
        assert!(outcome.error.unwrap().contains("index build failed"));

        let mut config = strict.config().clone();
        config.fallback_on_index_failure = true;
        let lenient = IterationController::new(
            config,
            VariantSpec::builtin("G2").unwrap(),
            Arc::new(CalcOracle::default()),
            llm,
        );
        let outcome = lenient.run(&bug).await;
        assert!(outcome.fixed);
    }
}
