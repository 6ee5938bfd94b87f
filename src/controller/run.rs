//! Per-run state and the work done in each controller state.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::state::{RunState, Terminal};
use crate::agent::prompts::excerpt_tail;
use crate::agent::{Feedback, PromptSet, ReasoningSession, SessionOutcome, ToolContext};
use crate::config::{RepairConfig, SessionLimits};
use crate::index::IndexHandle;
use crate::localize::{LocalizationContext, LocalizedSpan};
use crate::oracle::{BugInstance, TestReport};
use crate::patch::{PatchCandidate, PatchStage, Snapshot, WorkingCopyLock};
use crate::pipeline::{StepRecord, ValidationPipeline, Verdict};
use crate::recorder::{CandidateRecord, IterationRecord, RunCounters, Timings};

pub(crate) fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Everything that must survive the run future being dropped on timeout.
#[derive(Default)]
pub(crate) struct Tracker {
    /// Requested working copy, plus the checked-out one when they differ.
    pub locks: Vec<WorkingCopyLock>,
    pub setup_steps: Vec<StepRecord>,
    pub iterations: Vec<IterationRecord>,
    current: Option<(IterationRecord, Instant)>,
    pub counters: RunCounters,
    pub timings: Timings,
    pub final_patch: Option<String>,
    /// Pre-patch bytes of a patch currently under validation.
    pending: Option<(PatchStage, Snapshot)>,
}

impl Tracker {
    fn begin_iteration(&mut self, iteration: u32) {
        self.current = Some((IterationRecord::new(iteration, Verdict::NoPatchProduced), Instant::now()));
    }

    fn current_mut(&mut self) -> Option<&mut IterationRecord> {
        self.current.as_mut().map(|(record, _)| record)
    }

    fn finish_iteration(&mut self, verdict: Verdict, spans: Vec<LocalizedSpan>) {
        if let Some((mut record, started)) = self.current.take() {
            record.verdict = verdict;
            record.localized_spans = spans;
            record.elapsed_ms = elapsed_ms(started);
            self.iterations.push(record);
        }
    }

    /// Close an iteration interrupted by a run-level verdict.
    pub fn abort_iteration(&mut self, verdict: Verdict) {
        self.finish_iteration(verdict, Vec::new());
    }

    fn record_session(&mut self, outcome: &SessionOutcome) {
        self.counters.llm_turns += outcome.llm_turns as u32;
        self.counters.tool_calls += outcome.tool_calls.len() as u32;
        self.counters.prompt_tokens += u64::from(outcome.usage.prompt_tokens);
        self.counters.completion_tokens += u64::from(outcome.usage.completion_tokens);
        self.counters.localization_calls += outcome.localization_calls as u32;
        self.counters.patch_calls += outcome.patch_calls as u32;
        if let Some(record) = self.current_mut() {
            record.tool_calls = outcome.tool_calls.clone();
            record.llm_turns = outcome.llm_turns as u32;
            record.localization_calls = outcome.localization_calls as u32;
            record.patch_calls = outcome.patch_calls as u32;
        }
    }

    /// Put back a patch left on disk by an interrupted validation.
    pub fn restore_pending(&mut self) {
        if let Some((stage, snapshot)) = self.pending.take() {
            match stage.rollback(&snapshot) {
                Ok(()) => info!(files = ?snapshot.files().collect::<Vec<_>>(), "Restored working copy after interrupted validation"),
                Err(e) => warn!(error = %e, "Failed to restore working copy"),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SeenPatch {
    iteration: u32,
    verdict: Verdict,
    excerpt: String,
}

/// One validated candidate.
#[derive(Debug, Clone)]
struct Judged {
    id: u32,
    strategy: Option<String>,
    verdict: Verdict,
    steps: Vec<StepRecord>,
    canonical: Option<String>,
    fingerprint: Option<String>,
    touched_files: Vec<String>,
    excerpt: String,
    duplicate_of: Option<u32>,
}

impl Judged {
    /// Rejected before any test ran; the next candidate gets a turn.
    fn falls_through(&self) -> bool {
        matches!(self.verdict, Verdict::PatchNotApplicable | Verdict::CompileFailed)
    }

    fn record(&self) -> CandidateRecord {
        CandidateRecord {
            id: self.id,
            strategy: self.strategy.clone(),
            verdict: self.verdict,
            fingerprint: self.fingerprint.clone(),
            duplicate_of: self.duplicate_of,
        }
    }
}

/// Repeated-failure counters behind the early-stop limits.
#[derive(Debug, Clone, Copy, Default)]
struct Streaks {
    /// Consecutive not-applicable iterations.
    apply_failures: u32,
    /// Compile-failed candidates so far.
    compile_failures: u32,
    /// Consecutive rejected proposals made without reading any code.
    direct_patches: u32,
}

/// State carried across the iterations of one run.
pub(crate) struct Run<'a> {
    pub bug: &'a BugInstance,
    pub config: &'a RepairConfig,
    pub pipeline: ValidationPipeline<'a>,
    pub session: ReasoningSession,
    pub prompts: PromptSet,
    pub stage: PatchStage,
    pub limits: SessionLimits,
    pub index: Option<IndexHandle>,
    pub context: LocalizationContext,
    pub baseline: TestReport,
    /// RED-check (or baseline) output shown in every task message.
    pub failing_output: String,
    pub feedback: Option<Feedback>,
    seen: HashMap<String, SeenPatch>,
    streaks: Streaks,
    /// Whether the current iteration's proposal came without any tool call.
    direct_patch: bool,
    pub iteration: u32,
}

impl<'a> Run<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bug: &'a BugInstance,
        config: &'a RepairConfig,
        pipeline: ValidationPipeline<'a>,
        session: ReasoningSession,
        prompts: PromptSet,
        limits: SessionLimits,
        index: Option<IndexHandle>,
        context: LocalizationContext,
        baseline: TestReport,
        failing_output: String,
    ) -> Self {
        Self {
            bug,
            config,
            pipeline,
            session,
            prompts,
            stage: PatchStage::new(&bug.working_copy_path),
            limits,
            index,
            context,
            baseline,
            failing_output,
            feedback: None,
            seen: HashMap::new(),
            streaks: Streaks::default(),
            direct_patch: false,
            iteration: 0,
        }
    }

    /// LOCALIZE: open the next iteration and build its task message.
    pub fn localize(&mut self, tracker: &mut Tracker) -> RunState {
        self.iteration += 1;
        tracker.begin_iteration(self.iteration);

        let wc = &self.bug.working_copy_path;
        let ctx = ToolContext::new(wc, self.limits.clone()).with_index(self.index.clone());
        let rendered = self
            .context
            .render_for_prompt(wc, self.limits.localization_byte_budget);
        let failing = excerpt_tail(&self.failing_output, self.config.feedback_excerpt_bytes);
        let task = self.prompts.task_message(
            self.bug,
            self.iteration,
            &failing,
            &rendered,
            self.feedback.as_ref(),
        );

        info!(
            bug = %self.bug,
            iteration = self.iteration,
            context_spans = self.context.len(),
            "Starting iteration"
        );
        RunState::ReasonAndPatch { task, ctx }
    }

    /// REASON_AND_PATCH: one bounded session.
    pub async fn reason_and_patch(
        &mut self,
        task: &str,
        ctx: &ToolContext,
        tracker: &mut Tracker,
    ) -> RunState {
        let started = Instant::now();
        let result = self.session.run(self.bug, task, ctx).await;
        tracker.timings.reasoning_ms += elapsed_ms(started);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(bug = %self.bug, iteration = self.iteration, error = %e, "Reasoning session failed");
                return RunState::Abandon(Terminal::from_session(&e));
            }
        };
        tracker.record_session(&outcome);

        let added = self.context.extend(outcome.spans.iter().cloned());
        debug!(added, total = self.context.len(), "Localization context updated");

        self.direct_patch = outcome.proposed() && !outcome.used_tools();
        if outcome.proposed() {
            return RunState::Validate {
                candidates: outcome.candidates,
            };
        }
        let reason = outcome
            .no_patch_reason
            .unwrap_or_else(|| "no proposal".to_string());
        info!(bug = %self.bug, iteration = self.iteration, reason = %reason, "No patch produced");
        if let Some(record) = tracker.current_mut() {
            record.no_patch_reason = Some(reason.clone());
        }
        self.feedback = Some(Feedback {
            verdict: Verdict::NoPatchProduced.to_string(),
            excerpt: reason,
            repeated_patch: false,
            previous_patch: None,
        });
        self.finish(tracker, Verdict::NoPatchProduced)
    }

    /// VALIDATE: pipeline steps 2-5 for each candidate in turn. A candidate
    /// that does not apply or compile hands over to the next one; the first
    /// to reach the tests decides the iteration.
    pub async fn validate(&mut self, candidates: Vec<PatchCandidate>, tracker: &mut Tracker) -> RunState {
        let limit = self.config.max_candidates.max(1);
        if candidates.len() > limit {
            debug!(offered = candidates.len(), limit, "Ignoring extra patch candidates");
        }

        let mut judged: Vec<Judged> = Vec::new();
        for candidate in candidates.into_iter().take(limit) {
            let result = match self.judge(candidate, tracker).await {
                Ok(result) => result,
                Err(terminal) => return RunState::Abandon(terminal),
            };
            tracker.counters.candidates_tried += 1;
            let done = !result.falls_through();
            judged.push(result);
            if done {
                break;
            }
        }
        self.streaks.compile_failures += judged
            .iter()
            .filter(|j| j.verdict == Verdict::CompileFailed)
            .count() as u32;
        let Some(decisive) = judged.last().cloned() else {
            return self.finish(tracker, Verdict::NoPatchProduced);
        };

        if let Some(record) = tracker.current_mut() {
            record.steps = decisive.steps.clone();
            record.canonical_patch = decisive.canonical.clone();
            record.fingerprint = decisive.fingerprint.clone();
            record.touched_files = decisive.touched_files.clone();
            record.duplicate_of = decisive.duplicate_of;
            if judged.len() > 1 {
                record.candidates = judged.iter().map(Judged::record).collect();
            }
        }

        if decisive.verdict.is_green() {
            tracker.final_patch = decisive.canonical;
            return self.finish(tracker, decisive.verdict);
        }

        let excerpt = if judged.len() > 1 {
            let summary = judged
                .iter()
                .map(|j| {
                    let label = match &j.strategy {
                        Some(strategy) => format!("Candidate {} ({strategy})", j.id),
                        None => format!("Candidate {}", j.id),
                    };
                    format!("{label}: {}\n{}", j.verdict, j.excerpt)
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            excerpt_tail(&summary, self.config.feedback_excerpt_bytes)
        } else {
            decisive.excerpt
        };
        self.feedback = Some(Feedback {
            verdict: decisive.verdict.to_string(),
            excerpt,
            repeated_patch: decisive.duplicate_of.is_some(),
            previous_patch: decisive.canonical,
        });
        self.finish(tracker, decisive.verdict)
    }

    /// Validate one candidate and leave the working copy as it was unless
    /// the candidate went green. A repeated patch reuses the earlier verdict.
    async fn judge(&mut self, candidate: PatchCandidate, tracker: &mut Tracker) -> Result<Judged, Terminal> {
        let PatchCandidate { id, strategy, edit } = candidate;
        match self.stage.plan(&edit) {
            Ok(plan) => {
                if let Some(seen) = self.seen.get(&plan.fingerprint).cloned() {
                    tracker.counters.duplicate_patches += 1;
                    info!(
                        bug = %self.bug,
                        iteration = self.iteration,
                        candidate = id,
                        earlier = seen.iteration,
                        verdict = %seen.verdict,
                        "Repeated patch, reusing earlier verdict"
                    );
                    return Ok(Judged {
                        id,
                        strategy,
                        verdict: seen.verdict,
                        steps: Vec::new(),
                        touched_files: plan.touched_files(),
                        canonical: Some(plan.canonical),
                        fingerprint: Some(plan.fingerprint),
                        excerpt: seen.excerpt,
                        duplicate_of: Some(seen.iteration),
                    });
                }
                match self.stage.take_snapshot(&plan) {
                    Ok(snapshot) => tracker.pending = Some((self.stage.clone(), snapshot)),
                    Err(e) => {
                        return Err(Terminal::abort(
                            Verdict::FatalError,
                            format!("cannot snapshot working copy: {e}"),
                        ))
                    }
                }
            }
            // The pipeline reports it as patch-not-applicable.
            Err(e) => debug!(candidate = id, error = %e, "Dry run rejected proposal"),
        }

        let started = Instant::now();
        let result = self.pipeline.validate(&self.stage, &edit, &self.baseline).await;
        tracker.timings.validation_ms += elapsed_ms(started);

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracker.restore_pending();
                warn!(bug = %self.bug, iteration = self.iteration, error = %e, "Validation failed");
                return Err(Terminal::from_pipeline(&e));
            }
        };
        tracker.pending = None;

        let verdict = report.verdict;
        info!(bug = %self.bug, iteration = self.iteration, candidate = id, verdict = %verdict, "Candidate validated");
        if !verdict.is_green() {
            if let Some(applied) = &report.applied {
                if let Err(e) = self.stage.rollback(&applied.snapshot) {
                    return Err(Terminal::abort(
                        Verdict::FatalError,
                        format!("rollback failed: {e}"),
                    ));
                }
                debug!(files = ?applied.touched_files, "Rolled back rejected patch");
            }
        }

        let excerpt = excerpt_tail(&report.failure_output, self.config.feedback_excerpt_bytes);
        if let (false, Some(fingerprint)) = (verdict.is_green(), &report.fingerprint) {
            self.seen.insert(
                fingerprint.clone(),
                SeenPatch {
                    iteration: self.iteration,
                    verdict,
                    excerpt: excerpt.clone(),
                },
            );
        }
        Ok(Judged {
            id,
            strategy,
            verdict,
            steps: report.steps,
            canonical: report.canonical_patch,
            fingerprint: report.fingerprint,
            touched_files: report.touched_files,
            excerpt,
            duplicate_of: None,
        })
    }

    fn finish(&mut self, tracker: &mut Tracker, verdict: Verdict) -> RunState {
        tracker.finish_iteration(verdict, self.context.spans().to_vec());
        info!(bug = %self.bug, iteration = self.iteration, verdict = %verdict, "Iteration finished");
        if verdict.is_green() {
            return RunState::Accept;
        }
        match self.early_stop(verdict) {
            Some(reason) if self.iteration < self.config.max_iters => {
                warn!(bug = %self.bug, iteration = self.iteration, reason = %reason, "Stopping early");
                RunState::Abandon(Terminal::stopped_early(verdict, reason))
            }
            _ => RunState::Retry { verdict },
        }
    }

    /// Update the failure streaks and name the first limit reached.
    fn early_stop(&mut self, verdict: Verdict) -> Option<String> {
        let streaks = &mut self.streaks;
        if verdict == Verdict::PatchNotApplicable {
            streaks.apply_failures += 1;
        } else {
            streaks.apply_failures = 0;
        }
        if self.direct_patch {
            streaks.direct_patches += 1;
        } else {
            streaks.direct_patches = 0;
        }

        let reached = |limit: u32, count: u32| limit > 0 && count >= limit;
        if reached(self.config.max_apply_failures, streaks.apply_failures) {
            Some(format!("{} consecutive patches did not apply", streaks.apply_failures))
        } else if reached(self.config.max_compile_failures, streaks.compile_failures) {
            Some(format!("{} patches failed to compile", streaks.compile_failures))
        } else if reached(self.config.max_consecutive_direct_patches, streaks.direct_patches) {
            Some(format!(
                "{} consecutive patches were proposed without reading any code",
                streaks.direct_patches
            ))
        } else {
            None
        }
    }

    /// `max_iters = 0`: regression check and full suite on the unpatched copy.
    pub async fn verify_only(&mut self, tracker: &mut Tracker) -> Terminal {
        let started = Instant::now();
        let result = self.pipeline.verify_only(&self.baseline).await;
        tracker.timings.validation_ms += elapsed_ms(started);
        match result {
            Ok(report) => {
                info!(bug = %self.bug, verdict = %report.verdict, "Verify-only checks finished");
                tracker.setup_steps.extend(report.steps);
                Terminal::verified(report.verdict)
            }
            Err(e) => Terminal::from_pipeline(&e),
        }
    }
}
