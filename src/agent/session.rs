//! One bounded reasoning session (one iteration's LOCALIZE + REASON_AND_PATCH).
//!
//! The loop:
//! 1. Ask the model for its next action
//! 2. Parse a tool call out of the reply
//! 3. Execute information tools and feed the observation back
//! 4. Stop on `propose_patch` / `no_patch`, or when the budgets run out
//!
//! A session has two phases. In the localization phase information tools
//! run until the tool budget or the localization call cap is used up. The
//! patch phase then accepts only `propose_patch` and `no_patch`, for at most
//! `max_patch_calls` more LLM calls. A zero tool budget starts in the patch
//! phase.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::parser::{JsonToolCallParser, ToolCall, ToolCallParser};
use super::prompts::{PromptSet, FINALIZE_PROMPT, NO_CALL_PROMPT};
use super::tools::{ToolContext, ToolRegistry, ToolResult, NO_PATCH, PROPOSE_PATCH};
use crate::config::{RepairConfig, RetryPolicy, SessionLimits};
use crate::error::{LlmError, SessionError};
use crate::llm::{GenerationRequest, LlmProvider, Message, Usage};
use crate::localize::LocalizedSpan;
use crate::oracle::BugInstance;
use crate::patch::{parse_edits, PatchCandidate, ProposedEdit};
use crate::retry::retry_transient;

/// Sampling and budget settings for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub limits: SessionLimits,
    pub retry: RetryPolicy,
    pub llm_timeout: Duration,
}

impl SessionConfig {
    pub fn from_repair_config(config: &RepairConfig, limits: SessionLimits) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            limits,
            retry: config.retry.clone(),
            llm_timeout: config.llm_timeout(),
        }
    }
}

/// One tool invocation, as recorded in the iteration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub turn: usize,
    pub tool: String,
    pub arguments: Value,
    pub success: bool,
    pub output_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a session produced.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    /// Proposed patches in validation order. Empty without a proposal.
    pub candidates: Vec<PatchCandidate>,
    /// Why no proposal was made (model's `no_patch` reason or budget exhaustion).
    pub no_patch_reason: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub spans: Vec<LocalizedSpan>,
    pub llm_turns: usize,
    pub localization_calls: usize,
    pub patch_calls: usize,
    pub usage: Usage,
}

impl SessionOutcome {
    pub fn proposed(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Whether any information tool ran, failed proposals aside.
    pub fn used_tools(&self) -> bool {
        self.tool_calls.iter().any(|c| c.tool != PROPOSE_PATCH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Localize,
    Patch,
}

/// Drives one iteration's conversation with the model.
pub struct ReasoningSession {
    llm: Arc<dyn LlmProvider>,
    registry: ToolRegistry,
    parser: Box<dyn ToolCallParser>,
    prompts: PromptSet,
    config: SessionConfig,
}

impl ReasoningSession {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        registry: ToolRegistry,
        prompts: PromptSet,
        config: SessionConfig,
    ) -> Self {
        let mut known: Vec<String> = registry.list_tools().into_iter().map(String::from).collect();
        known.push(PROPOSE_PATCH.to_string());
        known.push(NO_PATCH.to_string());
        Self {
            llm,
            registry,
            parser: Box::new(JsonToolCallParser::new(known)),
            prompts,
            config,
        }
    }

    /// Set a custom tool call parser.
    pub fn with_parser(mut self, parser: Box<dyn ToolCallParser>) -> Self {
        self.parser = parser;
        self
    }

    fn opening_conversation(&self, bug: &BugInstance, task: &str) -> Vec<Message> {
        let tools_msg = format!(
            "You have access to the following tools. To use a tool, respond with a JSON object containing 'tool' and 'arguments' keys.\n\nTools:\n{}",
            serde_json::to_string_pretty(&self.registry.to_json_schema()).unwrap_or_default()
        );
        vec![
            Message::system(self.prompts.system_prompt(bug)),
            Message::user(tools_msg),
            Message::assistant(
                "Understood. I will reply with one JSON tool call at a time and finish with propose_patch or no_patch.",
            ),
            Message::user(task),
        ]
    }

    /// Run the session. Errors are infrastructure failures only; a model
    /// that never proposes yields an outcome without a proposal.
    pub async fn run(
        &self,
        bug: &BugInstance,
        task: &str,
        ctx: &ToolContext,
    ) -> Result<SessionOutcome, SessionError> {
        let limits = &self.config.limits;
        let max_turns = limits.max_llm_turns.max(1);
        let max_patch_calls = limits.max_patch_calls.max(1);
        let mut outcome = SessionOutcome::default();
        let mut info_calls = 0;

        let mut phase = if limits.max_tool_calls == 0 || limits.max_localization_calls == 0 || max_turns == 1 {
            debug!(bug = %bug, "No localization budget, starting in the patch phase");
            Phase::Patch
        } else {
            Phase::Localize
        };
        let mut conversation = match phase {
            Phase::Localize => self.opening_conversation(bug, task),
            Phase::Patch => self.opening_conversation(bug, &format!("{task}\n\n{FINALIZE_PROMPT}")),
        };

        for turn in 0..max_turns {
            let (text, usage) = self.generate(&conversation).await?;
            outcome.llm_turns += 1;
            match phase {
                Phase::Localize => outcome.localization_calls += 1,
                Phase::Patch => outcome.patch_calls += 1,
            }
            add_usage(&mut outcome.usage, &usage);
            conversation.push(Message::assistant(&text));

            let mut reply = match self.parser.parse(&text) {
                None => NO_CALL_PROMPT.to_string(),
                Some(call) => match call.name.as_str() {
                    PROPOSE_PATCH => match proposal_from_arguments(&call.arguments) {
                        Ok(candidates) => {
                            info!(
                                bug = %bug,
                                turn,
                                candidates = candidates.len(),
                                tool_calls = info_calls,
                                "Patch proposed"
                            );
                            outcome.candidates = candidates;
                            return Ok(outcome);
                        }
                        Err(message) => {
                            // Recorded, but not charged to the tool budget.
                            outcome.tool_calls.push(record(turn, &call, &ToolResult::failure(&message)));
                            format!("Tool 'propose_patch' failed:\n{message}")
                        }
                    },
                    NO_PATCH => {
                        let reason = call
                            .arguments
                            .get("reason")
                            .and_then(|r| r.as_str())
                            .unwrap_or("no reason given")
                            .to_string();
                        info!(bug = %bug, turn, reason = %reason, "Model declined to patch");
                        outcome.no_patch_reason = Some(reason);
                        return Ok(outcome);
                    }
                    _ if phase == Phase::Patch => {
                        debug!(tool = %call.name, "Information tool refused in the patch phase");
                        format!("Tool '{}' was not executed: localization is over.", call.name)
                    }
                    _ => {
                        let result = self.execute_tool(&call, ctx).await;
                        info_calls += 1;
                        outcome.tool_calls.push(record(turn, &call, &result));
                        outcome.spans.extend(result.spans.iter().cloned());
                        let status = if result.success { "succeeded" } else { "failed" };
                        format!("Tool '{}' {}:\n{}", call.name, status, result.observation())
                    }
                },
            };

            let last_turn = turn + 1 >= max_turns
                || (phase == Phase::Patch && outcome.patch_calls >= max_patch_calls);
            if last_turn {
                break;
            }
            if phase == Phase::Localize
                && (info_calls >= limits.max_tool_calls
                    || outcome.localization_calls >= limits.max_localization_calls
                    || turn + 2 >= max_turns)
            {
                debug!(
                    bug = %bug,
                    tool_calls = info_calls,
                    llm_calls = outcome.localization_calls,
                    "Localization budget reached, entering the patch phase"
                );
                phase = Phase::Patch;
            }
            if phase == Phase::Patch {
                reply = format!("{reply}\n\n{FINALIZE_PROMPT}");
            }
            conversation.push(Message::user(reply));
        }

        warn!(bug = %bug, turns = outcome.llm_turns, "Session ended without a proposal");
        outcome.no_patch_reason = Some("session budget exhausted without a proposal".to_string());
        Ok(outcome)
    }

    async fn execute_tool(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolResult::failure(format!("Tool '{}' is not available", call.name));
        };
        debug!(tool = %call.name, arguments = %call.arguments, "Executing tool");
        match tool.execute(call.arguments.clone(), ctx).await {
            Ok(result) => result,
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    async fn generate(&self, conversation: &[Message]) -> Result<(String, Usage), SessionError> {
        let timeout = self.config.llm_timeout;
        let response = retry_transient(&self.config.retry, "llm", || {
            let request = GenerationRequest::new(self.config.model.clone(), conversation.to_vec())
                .with_temperature(self.config.temperature)
                .with_max_tokens(self.config.max_tokens);
            async move {
                match tokio::time::timeout(timeout, self.llm.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        })
        .await?;

        let text = response
            .first_content()
            .ok_or(SessionError::EmptyResponse)?
            .to_string();
        Ok((text, response.usage))
    }
}

fn add_usage(total: &mut Usage, usage: &Usage) {
    total.prompt_tokens += usage.prompt_tokens;
    total.completion_tokens += usage.completion_tokens;
    total.total_tokens += usage.total_tokens;
}

fn record(turn: usize, call: &ToolCall, result: &ToolResult) -> ToolCallRecord {
    ToolCallRecord {
        turn,
        tool: call.name.clone(),
        arguments: call.arguments.clone(),
        success: result.success,
        output_bytes: result.output.len(),
        error: result.error.clone(),
    }
}

/// Turn `propose_patch` arguments into candidates: a `candidates` list, or
/// one plain diff or edit list.
fn proposal_from_arguments(arguments: &Value) -> Result<Vec<PatchCandidate>, String> {
    let Some(candidates) = arguments.get("candidates") else {
        return edit_from_arguments(arguments).map(|edit| vec![PatchCandidate::single(edit)]);
    };
    let list = candidates
        .as_array()
        .ok_or("\"candidates\" must be a list")?;
    let mut parsed = Vec::with_capacity(list.len());
    for (i, entry) in list.iter().enumerate() {
        let edit = edit_from_arguments(entry).map_err(|e| format!("candidate {}: {e}", i + 1))?;
        parsed.push(PatchCandidate {
            id: entry
                .get("id")
                .and_then(Value::as_u64)
                .map_or(i as u32 + 1, |id| id as u32),
            strategy: entry
                .get("strategy")
                .and_then(Value::as_str)
                .map(str::to_string),
            edit,
        });
    }
    if parsed.is_empty() {
        return Err("\"candidates\" is empty".to_string());
    }
    Ok(parsed)
}

fn edit_from_arguments(arguments: &Value) -> Result<ProposedEdit, String> {
    if let Some(diff) = arguments.get("diff").and_then(|d| d.as_str()) {
        if !diff.trim().is_empty() {
            return Ok(ProposedEdit::Diff {
                text: diff.to_string(),
            });
        }
    }
    if let Some(edits) = arguments.get("edits") {
        return parse_edits(edits)
            .map(|edits| ProposedEdit::Edits { edits })
            .map_err(|e| e.to_string());
    }
    // A bare string argument is read as a diff.
    if let Some(diff) = arguments.as_str() {
        if !diff.trim().is_empty() {
            return Ok(ProposedEdit::Diff {
                text: diff.to_string(),
            });
        }
    }
    Err("propose_patch needs a non-empty \"diff\" string or an \"edits\" list".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, GenerationResponse};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replies with scripted texts in order, then keeps repeating the last one.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            let mut replies = self.replies.lock().unwrap();
            let content = if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap_or_default()
            };
            Ok(GenerationResponse {
                id: "test".to_string(),
                model: "scripted".to_string(),
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

    fn config(max_tool_calls: usize, max_llm_turns: usize) -> SessionConfig {
        SessionConfig {
            model: "scripted".to_string(),
            temperature: 0.0,
            max_tokens: 512,
            limits: SessionLimits {
                max_tool_calls,
                max_llm_turns,
                ..SessionLimits::default()
            },
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay_ms: 1,
            },
            llm_timeout: Duration::from_secs(5),
        }
    }

    fn setup() -> (TempDir, BugInstance) {
        let wc = TempDir::new().unwrap();
        std::fs::write(wc.path().join("calc.py"), "def add(a, b):\n    return a - b\n").unwrap();
        let bug = BugInstance::new("bench", "calc", "1", wc.path());
        (wc, bug)
    }

    fn session(llm: Arc<ScriptedLlm>, cfg: SessionConfig) -> ReasoningSession {
        ReasoningSession::new(llm, ToolRegistry::for_policy(false), PromptSet::default(), cfg)
    }

    const READ: &str = r#"{"tool": "read_file", "arguments": {"path": "calc.py"}}"#;
    const PROPOSE: &str = r#"{"tool": "propose_patch", "arguments": {"diff": "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n"}}"#;

    #[tokio::test]
    async fn test_session_reads_then_proposes() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[READ, PROPOSE]));
        let ctx = ToolContext::new(wc.path(), config(5, 10).limits);

        let outcome = session(llm.clone(), config(5, 10)).run(&bug, "fix it", &ctx).await.unwrap();

        assert!(matches!(
            outcome.candidates.as_slice(),
            [PatchCandidate { id: 1, edit: ProposedEdit::Diff { .. }, .. }]
        ));
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].tool, "read_file");
        assert_eq!(outcome.spans, vec![LocalizedSpan::new("calc.py", 1, 2, "read by agent")]);
        assert_eq!(outcome.llm_turns, 2);
        assert_eq!(outcome.usage.total_tokens, 30);

        // The tool observation was fed back before the second request.
        let requests = llm.requests.lock().unwrap();
        let last = requests[1].messages.last().unwrap();
        assert!(last.content.starts_with("Tool 'read_file' succeeded:\n   1: def add(a, b):"));
    }

    #[tokio::test]
    async fn test_tool_budget_forces_finalize_then_no_patch() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[READ]));
        let mut cfg = config(2, 20);
        cfg.limits.max_patch_calls = 1;
        let ctx = ToolContext::new(wc.path(), cfg.limits.clone());

        let outcome = session(llm.clone(), cfg).run(&bug, "fix it", &ctx).await.unwrap();

        assert!(!outcome.proposed());
        assert_eq!(outcome.tool_calls.len(), 2);
        // Two tool turns plus the single patch-phase turn, whose read was refused.
        assert_eq!(llm.request_count(), 3);
        assert_eq!((outcome.localization_calls, outcome.patch_calls), (2, 1));
        let requests = llm.requests.lock().unwrap();
        assert!(requests[2].messages.last().unwrap().content.ends_with(FINALIZE_PROMPT));
        assert!(outcome.no_patch_reason.is_some());
    }

    #[tokio::test]
    async fn test_finalize_turn_may_still_propose() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[READ, PROPOSE]));
        let ctx = ToolContext::new(wc.path(), config(1, 20).limits);

        let outcome = session(llm, config(1, 20)).run(&bug, "fix it", &ctx).await.unwrap();
        assert!(outcome.proposed());
    }

    #[tokio::test]
    async fn test_zero_tool_budget_runs_no_tool() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[READ, PROPOSE]));
        let ctx = ToolContext::new(wc.path(), config(0, 10).limits);

        let outcome = session(llm.clone(), config(0, 10)).run(&bug, "fix it", &ctx).await.unwrap();

        assert!(outcome.proposed());
        assert!(outcome.tool_calls.is_empty());
        assert!(outcome.spans.is_empty());
        assert!(!outcome.used_tools());
        assert_eq!((outcome.localization_calls, outcome.patch_calls), (0, 2));

        let requests = llm.requests.lock().unwrap();
        assert!(requests[0].messages.last().unwrap().content.ends_with(FINALIZE_PROMPT));
        let refusal = &requests[1].messages.last().unwrap().content;
        assert!(refusal.starts_with("Tool 'read_file' was not executed"), "{refusal}");
    }

    #[tokio::test]
    async fn test_budget_is_checked_before_each_tool() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[READ]));
        let mut cfg = config(3, 20);
        cfg.limits.max_patch_calls = 2;
        let ctx = ToolContext::new(wc.path(), cfg.limits.clone());

        let outcome = session(llm.clone(), cfg).run(&bug, "fix it", &ctx).await.unwrap();

        // Exactly the budget, never one more.
        assert_eq!(outcome.tool_calls.len(), 3);
        assert_eq!(llm.request_count(), 5);
    }

    #[tokio::test]
    async fn test_malformed_proposal_is_not_charged_to_tool_budget() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"tool": "propose_patch", "arguments": {}}"#,
            READ,
            PROPOSE,
        ]));
        let ctx = ToolContext::new(wc.path(), config(1, 20).limits);

        let outcome = session(llm, config(1, 20)).run(&bug, "fix it", &ctx).await.unwrap();

        assert!(outcome.proposed());
        let tools: Vec<_> = outcome.tool_calls.iter().map(|c| (c.tool.as_str(), c.success)).collect();
        assert_eq!(tools, vec![("propose_patch", false), ("read_file", true)]);
        assert!(outcome.used_tools());
    }

    #[tokio::test]
    async fn test_localization_call_cap_starts_patch_phase() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&["Let me think.", READ]));
        let mut cfg = config(10, 20);
        cfg.limits.max_localization_calls = 2;
        cfg.limits.max_patch_calls = 1;
        let ctx = ToolContext::new(wc.path(), cfg.limits.clone());

        let outcome = session(llm.clone(), cfg).run(&bug, "fix it", &ctx).await.unwrap();

        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!((outcome.localization_calls, outcome.patch_calls), (2, 1));
        assert_eq!(llm.request_count(), 3);
        assert!(outcome.no_patch_reason.is_some());
    }

    #[tokio::test]
    async fn test_no_patch_reason() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&[
            r#"{"tool": "no_patch", "arguments": {"reason": "cannot reproduce"}}"#,
        ]));
        let ctx = ToolContext::new(wc.path(), config(5, 10).limits);

        let outcome = session(llm, config(5, 10)).run(&bug, "fix it", &ctx).await.unwrap();
        assert!(!outcome.proposed());
        assert_eq!(outcome.no_patch_reason.as_deref(), Some("cannot reproduce"));
    }

    #[tokio::test]
    async fn test_turn_cap_is_hard() {
        let (wc, bug) = setup();
        let llm = Arc::new(ScriptedLlm::new(&["I am thinking."]));
        let ctx = ToolContext::new(wc.path(), config(5, 4).limits);

        let outcome = session(llm.clone(), config(5, 4)).run(&bug, "fix it", &ctx).await.unwrap();
        assert!(!outcome.proposed());
        assert_eq!(llm.request_count(), 4);
    }

    #[test]
    fn test_proposal_from_arguments() {
        assert!(matches!(
            edit_from_arguments(&serde_json::json!({"diff": "--- a/x\n"})),
            Ok(ProposedEdit::Diff { .. })
        ));
        let edits = serde_json::json!({"edits": [{"path": "x.py", "ops": [{"type": "delete", "start_line": 1, "end_line": 1}]}]});
        assert!(matches!(edit_from_arguments(&edits), Ok(ProposedEdit::Edits { .. })));
        assert!(proposal_from_arguments(&serde_json::json!({})).is_err());
        assert!(proposal_from_arguments(&serde_json::json!({"diff": "  "})).is_err());
        assert_eq!(proposal_from_arguments(&edits).unwrap().len(), 1);
    }

    #[test]
    fn test_candidates_keep_order_ids_and_strategies() {
        let args = serde_json::json!({"candidates": [
            {"id": 7, "strategy": "flip the operator", "diff": "--- a/x\n"},
            {"edits": [{"path": "x.py", "ops": [{"type": "delete", "start_line": 1, "end_line": 1}]}]},
        ]});
        let candidates = proposal_from_arguments(&args).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].id, 7);
        assert_eq!(candidates[0].strategy.as_deref(), Some("flip the operator"));
        assert_eq!(candidates[1].id, 2);
        assert!(matches!(candidates[1].edit, ProposedEdit::Edits { .. }));

        assert!(proposal_from_arguments(&serde_json::json!({"candidates": []})).is_err());
        assert!(proposal_from_arguments(&serde_json::json!({"candidates": "diff"})).is_err());
        let err = proposal_from_arguments(&serde_json::json!({"candidates": [{"diff": "--- a/x\n"}, {}]}))
            .unwrap_err();
        assert!(err.starts_with("candidate 2:"), "{err}");
    }
}
