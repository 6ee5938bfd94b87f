//! Prompt texts for the reasoning session.
//!
//! Variant directories may replace the system, localize and patch texts.
//! Overrides can use `{benchmark}`, `{project}`, `{bug}` and
//! `{trigger_tests}` placeholders.

use crate::oracle::BugInstance;
use crate::policy::PromptOverrides;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an automated program repair agent working on a checked-out Java, Python or Rust project that contains one known bug.

You interact with the project only through tool calls. To call a tool, reply with a single JSON object:

{"tool": "<tool name>", "arguments": {...}}

Rules:
- One tool call per reply. Explanations before the JSON are fine.
- Paths are relative to the project root.
- Gather only the context you need, then call propose_patch exactly once.
- If you cannot find a plausible fix, call no_patch with a short reason.
"#;

pub const DEFAULT_LOCALIZE_PROMPT: &str = r#"First locate the fault. Use the failing tests and the stack traces below to decide which code to read. Prefer reading the method the trace points at before searching more widely."#;

pub const DEFAULT_PATCH_PROMPT: &str = r#"When you know the fix, call propose_patch with either:
- "diff": a unified diff (--- a/path, +++ b/path, @@ hunks with 3 lines of context), or
- "edits": [{"path": "...", "ops": [{"type": "replace", "start_line": N, "end_line": M, "text": "..."}]}] where ops may also be "insert" (before start_line) or "delete", and line numbers refer to the current file.
If you are unsure between a few fixes, pass "candidates": [{"id": 1, "strategy": "...", "diff": "..."}, ...] instead; they are tried in order until one applies and compiles.
Change as little code as possible. Never write placeholder lines such as "..." in a patch. Do not modify tests."#;

pub const FINALIZE_PROMPT: &str = "Localization for this attempt is over. Reply now with propose_patch or no_patch; no other tool will be executed.";

pub const NO_CALL_PROMPT: &str = "No tool call found in your reply. Reply with a JSON object {\"tool\": ..., \"arguments\": {...}}.";

/// What the previous iteration taught us.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    pub verdict: String,
    /// Bounded excerpt of failing oracle output or compiler diagnostics.
    pub excerpt: String,
    /// The last proposal repeated an earlier patch.
    pub repeated_patch: bool,
    pub previous_patch: Option<String>,
}

/// The prompt texts in effect for one run.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    pub localize: String,
    pub patch: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            localize: DEFAULT_LOCALIZE_PROMPT.to_string(),
            patch: DEFAULT_PATCH_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    pub fn with_overrides(overrides: &PromptOverrides) -> Self {
        let defaults = Self::default();
        Self {
            system: overrides.system.clone().unwrap_or(defaults.system),
            localize: overrides.localize.clone().unwrap_or(defaults.localize),
            patch: overrides.patch.clone().unwrap_or(defaults.patch),
        }
    }

    pub fn system_prompt(&self, bug: &BugInstance) -> String {
        render(&self.system, bug)
    }

    /// The task message opening an iteration.
    pub fn task_message(
        &self,
        bug: &BugInstance,
        iteration: u32,
        failing_output: &str,
        context: &str,
        feedback: Option<&Feedback>,
    ) -> String {
        let mut msg = format!(
            "Bug: {} (attempt {})\n",
            bug.label(),
            iteration
        );
        if !bug.trigger_tests.is_empty() {
            msg.push_str(&format!("Failing tests: {}\n", bug.trigger_tests.join(", ")));
        }
        if !failing_output.trim().is_empty() {
            msg.push_str(&format!("\nFailing test output:\n```\n{}\n```\n", failing_output.trim_end()));
        }
        if !context.is_empty() {
            msg.push_str(&format!("\nCode gathered so far:\n{}", context));
        }
        if let Some(feedback) = feedback {
            msg.push('\n');
            msg.push_str(&format_feedback(feedback));
        }
        msg.push_str(&format!("\n{}\n\n{}\n", render(&self.localize, bug), render(&self.patch, bug)));
        msg
    }
}

/// Feedback paragraph describing the previous attempt's outcome.
pub fn format_feedback(feedback: &Feedback) -> String {
    let mut out = format!("Your previous patch was rejected: {}.\n", feedback.verdict);
    if feedback.repeated_patch {
        out.push_str("It was identical to a patch you already proposed; propose a different fix.\n");
    }
    if let Some(patch) = &feedback.previous_patch {
        out.push_str(&format!("Previous patch:\n```diff\n{}```\n", patch));
    }
    if !feedback.excerpt.trim().is_empty() {
        out.push_str(&format!("Oracle output:\n```\n{}\n```\n", feedback.excerpt.trim_end()));
    }
    out.push_str("The working copy has been restored to its original state.\n");
    out
}

fn render(template: &str, bug: &BugInstance) -> String {
    template
        .replace("{benchmark}", &bug.benchmark)
        .replace("{project}", &bug.project_id)
        .replace("{bug}", &bug.bug_id)
        .replace("{trigger_tests}", &bug.trigger_tests.join(", "))
}

/// Keep the tail of `text` within `max_bytes`; test runners print the
/// interesting part last.
pub fn excerpt_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = text.len() - max_bytes;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("[...]\n{}", &text[cut..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bug() -> BugInstance {
        BugInstance::new("defects4j", "Lang", "1", "/tmp/lang")
            .with_trigger_tests(vec!["org.LangTest::testAdd".to_string()])
    }

    #[test]
    fn test_overrides_and_placeholders() {
        let prompts = PromptSet::with_overrides(&PromptOverrides {
            system: Some("Fix {project}-{bug} ({trigger_tests}).".to_string()),
            localize: None,
            patch: None,
        });
        assert_eq!(prompts.system_prompt(&bug()), "Fix Lang-1 (org.LangTest::testAdd).");
        assert_eq!(prompts.patch, DEFAULT_PATCH_PROMPT);
    }

    #[test]
    fn test_task_message_includes_feedback() {
        let feedback = Feedback {
            verdict: "compile-failed".to_string(),
            excerpt: "A.java:3: error: ';' expected".to_string(),
            repeated_patch: true,
            previous_patch: None,
        };
        let msg = PromptSet::default().task_message(&bug(), 2, "", "", Some(&feedback));
        assert!(msg.starts_with("Bug: defects4j/Lang-1 (attempt 2)\nFailing tests: org.LangTest::testAdd\n"));
        assert!(msg.contains("rejected: compile-failed"));
        assert!(msg.contains("identical to a patch you already proposed"));
        assert!(msg.contains("';' expected"));
    }

    #[test]
    fn test_excerpt_tail() {
        assert_eq!(excerpt_tail("short", 10), "short");
        assert_eq!(excerpt_tail("0123456789abc", 3), "[...]\nabc");
    }
}
