//! Fault localization state.
//!
//! The reasoning session gathers spans through its tools; the controller
//! folds them into a [`LocalizationContext`] that survives across
//! iterations and is rendered back into each new prompt.

pub mod search;
pub mod seed;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::index::query::number_lines;

pub use search::{read_file, search_in_files, SearchHit};
pub use seed::seed_from_output;

/// A region of source believed relevant to the bug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedSpan {
    pub file: String,
    pub start: usize,
    pub end: usize,
    pub rationale: String,
}

impl LocalizedSpan {
    pub fn new(file: impl Into<String>, start: usize, end: usize, rationale: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            start,
            end: end.max(start),
            rationale: rationale.into(),
        }
    }

    fn contains(&self, other: &LocalizedSpan) -> bool {
        self.file == other.file && self.start <= other.start && other.end <= self.end
    }
}

/// Ordered, de-duplicated spans accumulated over a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalizationContext {
    spans: Vec<LocalizedSpan>,
}

impl LocalizationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a span unless an existing one already covers it. Existing spans
    /// covered by the new one are replaced in place.
    pub fn add(&mut self, span: LocalizedSpan) -> bool {
        if self.spans.iter().any(|s| s.contains(&span)) {
            return false;
        }
        if let Some(pos) = self.spans.iter().position(|s| span.contains(s)) {
            self.spans[pos] = span;
            let kept = self.spans[pos].clone();
            let mut seen_kept = false;
            self.spans.retain(|s| {
                if *s == kept && !seen_kept {
                    seen_kept = true;
                    return true;
                }
                !kept.contains(s)
            });
            return true;
        }
        self.spans.push(span);
        true
    }

    pub fn extend(&mut self, spans: impl IntoIterator<Item = LocalizedSpan>) -> usize {
        spans.into_iter().filter(|s| self.add(s.clone())).count()
    }

    pub fn spans(&self) -> &[LocalizedSpan] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Snippets of each span, read from the working copy, within `max_bytes`.
    pub fn render_for_prompt(&self, working_copy: &Path, max_bytes: usize) -> String {
        let mut out = String::new();
        for span in &self.spans {
            let Ok(content) = std::fs::read_to_string(working_copy.join(&span.file)) else {
                continue;
            };
            let lines: Vec<&str> = content.lines().collect();
            if span.start == 0 || span.start > lines.len() {
                continue;
            }
            let end = span.end.min(lines.len());
            let block = format!(
                "### {}:{}-{} ({})\n{}\n\n",
                span.file,
                span.start,
                end,
                span.rationale,
                number_lines(&lines[span.start - 1..end], span.start)
            );
            if out.len() + block.len() > max_bytes {
                out.push_str("[further context omitted]\n");
                break;
            }
            out.push_str(&block);
        }
        out
    }
}

/// Bytes of source text the tools may still return this iteration.
#[derive(Debug)]
pub struct ByteBudget {
    limit: usize,
    used: AtomicUsize,
}

pub const BUDGET_NOTICE: &str =
    "[localization budget exhausted: no more source text this iteration; propose a patch or call no_patch]";

impl ByteBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Charge `text` against the budget, truncating what does not fit.
    pub fn charge(&self, text: String) -> String {
        let remaining = self.remaining();
        if remaining == 0 {
            return BUDGET_NOTICE.to_string();
        }
        if text.len() <= remaining {
            self.used.fetch_add(text.len(), Ordering::Relaxed);
            return text;
        }

        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.used.fetch_add(remaining, Ordering::Relaxed);
        format!("{}\n{}", &text[..cut], BUDGET_NOTICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_context_deduplicates() {
        let mut ctx = LocalizationContext::new();
        assert!(ctx.add(LocalizedSpan::new("A.java", 10, 20, "lookup")));
        assert!(!ctx.add(LocalizedSpan::new("A.java", 12, 15, "read")));
        assert!(ctx.add(LocalizedSpan::new("B.java", 1, 5, "read")));
        assert!(ctx.add(LocalizedSpan::new("A.java", 30, 31, "read")));
        assert_eq!(ctx.len(), 3);

        // A wider span replaces every span it covers, keeping the first slot.
        assert!(ctx.add(LocalizedSpan::new("A.java", 1, 40, "class")));
        let files: Vec<(&str, usize)> = ctx.spans().iter().map(|s| (s.file.as_str(), s.start)).collect();
        assert_eq!(files, vec![("A.java", 1), ("B.java", 1)]);
    }

    #[test]
    fn test_render_for_prompt_respects_budget() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("A.java"), "one\ntwo\nthree\n").unwrap();
        let mut ctx = LocalizationContext::new();
        ctx.add(LocalizedSpan::new("A.java", 2, 9, "frame"));
        ctx.add(LocalizedSpan::new("Missing.java", 1, 2, "frame"));

        let rendered = ctx.render_for_prompt(tmp.path(), 10_000);
        assert_eq!(rendered, "### A.java:2-3 (frame)\n   2: two\n   3: three\n\n");

        let clipped = ctx.render_for_prompt(tmp.path(), 10);
        assert_eq!(clipped, "[further context omitted]\n");
    }

    #[test]
    fn test_byte_budget() {
        let budget = ByteBudget::new(10);
        assert_eq!(budget.charge("12345".to_string()), "12345");
        let truncated = budget.charge("abcdefgh".to_string());
        assert!(truncated.starts_with("abcde\n"));
        assert!(truncated.ends_with(BUDGET_NOTICE));
        assert!(budget.is_exhausted());
        assert_eq!(budget.charge("x".to_string()), BUDGET_NOTICE);
    }
}
