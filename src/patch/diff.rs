//! Unified diff parsing and canonical rendering.
//!
//! Model output is cleaned (markdown fences and prose dropped, CRLF folded),
//! parsed into [`UnifiedDiff`], and rendered back in one canonical form:
//! `a/`/`b/` prefixes, files sorted by path, hunks sorted by position and
//! headers recomputed from the hunk bodies. Equivalent edits therefore
//! render to the same text and share a [`fingerprint`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::PatchError;

/// A single line in a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl HunkLine {
    pub fn content(&self) -> &str {
        match self {
            HunkLine::Context(s) | HunkLine::Add(s) | HunkLine::Remove(s) => s,
        }
    }

    fn prefix(&self) -> char {
        match self {
            HunkLine::Context(_) => ' ',
            HunkLine::Add(_) => '+',
            HunkLine::Remove(_) => '-',
        }
    }
}

/// One hunk. `anchor` is the 0-based index of the first old-side line the
/// hunk covers (for hunks without old-side lines, the index it inserts at).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub anchor: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines the hunk expects to find (context + removed).
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Add(_)))
            .map(HunkLine::content)
            .collect()
    }

    /// Lines the hunk leaves behind (context + added).
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| !matches!(l, HunkLine::Remove(_)))
            .map(HunkLine::content)
            .collect()
    }

    pub fn old_count(&self) -> usize {
        self.lines.iter().filter(|l| !matches!(l, HunkLine::Add(_))).count()
    }

    pub fn new_count(&self) -> usize {
        self.lines.iter().filter(|l| !matches!(l, HunkLine::Remove(_))).count()
    }

    pub fn has_changes(&self) -> bool {
        self.lines.iter().any(|l| !matches!(l, HunkLine::Context(_)))
    }

    /// (added, removed)
    pub fn stats(&self) -> (usize, usize) {
        let added = self.lines.iter().filter(|l| matches!(l, HunkLine::Add(_))).count();
        let removed = self.lines.iter().filter(|l| matches!(l, HunkLine::Remove(_))).count();
        (added, removed)
    }
}

/// All hunks for one file. `None` on a side means `/dev/null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// Working-copy-relative path the patch touches.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }
}

/// A parsed, normalized multi-file diff.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnifiedDiff {
    pub files: Vec<FilePatch>,
}

impl UnifiedDiff {
    pub fn touched_files(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path().to_string()).collect()
    }

    pub fn stats(&self) -> (usize, usize) {
        self.files
            .iter()
            .flat_map(|f| f.hunks.iter())
            .fold((0, 0), |acc, h| {
                let (a, r) = h.stats();
                (acc.0 + a, acc.1 + r)
            })
    }

    /// Sort files and hunks, merge duplicate file sections and reject
    /// overlapping hunks.
    pub fn normalize(self) -> Result<Self, PatchError> {
        let mut by_path: BTreeMap<String, FilePatch> = BTreeMap::new();
        for file in self.files {
            match by_path.get_mut(file.path()) {
                Some(existing) => {
                    if existing.old_path != file.old_path || existing.new_path != file.new_path {
                        return Err(PatchError::Malformed(format!(
                            "conflicting sections for '{}'",
                            file.path()
                        )));
                    }
                    existing.hunks.extend(file.hunks);
                }
                None => {
                    by_path.insert(file.path().to_string(), file);
                }
            }
        }

        let mut files = Vec::with_capacity(by_path.len());
        for (path, mut file) in by_path {
            file.hunks.sort_by_key(|h| h.anchor);
            for pair in file.hunks.windows(2) {
                if pair[0].anchor + pair[0].old_count() > pair[1].anchor {
                    return Err(PatchError::Malformed(format!(
                        "overlapping hunks in '{path}'"
                    )));
                }
            }
            files.push(file);
        }
        Ok(Self { files })
    }

    /// Render in canonical form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            let old = file
                .old_path
                .as_ref()
                .map(|p| format!("a/{p}"))
                .unwrap_or_else(|| "/dev/null".to_string());
            let new = file
                .new_path
                .as_ref()
                .map(|p| format!("b/{p}"))
                .unwrap_or_else(|| "/dev/null".to_string());
            let _ = writeln!(out, "--- {old}");
            let _ = writeln!(out, "+++ {new}");

            let mut delta: isize = 0;
            for hunk in &file.hunks {
                let old_count = hunk.old_count();
                let new_count = hunk.new_count();
                let old_start = if old_count > 0 { hunk.anchor + 1 } else { hunk.anchor };
                let new_anchor = (hunk.anchor as isize + delta).max(0) as usize;
                let new_start = if new_count > 0 { new_anchor + 1 } else { new_anchor };
                let _ = writeln!(
                    out,
                    "@@ -{},{} +{},{} @@",
                    old_start, old_count, new_start, new_count
                );
                for line in &hunk.lines {
                    let _ = writeln!(out, "{}{}", line.prefix(), line.content());
                }
                delta += new_count as isize - old_count as isize;
            }
        }
        out
    }
}

/// SHA-256 (hex) of a canonical diff.
pub fn fingerprint(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\n(.*?)```").expect("Invalid fence regex")
    })
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("Invalid hunk header regex")
    })
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // A bare `...` is code (Python's Ellipsis), so an elision needs a
        // comment marker or trailing words.
        Regex::new(
            r"^\s*(?:(?://|#|/\*|<!--)\s*(?:\.\.\.|…)\s*(?:[A-Za-z][A-Za-z ]*(?:\.\.\.|…)?)?|(?:\.\.\.|…)\s*[A-Za-z][A-Za-z ]*(?:\.\.\.|…)?)\s*(?:\*/|-->)?\s*$",
        )
        .expect("Invalid placeholder regex")
    })
}

/// Strip markdown fences and surrounding prose from model output and fold
/// CRLF to LF.
pub fn clean_patch_text(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");

    let looks_like_diff = |s: &str| s.contains("--- ") && s.contains("@@");
    let body = fence_re()
        .captures_iter(&text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .find(|block| looks_like_diff(block))
        .unwrap_or(text);

    let lines: Vec<&str> = body.lines().collect();
    let start = lines
        .iter()
        .position(|l| l.starts_with("diff --git") || l.starts_with("--- "))
        .unwrap_or(0);

    let mut cleaned = lines[start..].join("\n");
    if !cleaned.is_empty() {
        cleaned.push('\n');
    }
    cleaned
}

fn strip_side(raw: &str, prefix: &str) -> Result<Option<String>, PatchError> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" {
        return Ok(None);
    }
    let path = path.strip_prefix(prefix).unwrap_or(path);
    validate_path(path)?;
    Ok(Some(path.to_string()))
}

/// Reject paths that are empty, absolute, or climb out of the working copy.
pub fn validate_path(path: &str) -> Result<(), PatchError> {
    if path.is_empty() {
        return Err(PatchError::Malformed("empty file path".to_string()));
    }
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(PatchError::PathEscape(path.to_string()));
    }
    Ok(())
}

fn is_file_header(lines: &[&str], i: usize) -> bool {
    lines[i].starts_with("--- ") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ "))
}

/// Parse cleaned diff text. The result is not yet normalized.
pub fn parse_unified_diff(text: &str) -> Result<UnifiedDiff, PatchError> {
    if text.trim().is_empty() {
        return Err(PatchError::Empty);
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if !is_file_header(&lines, i) {
            if lines[i].starts_with("@@") {
                return Err(PatchError::Malformed(
                    "hunk found before any file header".to_string(),
                ));
            }
            i += 1;
            continue;
        }

        let old_path = strip_side(&lines[i][4..], "a/")?;
        let new_path = strip_side(&lines[i + 1][4..], "b/")?;
        i += 2;

        match (&old_path, &new_path) {
            (None, None) => {
                return Err(PatchError::Malformed("both sides are /dev/null".to_string()))
            }
            (Some(old), Some(new)) if old != new => {
                return Err(PatchError::Malformed(format!(
                    "renames are not supported ({old} -> {new})"
                )))
            }
            _ => {}
        }

        let mut hunks = Vec::new();
        while i < lines.len() && !is_file_header(&lines, i) && !lines[i].starts_with("diff --git") {
            if lines[i].starts_with("@@") {
                let (hunk, next) = parse_hunk(&lines, i)?;
                hunks.push(hunk);
                i = next;
            } else {
                i += 1;
            }
        }

        if hunks.is_empty() {
            return Err(PatchError::Malformed(format!(
                "no hunks for '{}'",
                new_path.as_deref().or(old_path.as_deref()).unwrap_or_default()
            )));
        }

        files.push(FilePatch {
            old_path,
            new_path,
            hunks,
        });
    }

    if files.is_empty() {
        return Err(PatchError::Malformed("no file headers found".to_string()));
    }
    Ok(UnifiedDiff { files })
}

fn parse_hunk(lines: &[&str], header_idx: usize) -> Result<(Hunk, usize), PatchError> {
    let header = lines[header_idx];
    let caps = hunk_header_re()
        .captures(header)
        .ok_or_else(|| PatchError::Malformed(format!("invalid hunk header: {header}")))?;
    let number = |idx: usize, default: usize| -> usize {
        caps.get(idx)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default)
    };
    let old_start = number(1, 0);
    let old_count = number(2, 1);
    let new_count = number(4, 1);

    let mut body = Vec::new();
    let mut i = header_idx + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("@@") || line.starts_with("diff --git") || is_file_header(lines, i) {
            break;
        }
        if line.starts_with('\\') {
            i += 1;
            continue;
        }
        let parsed = if let Some(rest) = line.strip_prefix('+') {
            HunkLine::Add(rest.to_string())
        } else if let Some(rest) = line.strip_prefix('-') {
            HunkLine::Remove(rest.to_string())
        } else if let Some(rest) = line.strip_prefix(' ') {
            HunkLine::Context(rest.to_string())
        } else if line.is_empty() {
            HunkLine::Context(String::new())
        } else {
            // Trailing prose after the last hunk.
            break;
        };
        body.push(parsed);
        i += 1;
    }

    let mut hunk = Hunk {
        anchor: 0,
        lines: body,
    };

    // Blank lines after a hunk are usually separators, not context.
    while (hunk.old_count() > old_count || hunk.new_count() > new_count)
        && matches!(hunk.lines.last(), Some(HunkLine::Context(s)) if s.is_empty())
    {
        hunk.lines.pop();
    }

    if hunk.old_count() != old_count || hunk.new_count() != new_count {
        return Err(PatchError::Malformed(format!(
            "hunk header '{}' does not match its body (-{} +{})",
            header,
            hunk.old_count(),
            hunk.new_count()
        )));
    }
    if !hunk.has_changes() {
        return Err(PatchError::Malformed(format!("hunk '{header}' changes nothing")));
    }
    if let Some(line) = hunk
        .lines
        .iter()
        .find(|l| placeholder_re().is_match(l.content()))
    {
        return Err(PatchError::Malformed(format!(
            "placeholder line '{}' in hunk '{}'",
            line.content().trim(),
            header
        )));
    }

    hunk.anchor = if old_count > 0 {
        old_start.saturating_sub(1)
    } else {
        old_start
    };
    Ok((hunk, i))
}

/// Clean, parse and normalize model output in one step.
pub fn normalize_patch(raw: &str) -> Result<UnifiedDiff, PatchError> {
    let cleaned = clean_patch_text(raw);
    if cleaned.trim().is_empty() {
        return Err(PatchError::Empty);
    }
    parse_unified_diff(&cleaned)?.normalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "--- a/src/Calc.java\n+++ b/src/Calc.java\n@@ -2,3 +2,3 @@\n int add(int a, int b) {\n-    return a - b;\n+    return a + b;\n }\n";

    #[test]
    fn test_parse_simple_diff() {
        let diff = parse_unified_diff(SIMPLE).unwrap();
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.files[0].path(), "src/Calc.java");
        assert_eq!(diff.files[0].hunks[0].anchor, 1);
        assert_eq!(diff.stats(), (1, 1));
    }

    #[test]
    fn test_render_is_canonical() {
        let diff = normalize_patch(SIMPLE).unwrap();
        assert_eq!(diff.render(), SIMPLE);
    }

    #[test]
    fn test_clean_strips_fences_and_prose() {
        let raw = "Here is the fix:\r\n\r\n```diff\r\n--- a/src/Calc.java\r\n+++ b/src/Calc.java\r\n@@ -2,3 +2,3 @@\r\n int add(int a, int b) {\r\n-    return a - b;\r\n+    return a + b;\r\n }\r\n```\r\nThis should work.";
        assert_eq!(clean_patch_text(raw), SIMPLE);

        let unfenced = format!("I changed the operator.\n{SIMPLE}");
        assert_eq!(clean_patch_text(&unfenced), SIMPLE);
    }

    #[test]
    fn test_paths_without_prefix_and_timestamps() {
        let raw = "--- src/Calc.java\t2024-01-01\n+++ src/Calc.java\t2024-01-02\n@@ -2,3 +2,3 @@\n int add(int a, int b) {\n-    return a - b;\n+    return a + b;\n }\n";
        assert_eq!(normalize_patch(raw).unwrap().render(), SIMPLE);
    }

    #[test]
    fn test_new_start_is_recomputed_and_hunks_sorted() {
        let raw = "--- a/f.txt\n+++ b/f.txt\n@@ -10,1 +99,2 @@\n-j\n+j1\n+j2\n@@ -2,1 +40,2 @@\n b\n+b2\n";
        let rendered = normalize_patch(raw).unwrap().render();
        assert_eq!(
            rendered,
            "--- a/f.txt\n+++ b/f.txt\n@@ -2,1 +2,2 @@\n b\n+b2\n@@ -10,1 +11,2 @@\n-j\n+j1\n+j2\n"
        );
    }

    #[test]
    fn test_files_sorted_by_path() {
        let raw = "--- a/z.txt\n+++ b/z.txt\n@@ -1,1 +1,1 @@\n-z\n+Z\n--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-a\n+A\n";
        let diff = normalize_patch(raw).unwrap();
        assert_eq!(diff.touched_files(), vec!["a.txt", "z.txt"]);
    }

    #[test]
    fn test_trailing_blank_line_is_tolerated() {
        let raw = format!("{SIMPLE}\n\n");
        assert_eq!(normalize_patch(&raw).unwrap().render(), SIMPLE);
    }

    #[test]
    fn test_rejects_mismatched_counts() {
        let raw = "--- a/f.txt\n+++ b/f.txt\n@@ -1,5 +1,6 @@\n a\n-b\n+c\n";
        assert!(matches!(normalize_patch(raw), Err(PatchError::Malformed(_))));
    }

    #[test]
    fn test_rejects_placeholders() {
        let raw = "--- a/f.txt\n+++ b/f.txt\n@@ -1,3 +1,3 @@\n a\n-b\n+c\n // ... existing code ...\n";
        let err = normalize_patch(raw).unwrap_err();
        assert!(err.to_string().contains("placeholder"), "{err}");

        let varargs = "--- a/f.java\n+++ b/f.java\n@@ -1,1 +1,1 @@\n-void f(String... args) {}\n+void g(String... args) {}\n";
        assert!(normalize_patch(varargs).is_ok());

        let elided = "--- a/f.py\n+++ b/f.py\n@@ -1,3 +1,3 @@\n def f():\n-    return 1\n+    return 2\n ... rest unchanged ...\n";
        assert!(matches!(normalize_patch(elided), Err(PatchError::Malformed(_))));
        let commented = "--- a/f.py\n+++ b/f.py\n@@ -1,3 +1,3 @@\n def f():\n-    return 1\n+    return 2\n # ...\n";
        assert!(matches!(normalize_patch(commented), Err(PatchError::Malformed(_))));
    }

    #[test]
    fn test_python_ellipsis_is_code() {
        let raw = "--- a/shapes.py\n+++ b/shapes.py\n@@ -1,3 +1,3 @@\n class Shape:\n-    def area(self):\n+    def area(self) -> float:\n         ...\n";
        let patch = normalize_patch(raw).unwrap();
        assert!(patch.render().contains("         ...\n"));
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(normalize_patch("   "), Err(PatchError::Empty)));
        assert!(matches!(
            normalize_patch("just some prose"),
            Err(PatchError::Malformed(_))
        ));
        assert!(matches!(
            normalize_patch("--- a/../etc/passwd\n+++ b/../etc/passwd\n@@ -1,1 +1,1 @@\n-x\n+y\n"),
            Err(PatchError::PathEscape(_))
        ));
        assert!(matches!(
            normalize_patch("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n b\n"),
            Err(PatchError::Malformed(_))
        ));
        assert!(matches!(
            normalize_patch("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n-a\n+b\n c\n@@ -2,1 +2,1 @@\n-c\n+d\n"),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn test_creation_and_deletion() {
        let raw = "--- /dev/null\n+++ b/src/New.java\n@@ -0,0 +1,2 @@\n+class New {\n+}\n";
        let diff = normalize_patch(raw).unwrap();
        assert!(diff.files[0].is_creation());
        assert_eq!(diff.files[0].hunks[0].anchor, 0);
        assert_eq!(diff.render(), raw);

        let raw = "--- a/src/Old.java\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-class Old {}\n";
        let diff = normalize_patch(raw).unwrap();
        assert!(diff.files[0].is_deletion());
        assert_eq!(diff.render(), raw);
    }

    #[test]
    fn test_fingerprint_identifies_equivalent_edits() {
        let a = normalize_patch(SIMPLE).unwrap().render();
        let b = normalize_patch(&format!("```diff\n{SIMPLE}```")).unwrap().render();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
        assert_ne!(fingerprint(&a), fingerprint(&a.replace("a + b", "b + a")));
    }
}
