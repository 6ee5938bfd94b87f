//! Dry-run, apply and rollback against a working copy.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::diff::{fingerprint, normalize_patch, FilePatch, Hunk, HunkLine, UnifiedDiff};
use super::edits::{edit_to_file_patch, FileEdit};
use crate::error::{ApplyError, PatchError};
use crate::oracle::{BugInstance, GuardedOracle};

/// What the reasoning session proposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProposedEdit {
    /// Unified diff text, possibly wrapped in markdown.
    Diff { text: String },
    /// Structured line edits.
    Edits { edits: Vec<FileEdit> },
}

/// One of possibly several alternative patches offered in a single
/// proposal. Candidates are validated in the order given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchCandidate {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub edit: ProposedEdit,
}

impl PatchCandidate {
    /// The only candidate of a plain proposal.
    pub fn single(edit: ProposedEdit) -> Self {
        Self {
            id: 1,
            strategy: None,
            edit,
        }
    }
}

/// New contents of one file; `None` means the file is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub after: Option<String>,
}

/// A patch that passed the dry run and can be written.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub canonical: String,
    pub fingerprint: String,
    pub changes: Vec<FileChange>,
}

impl PatchPlan {
    pub fn touched_files(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.path.clone()).collect()
    }
}

/// Pre-patch bytes of every touched file (`None` for files the patch created).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    root: PathBuf,
    entries: Vec<(String, Option<Vec<u8>>)>,
}

impl Snapshot {
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AppliedPatch {
    pub canonical: String,
    pub fingerprint: String,
    pub touched_files: Vec<String>,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub enum ApplyResult {
    Applied(AppliedPatch),
    NotApplicable {
        reason: String,
    },
    /// The compile gate failed; the working copy is already rolled back.
    CompileFailed {
        canonical: String,
        fingerprint: String,
        diagnostics: String,
    },
}

/// Line-oriented view of a text file that remembers its line endings.
struct TextFile {
    lines: Vec<String>,
    crlf: bool,
    trailing_newline: bool,
}

impl TextFile {
    fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_string).collect(),
            crlf: content.contains("\r\n"),
            trailing_newline: content.is_empty() || content.ends_with('\n'),
        }
    }

    fn render(&self, lines: &[String]) -> String {
        if lines.is_empty() {
            return String::new();
        }
        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut out = lines.join(eol);
        if self.trailing_newline {
            out.push_str(eol);
        }
        out
    }
}

/// How a hunk's old side was found in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Exact,
    Offset,
    Whitespace,
}

fn matches_at(lines: &[String], expected: &[&str], pos: usize, loose: bool) -> bool {
    expected.iter().enumerate().all(|(k, want)| {
        let have = lines[pos + k].as_str();
        if loose {
            have.trim_end() == want.trim_end()
        } else {
            have == *want
        }
    })
}

/// Exact at `anchor`, then exact at the nearest offset, then the same two
/// searches ignoring trailing whitespace. Never matches before `min_pos`.
fn locate(
    lines: &[String],
    expected: &[&str],
    anchor: usize,
    min_pos: usize,
) -> Option<(usize, MatchKind)> {
    if expected.is_empty() {
        return Some((anchor.clamp(min_pos, lines.len().max(min_pos)), MatchKind::Exact));
    }
    if expected.len() > lines.len() {
        return None;
    }
    let max_pos = lines.len() - expected.len();
    if min_pos > max_pos {
        return None;
    }
    let anchor = anchor.clamp(min_pos, max_pos);

    for loose in [false, true] {
        if matches_at(lines, expected, anchor, loose) {
            let kind = if loose { MatchKind::Whitespace } else { MatchKind::Exact };
            return Some((anchor, kind));
        }
        let reach = (anchor - min_pos).max(max_pos - anchor);
        for d in 1..=reach {
            let candidates = [anchor.checked_sub(d), Some(anchor + d)];
            for pos in candidates.into_iter().flatten() {
                if pos >= min_pos && pos <= max_pos && matches_at(lines, expected, pos, loose) {
                    let kind = if loose { MatchKind::Whitespace } else { MatchKind::Offset };
                    return Some((pos, kind));
                }
            }
        }
    }
    None
}

/// Applies normalized patches to one working copy.
#[derive(Debug, Clone)]
pub struct PatchStage {
    working_copy: PathBuf,
}

impl PatchStage {
    pub fn new(working_copy: impl Into<PathBuf>) -> Self {
        Self {
            working_copy: working_copy.into(),
        }
    }

    pub fn working_copy(&self) -> &Path {
        &self.working_copy
    }

    fn read_existing(&self, rel: &str) -> Result<Option<String>, PatchError> {
        let path = self.working_copy.join(rel);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| PatchError::NotApplicable {
                file: rel.to_string(),
                reason: "file is not valid UTF-8".to_string(),
            })
    }

    /// Normalize a proposal into a canonical diff.
    pub fn normalize(&self, edit: &ProposedEdit) -> Result<UnifiedDiff, PatchError> {
        match edit {
            ProposedEdit::Diff { text } => normalize_patch(text),
            ProposedEdit::Edits { edits } => {
                if edits.is_empty() {
                    return Err(PatchError::Empty);
                }
                let mut files = Vec::with_capacity(edits.len());
                for edit in edits {
                    let current = self.read_existing(&edit.path)?.ok_or_else(|| {
                        PatchError::InvalidEdit(format!("file not found: {}", edit.path))
                    })?;
                    files.push(edit_to_file_patch(edit, &current)?);
                }
                UnifiedDiff { files }.normalize()
            }
        }
    }

    /// Dry-run a proposal against in-memory copies of the touched files.
    /// Nothing on disk changes.
    pub fn plan(&self, edit: &ProposedEdit) -> Result<PatchPlan, PatchError> {
        let diff = self.normalize(edit)?;

        let mut relocated = Vec::with_capacity(diff.files.len());
        let mut changes = Vec::with_capacity(diff.files.len());
        for file in &diff.files {
            let (patched, change) = self.dry_run_file(file)?;
            relocated.push(patched);
            changes.push(change);
        }

        let canonical = UnifiedDiff { files: relocated }.render();
        let fingerprint = fingerprint(&canonical);
        debug!(
            files = changes.len(),
            fingerprint = %&fingerprint[..12],
            "Patch dry run succeeded"
        );
        Ok(PatchPlan {
            canonical,
            fingerprint,
            changes,
        })
    }

    fn dry_run_file(&self, file: &FilePatch) -> Result<(FilePatch, FileChange), PatchError> {
        let rel = file.path().to_string();
        let not_applicable = |reason: String| PatchError::NotApplicable {
            file: rel.clone(),
            reason,
        };
        let existing = self.read_existing(&rel)?;

        if file.is_creation() {
            if existing.is_some() {
                return Err(not_applicable("file already exists".to_string()));
            }
            if file.hunks.iter().any(|h| h.old_count() > 0) {
                return Err(not_applicable(
                    "new file hunks may only add lines".to_string(),
                ));
            }
            let lines: Vec<String> = file
                .hunks
                .iter()
                .flat_map(|h| h.new_lines())
                .map(str::to_string)
                .collect();
            let content = TextFile::parse("").render(&lines);
            return Ok((
                file.clone(),
                FileChange {
                    path: rel,
                    after: Some(content),
                },
            ));
        }

        let Some(content) = existing else {
            return Err(not_applicable("file does not exist".to_string()));
        };
        let text = TextFile::parse(&content);

        let mut out: Vec<String> = Vec::with_capacity(text.lines.len());
        let mut hunks = Vec::with_capacity(file.hunks.len());
        let mut cursor = 0usize;
        let mut drift: isize = 0;

        for hunk in &file.hunks {
            let expected = hunk.old_lines();
            let wanted = (hunk.anchor as isize + drift).max(0) as usize;
            let (pos, kind) = locate(&text.lines, &expected, wanted, cursor).ok_or_else(|| {
                not_applicable(format!(
                    "hunk at line {} does not match the file",
                    hunk.anchor + 1
                ))
            })?;
            if kind != MatchKind::Exact {
                debug!(file = %rel, stated = hunk.anchor + 1, found = pos + 1, ?kind, "Hunk relocated");
            }
            drift = pos as isize - hunk.anchor as isize;

            out.extend(text.lines[cursor..pos].iter().cloned());

            // Context and removed lines take the file's own text.
            let mut k = pos;
            let mut lines = Vec::with_capacity(hunk.lines.len());
            for line in &hunk.lines {
                match line {
                    HunkLine::Context(_) => {
                        out.push(text.lines[k].clone());
                        lines.push(HunkLine::Context(text.lines[k].clone()));
                        k += 1;
                    }
                    HunkLine::Remove(_) => {
                        lines.push(HunkLine::Remove(text.lines[k].clone()));
                        k += 1;
                    }
                    HunkLine::Add(s) => {
                        out.push(s.clone());
                        lines.push(HunkLine::Add(s.clone()));
                    }
                }
            }
            cursor = k;
            hunks.push(Hunk { anchor: pos, lines });
        }
        out.extend(text.lines[cursor..].iter().cloned());

        let after = if file.is_deletion() {
            if !out.is_empty() {
                return Err(not_applicable(
                    "deletion does not cover the whole file".to_string(),
                ));
            }
            None
        } else {
            Some(text.render(&out))
        };

        Ok((
            FilePatch {
                old_path: file.old_path.clone(),
                new_path: file.new_path.clone(),
                hunks,
            },
            FileChange { path: rel, after },
        ))
    }

    /// Write a planned patch; with a compile gate, compile right away and
    /// roll back if it fails.
    pub async fn apply(
        &self,
        plan: PatchPlan,
        compile_gate: Option<(&GuardedOracle, &BugInstance)>,
    ) -> Result<ApplyResult, ApplyError> {
        let snapshot = self.take_snapshot(&plan)?;

        if let Err(e) = self.write_changes(&plan) {
            warn!(error = %e, "Failed writing patch, rolling back");
            self.rollback(&snapshot)?;
            return Err(ApplyError::Io(e));
        }

        if let Some((oracle, bug)) = compile_gate {
            let report = match oracle.compile(bug, &self.working_copy).await {
                Ok(report) => report,
                Err(e) => {
                    self.rollback(&snapshot)?;
                    return Err(ApplyError::Oracle(e));
                }
            };
            if !report.passed {
                info!(files = plan.changes.len(), "Compile gate failed, rolling back patch");
                self.rollback(&snapshot)?;
                return Ok(ApplyResult::CompileFailed {
                    canonical: plan.canonical,
                    fingerprint: plan.fingerprint,
                    diagnostics: report.diagnostics,
                });
            }
        }

        let touched_files = plan.touched_files();
        info!(files = ?touched_files, "Patch applied");
        Ok(ApplyResult::Applied(AppliedPatch {
            canonical: plan.canonical,
            fingerprint: plan.fingerprint,
            touched_files,
            snapshot,
        }))
    }

    /// Plan and apply in one call; dry-run failures become `NotApplicable`.
    pub async fn apply_proposed(
        &self,
        edit: &ProposedEdit,
        compile_gate: Option<(&GuardedOracle, &BugInstance)>,
    ) -> Result<ApplyResult, ApplyError> {
        match self.plan(edit) {
            Ok(plan) => self.apply(plan, compile_gate).await,
            Err(e) => Ok(ApplyResult::NotApplicable {
                reason: e.to_string(),
            }),
        }
    }

    /// Capture the current bytes of every file `plan` touches.
    pub fn take_snapshot(&self, plan: &PatchPlan) -> std::io::Result<Snapshot> {
        let mut entries = Vec::with_capacity(plan.changes.len());
        for change in &plan.changes {
            let path = self.working_copy.join(&change.path);
            let before = if path.is_file() {
                Some(std::fs::read(&path)?)
            } else {
                None
            };
            entries.push((change.path.clone(), before));
        }
        Ok(Snapshot {
            root: self.working_copy.clone(),
            entries,
        })
    }

    fn write_changes(&self, plan: &PatchPlan) -> std::io::Result<()> {
        for change in &plan.changes {
            let path = self.working_copy.join(&change.path);
            match &change.after {
                Some(content) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, content)?;
                }
                None => std::fs::remove_file(&path)?,
            }
        }
        Ok(())
    }

    /// Restore every file in `snapshot` to its pre-patch state.
    pub fn rollback(&self, snapshot: &Snapshot) -> std::io::Result<()> {
        for (rel, before) in snapshot.entries.iter().rev() {
            let path = snapshot.root.join(rel);
            match before {
                Some(bytes) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, bytes)?;
                }
                None => {
                    if path.exists() {
                        std::fs::remove_file(&path)?;
                    }
                }
            }
        }
        debug!(files = snapshot.entries.len(), "Rolled back working copy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::OracleError;
    use crate::oracle::{CompileReport, OracleAdapter, TestReport};
    use crate::patch::edits::EditOp;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const CALC: &str = "class Calc {\n    int add(int a, int b) {\n        return a - b;\n    }\n}\n";
    const FIX: &str = "--- a/Calc.java\n+++ b/Calc.java\n@@ -2,3 +2,3 @@\n     int add(int a, int b) {\n-        return a - b;\n+        return a + b;\n     }\n";

    fn working_copy(content: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("Calc.java"), content).unwrap();
        tmp
    }

    fn diff(text: &str) -> ProposedEdit {
        ProposedEdit::Diff {
            text: text.to_string(),
        }
    }

    fn read(dir: &TempDir, rel: &str) -> String {
        std::fs::read_to_string(dir.path().join(rel)).unwrap()
    }

    struct CompileOnly {
        passes: bool,
    }

    #[async_trait]
    impl OracleAdapter for CompileOnly {
        async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError> {
            Ok(bug.working_copy_path.clone())
        }
        async fn run_trigger_tests(&self, _: &BugInstance, _: &Path) -> Result<TestReport, OracleError> {
            Ok(TestReport::default())
        }
        async fn run_relevant_tests(&self, _: &BugInstance, _: &Path) -> Result<TestReport, OracleError> {
            Ok(TestReport::default())
        }
        async fn run_full_suite(&self, _: &BugInstance, _: &Path) -> Result<TestReport, OracleError> {
            Ok(TestReport::default())
        }
        async fn compile(&self, _: &BugInstance, _: &Path) -> Result<CompileReport, OracleError> {
            Ok(if self.passes {
                CompileReport::passed()
            } else {
                CompileReport::failed("Calc.java:3: error: ';' expected")
            })
        }
    }

    fn oracle(passes: bool) -> GuardedOracle {
        GuardedOracle::new(
            Arc::new(CompileOnly { passes }),
            RetryPolicy::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_apply_and_rollback() {
        let wc = working_copy(CALC);
        let stage = PatchStage::new(wc.path());

        let result = stage.apply_proposed(&diff(FIX), None).await.unwrap();
        let ApplyResult::Applied(applied) = result else {
            panic!("expected applied, got {result:?}");
        };
        assert_eq!(applied.touched_files, vec!["Calc.java"]);
        assert!(read(&wc, "Calc.java").contains("return a + b;"));

        stage.rollback(&applied.snapshot).unwrap();
        assert_eq!(read(&wc, "Calc.java"), CALC);
    }

    #[tokio::test]
    async fn test_not_applicable_leaves_files_untouched() {
        let wc = working_copy(CALC);
        let stage = PatchStage::new(wc.path());
        let bad = FIX.replace("return a - b;", "return a * b;");

        let result = stage.apply_proposed(&diff(&bad), None).await.unwrap();
        assert!(matches!(result, ApplyResult::NotApplicable { .. }));
        assert_eq!(read(&wc, "Calc.java"), CALC);
    }

    #[test]
    fn test_dry_run_tolerates_offset_and_trailing_whitespace() {
        let shifted = format!("// header\n// more\n{}", CALC.replace("a - b;", "a - b;   "));
        let wc = working_copy(&shifted);
        let stage = PatchStage::new(wc.path());

        let plan = stage.plan(&diff(FIX)).unwrap();
        assert!(plan.canonical.contains("@@ -4,3 +4,3 @@"));
        assert!(plan.canonical.contains("-        return a - b;   \n"));
        let after = plan.changes[0].after.as_deref().unwrap();
        assert!(after.starts_with("// header\n// more\nclass Calc {"));
        assert!(after.contains("return a + b;\n"));
    }

    #[tokio::test]
    async fn test_crlf_is_preserved() {
        let wc = working_copy(&CALC.replace('\n', "\r\n"));
        let stage = PatchStage::new(wc.path());

        stage.apply_proposed(&diff(FIX), None).await.unwrap();
        let content = read(&wc, "Calc.java");
        assert!(content.contains("return a + b;\r\n"));
        assert_eq!(content.matches('\n').count(), content.matches("\r\n").count());
    }

    #[tokio::test]
    async fn test_normalized_diff_round_trip() {
        let wc = working_copy(CALC);
        let stage = PatchStage::new(wc.path());
        let fenced = format!("Fix:\n```diff\n{FIX}```\n");
        let ApplyResult::Applied(applied) = stage.apply_proposed(&diff(&fenced), None).await.unwrap()
        else {
            panic!("patch should apply");
        };

        let pristine = working_copy(CALC);
        let replay = PatchStage::new(pristine.path());
        replay.apply_proposed(&diff(&applied.canonical), None).await.unwrap();

        assert_eq!(read(&pristine, "Calc.java"), read(&wc, "Calc.java"));
        let again = replay.plan(&diff(&applied.canonical));
        assert!(again.is_err(), "canonical diff must not apply twice");
    }

    #[tokio::test]
    async fn test_create_and_delete_files() {
        let wc = working_copy(CALC);
        let stage = PatchStage::new(wc.path());
        let patch = "--- /dev/null\n+++ b/util/Helper.java\n@@ -0,0 +1,1 @@\n+class Helper {}\n--- a/Calc.java\n+++ /dev/null\n@@ -1,5 +0,0 @@\n-class Calc {\n-    int add(int a, int b) {\n-        return a - b;\n-    }\n-}\n";

        let ApplyResult::Applied(applied) = stage.apply_proposed(&diff(patch), None).await.unwrap()
        else {
            panic!("patch should apply");
        };
        assert_eq!(read(&wc, "util/Helper.java"), "class Helper {}\n");
        assert!(!wc.path().join("Calc.java").exists());

        stage.rollback(&applied.snapshot).unwrap();
        assert!(!wc.path().join("util/Helper.java").exists());
        assert_eq!(read(&wc, "Calc.java"), CALC);
    }

    #[tokio::test]
    async fn test_structured_edits_match_equivalent_diff() {
        let wc = working_copy(CALC);
        let stage = PatchStage::new(wc.path());
        let edits = ProposedEdit::Edits {
            edits: vec![FileEdit {
                path: "Calc.java".to_string(),
                ops: vec![EditOp::Replace {
                    start_line: 3,
                    end_line: None,
                    text: "        return a + b;".to_string(),
                }],
            }],
        };

        let from_edits = stage.plan(&edits).unwrap();
        let from_diff = stage.plan(&diff(FIX)).unwrap();
        assert_eq!(from_edits.changes, from_diff.changes);
    }

    #[tokio::test]
    async fn test_compile_gate_rolls_back() {
        let wc = working_copy(CALC);
        let stage = PatchStage::new(wc.path());
        let bug = BugInstance::new("b", "Calc", "1", wc.path());

        let failing = oracle(false);
        let result = stage
            .apply_proposed(&diff(FIX), Some((&failing, &bug)))
            .await
            .unwrap();
        let ApplyResult::CompileFailed { diagnostics, .. } = result else {
            panic!("expected compile failure");
        };
        assert!(diagnostics.contains("';' expected"));
        assert_eq!(read(&wc, "Calc.java"), CALC);
        assert_eq!(failing.counters().compiles, 1);

        let passing = oracle(true);
        let result = stage
            .apply_proposed(&diff(FIX), Some((&passing, &bug)))
            .await
            .unwrap();
        assert!(matches!(result, ApplyResult::Applied(_)));
    }
}
