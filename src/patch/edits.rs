//! Structured line edits.
//!
//! ```json
//! [{"path": "src/Foo.java",
//!   "ops": [{"type": "replace", "start_line": 10, "end_line": 12, "text": "..."},
//!           {"type": "insert", "start_line": 15, "text": "..."},
//!           {"type": "delete", "start_line": 20, "end_line": 22}]}]
//! ```
//!
//! Line numbers refer to the file as it is before any op runs. Edits are
//! turned into hunks against the current file contents so they go through
//! the same dry-run and apply path as a unified diff.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::diff::{validate_path, FilePatch, Hunk, HunkLine};
use crate::error::PatchError;

/// Context lines around each generated hunk.
const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub ops: Vec<EditOp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EditOp {
    Replace {
        start_line: usize,
        #[serde(default)]
        end_line: Option<usize>,
        #[serde(default)]
        text: String,
    },
    Insert {
        start_line: usize,
        #[serde(default)]
        text: String,
    },
    Delete {
        start_line: usize,
        #[serde(default)]
        end_line: Option<usize>,
    },
}

/// Old-side range `[start, end)` (0-based) and its replacement.
#[derive(Debug)]
struct Splice {
    start: usize,
    end: usize,
    replacement: Vec<String>,
}

/// Accept a list, `{"edits": [...]}`, or either of those encoded as a string.
pub fn parse_edits(value: &Value) -> Result<Vec<FileEdit>, PatchError> {
    let value = match value {
        Value::String(s) => serde_json::from_str::<Value>(s)
            .map_err(|e| PatchError::InvalidEdit(format!("edits are not valid JSON: {e}")))?,
        other => other.clone(),
    };
    let list = match value {
        Value::Object(mut map) => map
            .remove("edits")
            .ok_or_else(|| PatchError::InvalidEdit("expected a list of file edits".to_string()))?,
        other => other,
    };
    let edits: Vec<FileEdit> = serde_json::from_value(list)
        .map_err(|e| PatchError::InvalidEdit(e.to_string()))?;
    if edits.is_empty() {
        return Err(PatchError::Empty);
    }
    Ok(edits)
}

fn text_lines(text: &str) -> Vec<String> {
    text.replace("\r\n", "\n").lines().map(str::to_string).collect()
}

fn to_splice(op: &EditOp, line_count: usize) -> Result<Splice, PatchError> {
    let range = |start: usize, end: Option<usize>| -> Result<(usize, usize), PatchError> {
        let end = end.unwrap_or(start);
        if start == 0 || start > end || end > line_count {
            return Err(PatchError::InvalidEdit(format!(
                "lines {start}-{end} are outside the file ({line_count} lines)"
            )));
        }
        Ok((start - 1, end))
    };

    match op {
        EditOp::Replace {
            start_line,
            end_line,
            text,
        } => {
            let (start, end) = range(*start_line, *end_line)?;
            Ok(Splice {
                start,
                end,
                replacement: text_lines(text),
            })
        }
        EditOp::Delete {
            start_line,
            end_line,
        } => {
            let (start, end) = range(*start_line, *end_line)?;
            Ok(Splice {
                start,
                end,
                replacement: Vec::new(),
            })
        }
        EditOp::Insert { start_line, text } => {
            if *start_line == 0 || *start_line > line_count + 1 {
                return Err(PatchError::InvalidEdit(format!(
                    "insert position {start_line} is outside the file ({line_count} lines)"
                )));
            }
            let replacement = text_lines(text);
            if replacement.is_empty() {
                return Err(PatchError::InvalidEdit("insert with empty text".to_string()));
            }
            Ok(Splice {
                start: start_line - 1,
                end: start_line - 1,
                replacement,
            })
        }
    }
}

/// Build the hunks that turn `current` into the edited file.
pub fn edit_to_file_patch(edit: &FileEdit, current: &str) -> Result<FilePatch, PatchError> {
    validate_path(&edit.path)?;
    if edit.ops.is_empty() {
        return Err(PatchError::InvalidEdit(format!("no ops for '{}'", edit.path)));
    }

    let normalized = current.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.lines().collect();

    let mut splices = edit
        .ops
        .iter()
        .map(|op| to_splice(op, lines.len()))
        .collect::<Result<Vec<_>, _>>()?;
    splices.sort_by_key(|s| (s.start, s.end));
    for pair in splices.windows(2) {
        if pair[0].end > pair[1].start {
            return Err(PatchError::InvalidEdit(format!(
                "overlapping ops in '{}' at line {}",
                edit.path,
                pair[1].start + 1
            )));
        }
    }

    // Group splices close enough to share context.
    let mut groups: Vec<Vec<&Splice>> = Vec::new();
    for splice in &splices {
        match groups.last_mut() {
            Some(group)
                if group
                    .last()
                    .is_some_and(|prev| splice.start - prev.end <= 2 * CONTEXT_LINES) =>
            {
                group.push(splice)
            }
            _ => groups.push(vec![splice]),
        }
    }

    let mut hunks = Vec::new();
    for group in groups {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let ctx_start = first.start.saturating_sub(CONTEXT_LINES);
        let ctx_end = (last.end + CONTEXT_LINES).min(lines.len());

        let mut body = Vec::new();
        let mut cursor = ctx_start;
        for splice in &group {
            body.extend(lines[cursor..splice.start].iter().map(|l| HunkLine::Context(l.to_string())));
            body.extend(lines[splice.start..splice.end].iter().map(|l| HunkLine::Remove(l.to_string())));
            body.extend(splice.replacement.iter().cloned().map(HunkLine::Add));
            cursor = splice.end;
        }
        body.extend(lines[cursor..ctx_end].iter().map(|l| HunkLine::Context(l.to_string())));

        let hunk = Hunk {
            anchor: ctx_start,
            lines: drop_noop_pairs(body),
        };
        if hunk.has_changes() {
            hunks.push(hunk);
        }
    }

    if hunks.is_empty() {
        return Err(PatchError::InvalidEdit(format!(
            "edits leave '{}' unchanged",
            edit.path
        )));
    }

    Ok(FilePatch {
        old_path: Some(edit.path.clone()),
        new_path: Some(edit.path.clone()),
        hunks,
    })
}

/// Turn a run of `-x` immediately followed by an identical `+x` into
/// context, so replacing a line with itself is not a change.
fn drop_noop_pairs(body: Vec<HunkLine>) -> Vec<HunkLine> {
    let mut out: Vec<HunkLine> = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let removes = body[i..]
            .iter()
            .take_while(|l| matches!(l, HunkLine::Remove(_)))
            .count();
        if removes == 0 {
            out.push(body[i].clone());
            i += 1;
            continue;
        }

        let adds = body[i + removes..]
            .iter()
            .take_while(|l| matches!(l, HunkLine::Add(_)))
            .count();
        let identical = removes == adds
            && (0..removes).all(|k| body[i + k].content() == body[i + removes + k].content());

        if identical {
            out.extend(
                body[i..i + removes]
                    .iter()
                    .map(|l| HunkLine::Context(l.content().to_string())),
            );
        } else {
            out.extend(body[i..i + removes + adds].iter().cloned());
        }
        i += removes + adds;
    }
    out
}
