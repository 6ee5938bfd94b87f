//! Index-free localization: grep-like search and bounded file reads.

use std::path::Path;

use regex::Regex;
use serde::Serialize;

use crate::error::IndexQueryError;
use crate::index::builder::{relative_path, walk_files};
use crate::index::query::{is_safe_relative, number_lines};

/// Default window for `read_file` when no end line is given.
pub const DEFAULT_READ_WINDOW: usize = 200;

/// Lines longer than this are clipped in search output.
const MAX_HIT_LINE_CHARS: usize = 240;

/// Files larger than this are not searched.
const MAX_SEARCH_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub file: String,
    pub line: usize,
    pub text: String,
}

/// Search files under `root` for `pattern`.
///
/// The pattern is a regex; when it does not compile it is searched for
/// literally. `glob` restricts the files considered and is matched against
/// the relative path, or against the file name when it has no `/`.
pub fn search_in_files(
    root: &Path,
    pattern: &str,
    glob: Option<&str>,
    max_hits: usize,
) -> Result<Vec<SearchHit>, IndexQueryError> {
    let matcher = Regex::new(pattern).or_else(|_| Regex::new(&regex::escape(pattern)));
    let matcher = match matcher {
        Ok(re) => re,
        Err(_) => return Ok(Vec::new()),
    };
    let glob = glob.filter(|g| !g.trim().is_empty()).map(GlobMatcher::new);

    let files = walk_files(root).map_err(|e| IndexQueryError::Io(std::io::Error::other(e.to_string())))?;

    let mut hits = Vec::new();
    for path in files {
        if hits.len() >= max_hits {
            break;
        }
        let Some(rel) = relative_path(root, &path) else {
            continue;
        };
        if let Some(glob) = &glob {
            if !glob.matches(&rel) {
                continue;
            }
        }
        if std::fs::metadata(&path).map(|m| m.len() > MAX_SEARCH_BYTES).unwrap_or(true) {
            continue;
        }
        // Binary or non-UTF-8 files are skipped.
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (idx, line) in content.lines().enumerate() {
            if matcher.is_match(line) {
                hits.push(SearchHit {
                    file: rel.clone(),
                    line: idx + 1,
                    text: clip(line.trim_end()),
                });
                if hits.len() >= max_hits {
                    break;
                }
            }
        }
    }
    Ok(hits)
}

/// Read `path` (relative to `root`) between 1-based inclusive lines.
///
/// The range is clamped to the file: `start` below 1 becomes 1 and `end`
/// defaults to `start + 199`. Returns the numbered text and the effective
/// range.
pub fn read_file(
    root: &Path,
    path: &str,
    start: Option<usize>,
    end: Option<usize>,
) -> Result<(String, usize, usize), IndexQueryError> {
    let rel = path.trim().trim_start_matches("./");
    if !is_safe_relative(rel) {
        return Err(IndexQueryError::UnknownFile(path.to_string()));
    }
    let full = root.join(rel);
    if !full.is_file() {
        return Err(IndexQueryError::UnknownFile(path.to_string()));
    }
    let content = std::fs::read_to_string(&full)?;
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Ok((String::new(), 0, 0));
    }

    let start = start.unwrap_or(1).clamp(1, lines.len());
    let end = end
        .unwrap_or(start + DEFAULT_READ_WINDOW - 1)
        .clamp(start, lines.len());
    Ok((number_lines(&lines[start - 1..end], start), start, end))
}

fn clip(line: &str) -> String {
    if line.chars().count() <= MAX_HIT_LINE_CHARS {
        return line.to_string();
    }
    let mut clipped: String = line.chars().take(MAX_HIT_LINE_CHARS).collect();
    clipped.push_str("...");
    clipped
}

/// Shell-style glob: `**` crosses directories, `*` and `?` do not.
struct GlobMatcher {
    regex: Option<Regex>,
    by_name: bool,
}

impl GlobMatcher {
    fn new(glob: &str) -> Self {
        let glob = glob.trim().trim_start_matches("./");
        let mut pattern = String::from("^");
        let mut chars = glob.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        pattern.push_str("(?:.*/)?");
                    } else {
                        pattern.push_str(".*");
                    }
                }
                '*' => pattern.push_str("[^/]*"),
                '?' => pattern.push_str("[^/]"),
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');
        Self {
            regex: Regex::new(&pattern).ok(),
            by_name: !glob.contains('/'),
        }
    }

    fn matches(&self, rel: &str) -> bool {
        let Some(re) = &self.regex else {
            return false;
        };
        if self.by_name {
            let name = rel.rsplit('/').next().unwrap_or(rel);
            re.is_match(name)
        } else {
            re.is_match(rel)
        }
    }
}
