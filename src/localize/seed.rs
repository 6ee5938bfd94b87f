//! Initial localization from failing test output.
//!
//! Stack frames in the RED-check (or baseline) output are resolved against
//! the working copy and turned into spans around the reported line.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::LocalizedSpan;
use crate::index::builder::{relative_path, walk_files};

fn java_frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^():\s]+\.java):(\d+)\)").expect("Invalid java frame regex"))
}

fn python_frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"File "([^"]+\.py)", line (\d+)"#).expect("Invalid python frame regex"))
}

fn rust_frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"((?:[\w.\-]+/)*[\w.\-]+\.rs):(\d+):\d+").expect("Invalid rust frame regex")
    })
}

/// Lines of context kept on each side of a frame.
pub const SEED_RADIUS: usize = 10;

/// At most this many frames are turned into spans.
pub const MAX_SEED_SPANS: usize = 8;

/// Spans for the source locations mentioned in `output`, in order of first
/// appearance. Frames that do not resolve to a file in the working copy
/// (JDK classes, site-packages, the standard library) are skipped.
pub fn seed_from_output(output: &str, working_copy: &Path) -> Vec<LocalizedSpan> {
    let frames = collect_frames(output);
    if frames.is_empty() {
        return Vec::new();
    }

    let files: Vec<String> = match walk_files(working_copy) {
        Ok(paths) => paths
            .iter()
            .filter_map(|p| relative_path(working_copy, p))
            .collect(),
        Err(e) => {
            debug!(error = %e, "Cannot walk working copy for seeding");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut spans = Vec::new();
    for (raw, line) in frames {
        let Some(file) = resolve(&raw, working_copy, &files) else {
            continue;
        };
        if !seen.insert((file.clone(), line)) {
            continue;
        }
        let start = line.saturating_sub(SEED_RADIUS).max(1);
        spans.push(LocalizedSpan::new(
            file,
            start,
            line + SEED_RADIUS,
            format!("stack frame at line {line} in failing test output"),
        ));
        if spans.len() >= MAX_SEED_SPANS {
            break;
        }
    }
    spans
}

/// `(path-as-written, line)` pairs in order of appearance.
fn collect_frames(output: &str) -> Vec<(String, usize)> {
    let mut frames = Vec::new();
    for line in output.lines() {
        for re in [java_frame_re(), python_frame_re(), rust_frame_re()] {
            for caps in re.captures_iter(line) {
                if let Ok(n) = caps[2].parse::<usize>() {
                    if n > 0 {
                        frames.push((caps[1].to_string(), n));
                    }
                }
            }
        }
    }
    frames
}

/// Map a path as it appears in a trace to a working-copy relative path.
///
/// Exact relative and absolute-under-root paths win; otherwise the path is
/// matched as a suffix, preferring main sources over tests and then the
/// shortest candidate.
fn resolve(raw: &str, working_copy: &Path, files: &[String]) -> Option<String> {
    let raw_path = Path::new(raw);
    if raw_path.is_absolute() {
        if let Some(rel) = relative_path(working_copy, raw_path) {
            if files.contains(&rel) {
                return Some(rel);
            }
        }
    }
    let normalized = raw.trim_start_matches("./").replace('\\', "/");
    if files.contains(&normalized) {
        return Some(normalized);
    }

    let suffix = format!("/{}", normalized.trim_start_matches('/'));
    let mut candidates: Vec<&String> = files
        .iter()
        .filter(|f| f.ends_with(&suffix) || **f == normalized)
        .collect();
    candidates.sort_by_key(|f| (!is_main_source(f), f.len()));
    candidates.first().map(|f| (*f).clone())
}

fn is_main_source(path: &str) -> bool {
    path.contains("src/main/") || !(path.contains("/test/") || path.starts_with("test"))
}
