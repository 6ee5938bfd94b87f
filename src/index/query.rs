//! Read-only queries over a built index.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use super::{IndexHandle, SymbolDef, SymbolKind};
use crate::error::IndexQueryError;

/// A symbol matched by [`IndexHandle::symbol_lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolHit {
    pub symbol: String,
    pub kind: SymbolKind,
    pub file: String,
    pub start: usize,
    pub end: usize,
    pub score: u32,
}

/// A line range inside one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub start: usize,
    pub end: usize,
}

/// Canonical form of a user- or model-supplied symbol name.
///
/// `Foo::bar`, `Foo#bar` and `Foo.bar(int)` all become `Foo.bar`; a
/// repeated trailing segment (`Foo.Foo`) names the constructor.
pub fn normalize_query(raw: &str) -> String {
    let mut q = raw.trim().replace("::", ".").replace('#', ".");

    if q.ends_with(')') {
        if let Some(open) = q.find('(') {
            q.truncate(open);
        }
    }
    let mut q = q.trim().trim_end_matches('.').to_string();

    while q.contains("..<init>") {
        q = q.replace("..<init>", ".<init>");
    }

    let segments: Vec<&str> = q.split('.').collect();
    if segments.len() >= 2 {
        let last = segments[segments.len() - 1];
        let owner = segments[segments.len() - 2];
        let owner_simple = owner.rsplit('$').next().unwrap_or(owner);
        if !last.is_empty() && last == owner_simple {
            let mut rebuilt = segments[..segments.len() - 1].join(".");
            rebuilt.push_str(".<init>");
            return rebuilt;
        }
    }
    q
}

/// Last dotted segment, with Java `$` nesting treated as a separator.
fn last_segment(symbol: &str) -> &str {
    symbol
        .rsplit(['.', '$'])
        .next()
        .unwrap_or(symbol)
}

/// Relevance of `candidate` for a normalized query. Zero means no match.
pub fn score_symbol(query: &str, candidate: &str) -> u32 {
    if query.is_empty() {
        return 0;
    }
    let q_len = query.chars().count() as u32;
    let c_len = candidate.chars().count() as u32;

    if candidate == query {
        return 1000;
    }
    if candidate.ends_with(query) {
        return 800 + q_len.min(100);
    }
    if query.ends_with(candidate) {
        return 500 + c_len.min(50);
    }
    if candidate.contains(query) {
        return 300 + q_len.min(50);
    }
    if last_segment(candidate) == last_segment(query) {
        return 250;
    }
    0
}

/// Identifier that call sites of `symbol` use.
fn reference_name(symbol: &str) -> &str {
    let last = last_segment(symbol);
    if last != "<init>" {
        return last;
    }
    let owner = &symbol[..symbol.len() - "<init>".len()];
    last_segment(owner.trim_end_matches(['.', '$']))
}

pub(crate) fn is_safe_relative(file: &str) -> bool {
    let path = Path::new(file);
    !file.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

impl IndexHandle {
    /// Best-scoring symbols for `name`, at most `max_results` of them.
    pub fn symbol_lookup(&self, name: &str, max_results: usize) -> Vec<SymbolHit> {
        let query = normalize_query(name);
        let mut hits: Vec<SymbolHit> = self
            .index
            .symbol_table
            .iter()
            .filter_map(|def| {
                let score = score_symbol(&query, &def.symbol);
                (score > 0).then(|| hit(def, score))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.file.cmp(&b.file))
                .then_with(|| a.start.cmp(&b.start))
        });
        hits.truncate(max_results);
        hits
    }

    /// Recorded call/use sites of `symbol`'s last segment, in file order.
    pub fn find_references(&self, symbol: &str, max_results: usize) -> Vec<Location> {
        let normalized = normalize_query(symbol);
        let name = reference_name(&normalized);
        if name.is_empty() {
            return Vec::new();
        }

        let mut locations: Vec<Location> = self
            .index
            .references
            .iter()
            .filter(|r| r.name == name)
            .map(|r| Location {
                file: r.file.clone(),
                start: r.line,
                end: r.line,
            })
            .collect();
        locations.sort_by(|a, b| a.file.cmp(&b.file).then(a.start.cmp(&b.start)));
        locations.dedup();
        locations.truncate(max_results);
        locations
    }

    /// Lines `start..=end` of `file` (1-based), each prefixed with its number.
    pub fn read_span(&self, file: &str, start: usize, end: usize) -> Result<String, IndexQueryError> {
        let file = file.trim_start_matches("./");
        if !is_safe_relative(file) || !self.index.file_spans.contains_key(file) {
            return Err(IndexQueryError::UnknownFile(file.to_string()));
        }

        let content = std::fs::read_to_string(self.working_copy.join(file))?;
        let lines: Vec<&str> = content.lines().collect();

        if start == 0 || start > end || end > lines.len() {
            return Err(IndexQueryError::OutOfRange {
                file: file.to_string(),
                start,
                end,
                line_count: lines.len(),
            });
        }

        Ok(number_lines(&lines[start - 1..end], start))
    }

    /// Whether `file` is part of the index.
    pub fn contains_file(&self, file: &str) -> bool {
        self.index.file_spans.contains_key(file)
    }
}

fn hit(def: &SymbolDef, score: u32) -> SymbolHit {
    SymbolHit {
        symbol: def.symbol.clone(),
        kind: def.kind,
        file: def.file.clone(),
        start: def.start,
        end: def.end,
        score,
    }
}

/// Render lines with a right-aligned line-number gutter.
pub(crate) fn number_lines(lines: &[&str], first_line: usize) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:4}: {}", first_line + i, line))
        .collect::<Vec<_>>()
        .join("\n")
}
