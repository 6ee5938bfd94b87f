//! Index construction and caching.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::extract::extract;
use super::{FileSpan, IndexHandle, Language, RetrievalIndex, INDEX_VERSION};
use crate::error::IndexBuildError;

/// Directories never indexed.
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    "target",
    "build",
    "node_modules",
    "__pycache__",
    ".gradle",
    ".idea",
    ".venv",
    "venv",
];

/// Files larger than this are recorded in `file_spans` but not parsed.
const MAX_PARSE_BYTES: u64 = 2 * 1024 * 1024;

/// Builds and caches retrieval indexes under one root directory.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    index_dir: PathBuf,
}

impl IndexBuilder {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
        }
    }

    /// Where the artifact for this key lives.
    pub fn index_path(&self, benchmark: &str, project_id: &str, revision: &str) -> PathBuf {
        self.index_dir
            .join(sanitize(benchmark))
            .join(format!(
                "{}.json",
                RetrievalIndex::key(&sanitize(project_id), &sanitize(revision))
            ))
    }

    /// Build the index for a working copy, or return the cached one.
    ///
    /// With `force == false` an existing, readable artifact for the same key
    /// and language is returned untouched. Otherwise the working copy is
    /// walked and a fresh artifact is written atomically.
    pub fn build(
        &self,
        working_copy: &Path,
        benchmark: &str,
        project_id: &str,
        revision: &str,
        language: &str,
        force: bool,
    ) -> Result<IndexHandle, IndexBuildError> {
        let language: Language = language.parse()?;

        let metadata = std::fs::metadata(working_copy).map_err(|e| IndexBuildError::WorkingCopy {
            path: working_copy.to_path_buf(),
            message: e.to_string(),
        })?;
        if !metadata.is_dir() {
            return Err(IndexBuildError::WorkingCopy {
                path: working_copy.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }

        let path = self.index_path(benchmark, project_id, revision);

        if !force && path.exists() {
            match load(&path) {
                Ok(index) if index.language == language && index.index_version == INDEX_VERSION => {
                    debug!(path = %path.display(), "Reusing cached retrieval index");
                    return Ok(IndexHandle {
                        index: Arc::new(index),
                        path,
                        working_copy: working_copy.to_path_buf(),
                        cached: true,
                    });
                }
                Ok(_) => {
                    info!(path = %path.display(), "Cached index is stale, rebuilding");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cached index unreadable, rebuilding");
                }
            }
        }

        let mut index = scan(working_copy, benchmark, project_id, revision, language)?;
        index.content_hash = index.compute_content_hash();
        persist(&path, &index)?;

        info!(
            project = project_id,
            revision = revision,
            language = %language,
            files = index.file_spans.len(),
            symbols = index.symbol_count(),
            references = index.references.len(),
            "Built retrieval index"
        );

        Ok(IndexHandle {
            index: Arc::new(index),
            path,
            working_copy: working_copy.to_path_buf(),
            cached: false,
        })
    }
}

/// Read a persisted index.
pub fn load(path: &Path) -> Result<RetrievalIndex, IndexBuildError> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| IndexBuildError::CorruptIndex {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// One safe path component: no separators, never empty, never `.` or `..`.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

/// Working-copy-relative path with forward slashes.
pub(crate) fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Every regular file under `root` outside VCS/build directories, sorted.
pub(crate) fn walk_files(root: &Path) -> Result<Vec<PathBuf>, IndexBuildError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && SKIP_DIRS.contains(&entry.file_name().to_string_lossy().as_ref()))
        });

    for entry in walker {
        let entry = entry.map_err(|e| IndexBuildError::Walk(e.to_string()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Files under `root` with one of `extensions`.
pub(crate) fn source_files(root: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, IndexBuildError> {
    Ok(walk_files(root)?
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| extensions.contains(&ext))
        })
        .collect())
}

fn scan(
    working_copy: &Path,
    benchmark: &str,
    project_id: &str,
    revision: &str,
    language: Language,
) -> Result<RetrievalIndex, IndexBuildError> {
    let mut file_spans = BTreeMap::new();
    let mut symbol_table = Vec::new();
    let mut references = Vec::new();

    for path in source_files(working_copy, language.extensions())? {
        let Some(rel) = relative_path(working_copy, &path) else {
            continue;
        };
        let bytes = std::fs::read(&path)?;
        let text = String::from_utf8_lossy(&bytes);

        file_spans.insert(
            rel.clone(),
            FileSpan {
                line_count: text.lines().count(),
                bytes: bytes.len() as u64,
                sha256: hex::encode(Sha256::digest(&bytes)),
            },
        );

        if bytes.len() as u64 > MAX_PARSE_BYTES {
            debug!(file = %rel, "Skipping symbol extraction for oversized file");
            continue;
        }

        let symbols = extract(language, &rel, &text);
        symbol_table.extend(symbols.defs);
        references.extend(symbols.refs);
    }

    Ok(RetrievalIndex {
        index_version: INDEX_VERSION.to_string(),
        benchmark: benchmark.to_string(),
        project_id: project_id.to_string(),
        revision: revision.to_string(),
        language,
        built_at: Utc::now(),
        content_hash: String::new(),
        file_spans,
        symbol_table,
        references,
    })
}

/// Write via a temp file in the same directory, then rename into place.
fn persist(path: &Path, index: &RetrievalIndex) -> Result<(), IndexBuildError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let json = serde_json::to_vec_pretty(index)?;
    tmp.write_all(&json)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| IndexBuildError::Io(e.error))?;
    Ok(())
}
