//! Per-bug retrieval index.
//!
//! Maps symbols and files of a checked-out working copy to source spans. An
//! index is built once per `(benchmark, project_id, revision)`, persisted as
//! `{project_id}-{revision}_index.json`, and never mutated afterwards; the
//! query tools in [`query`] only read from it.

pub mod builder;
pub mod extract;
pub mod query;
pub mod syntax;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IndexBuildError;

pub use builder::IndexBuilder;
pub use query::{Location, SymbolHit};

/// Bumped whenever the persisted layout changes.
pub const INDEX_VERSION: &str = "v1";

/// Languages the extractor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Java,
    Python,
    Rust,
}

impl Language {
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Language::Java => &["java"],
            Language::Python => &["py"],
            Language::Rust => &["rs"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Java => "java",
            Language::Python => "python",
            Language::Rust => "rust",
        }
    }
}

impl FromStr for Language {
    type Err = IndexBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "java" => Ok(Language::Java),
            "python" | "py" => Ok(Language::Python),
            "rust" | "rs" => Ok(Language::Rust),
            other => Err(IndexBuildError::UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Class,
    Interface,
    Enum,
    Record,
    Struct,
    Trait,
    Impl,
    Module,
    Function,
    Method,
    Constructor,
}

/// A declared symbol and the lines its declaration spans (1-based, inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDef {
    pub symbol: String,
    pub kind: SymbolKind,
    pub file: String,
    pub start: usize,
    pub end: usize,
    pub signature: String,
}

/// A call or use site of an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub name: String,
    pub file: String,
    pub line: usize,
    pub col: usize,
}

/// Shape of one indexed source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpan {
    pub line_count: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// The persisted index artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalIndex {
    pub index_version: String,
    pub benchmark: String,
    pub project_id: String,
    pub revision: String,
    pub language: Language,
    pub built_at: DateTime<Utc>,
    /// SHA-256 over everything except `built_at` and this field.
    pub content_hash: String,
    pub file_spans: BTreeMap<String, FileSpan>,
    pub symbol_table: Vec<SymbolDef>,
    pub references: Vec<Reference>,
}

impl RetrievalIndex {
    /// Deterministic key for `(project_id, revision)`.
    pub fn key(project_id: &str, revision: &str) -> String {
        format!("{project_id}-{revision}_index")
    }

    /// Hash of the structural content; equal for rebuilds of unchanged source.
    pub fn compute_content_hash(&self) -> String {
        let structural = (
            &self.index_version,
            &self.benchmark,
            &self.project_id,
            &self.revision,
            self.language,
            &self.file_spans,
            &self.symbol_table,
            &self.references,
        );
        let mut hasher = Sha256::new();
        match serde_json::to_vec(&structural) {
            Ok(bytes) => hasher.update(&bytes),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize index for hashing");
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn symbol_count(&self) -> usize {
        self.symbol_table.len()
    }
}

/// A loaded index bound to the working copy it describes.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    pub index: Arc<RetrievalIndex>,
    /// Location of the persisted artifact.
    pub path: PathBuf,
    pub working_copy: PathBuf,
    /// True when the handle came from an existing artifact instead of a build.
    pub cached: bool,
}

impl IndexHandle {
    pub fn content_hash(&self) -> &str {
        &self.index.content_hash
    }
}
