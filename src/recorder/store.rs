//! Outcome stores.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;
use tracing::debug;

use super::Outcome;
use crate::error::RecorderError;

/// Append-only sink for run outcomes.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn append(&self, outcome: &Outcome) -> Result<(), RecorderError>;
}

/// Writes one JSON line per outcome to `<dir>/<benchmark>.jsonl`.
///
/// Appends take an exclusive file lock so concurrent runs, in this process
/// or another, never interleave lines.
#[derive(Debug, Clone)]
pub struct JsonlResultStore {
    dir: PathBuf,
}

impl JsonlResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, benchmark: &str) -> PathBuf {
        let name: String = benchmark
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.jsonl"))
    }

    /// Every outcome stored for `benchmark`, oldest first.
    pub fn read_all(&self, benchmark: &str) -> Result<Vec<Outcome>, RecorderError> {
        let path = self.path_for(benchmark);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(RecorderError::from))
            .collect()
    }
}

fn append_line(path: &Path, line: &[u8]) -> Result<(), RecorderError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let written = file.write_all(line).and_then(|_| file.flush());
    let unlocked = FileExt::unlock(&file);
    written?;
    unlocked?;
    Ok(())
}

#[async_trait]
impl ResultStore for JsonlResultStore {
    async fn append(&self, outcome: &Outcome) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(outcome)?;
        line.push(b'\n');
        let path = self.path_for(&outcome.benchmark);
        debug!(path = %path.display(), run_id = %outcome.run_id, "Appending outcome");

        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|e| RecorderError::Io(std::io::Error::other(e.to_string())))?
    }
}

/// In-memory store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    outcomes: Mutex<Vec<Outcome>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn append(&self, outcome: &Outcome) -> Result<(), RecorderError> {
        if let Ok(mut guard) = self.outcomes.lock() {
            guard.push(outcome.clone());
        }
        Ok(())
    }
}
