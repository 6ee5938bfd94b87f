//! Batch runs: many bugs, bounded parallelism.
//!
//! Bugs run in chunks of `parallel`, each on its own tokio task and its own
//! working copy. A bug list is YAML (or JSON) holding a list of
//! [`BugInstance`]s, or JSONL with one bug per line.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::{error, info};

use crate::controller::IterationController;
use crate::error::ConfigError;
use crate::oracle::BugInstance;
use crate::recorder::Outcome;

/// Runs one controller over a list of bugs.
#[derive(Clone)]
pub struct BatchRunner {
    controller: IterationController,
    parallel: usize,
}

impl BatchRunner {
    pub fn new(controller: IterationController, parallel: usize) -> Self {
        Self {
            controller,
            parallel: parallel.max(1),
        }
    }

    /// Outcomes in input order. A run whose task panicked has no outcome.
    pub async fn run(&self, bugs: Vec<BugInstance>) -> Vec<Outcome> {
        let total = bugs.len();
        let mut outcomes = Vec::with_capacity(total);

        for (chunk_no, chunk) in bugs.chunks(self.parallel).enumerate() {
            if self.controller.cancel_flag().is_cancelled() {
                info!(remaining = total - outcomes.len(), "Batch cancelled");
                break;
            }
            info!(chunk = chunk_no + 1, size = chunk.len(), done = outcomes.len(), total, "Starting chunk");

            let handles: Vec<_> = chunk
                .iter()
                .cloned()
                .map(|bug| {
                    let controller = self.controller.clone();
                    tokio::spawn(async move { controller.run(&bug).await })
                })
                .collect();

            for (bug, result) in chunk.iter().zip(futures::future::join_all(handles).await) {
                match result {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => error!(bug = %bug, error = %e, "Repair task aborted"),
                }
            }
        }

        outcomes
    }
}

/// Aggregate view of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub fixed: usize,
    pub by_verdict: BTreeMap<String, usize>,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            if outcome.fixed {
                summary.fixed += 1;
            }
            *summary
                .by_verdict
                .entry(outcome.terminal_verdict.to_string())
                .or_default() += 1;
        }
        summary
    }
}

/// Read a bug list.
pub fn load_bugs(path: &Path) -> Result<Vec<BugInstance>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        return content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    ConfigError::Invalid(format!("{}:{}: {}", path.display(), n + 1, e))
                })
            })
            .collect();
    }
    Ok(serde_yaml::from_str(&content)?)
}
