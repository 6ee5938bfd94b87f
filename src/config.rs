//! Run configuration for the repair loop.
//!
//! `RepairConfig` is loaded from YAML (every field optional, falling back to
//! the defaults below) and then overridden by CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bounds applied to one reasoning session (one iteration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Information-gathering tool calls allowed before the session must
    /// finalize. `0` skips straight to the patch phase.
    pub max_tool_calls: usize,
    /// Hard cap on LLM turns across both phases, including turns that
    /// produced no tool call.
    pub max_llm_turns: usize,
    /// LLM calls in the localization phase, where information tools run.
    pub max_localization_calls: usize,
    /// LLM calls in the patch phase, where only `propose_patch` and
    /// `no_patch` are accepted. At least one.
    pub max_patch_calls: usize,
    /// Bytes of source text the localization tools may return per iteration.
    pub localization_byte_budget: usize,
    /// Maximum hits returned by `symbol_lookup` / `find_references`.
    pub max_symbol_results: usize,
    /// Maximum hits returned by `search_in_files`.
    pub max_search_hits: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_tool_calls: 12,
            max_llm_turns: 20,
            max_localization_calls: 16,
            max_patch_calls: 4,
            localization_byte_budget: 64 * 1024,
            max_symbol_results: 10,
            max_search_hits: 50,
        }
    }
}

/// Exponential backoff for transient LLM / oracle failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before `attempt` (0-based). Attempt 0 never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Configuration for repair runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Patch attempts per bug. `0` runs the oracle checks only.
    pub max_iters: u32,
    /// Model identifier passed to the LLM provider (empty = provider default).
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub session: SessionLimits,
    pub retry: RetryPolicy,
    /// Deadline for one LLM call.
    pub llm_timeout_secs: u64,
    /// Deadline for one oracle call (checkout, compile or a test run).
    pub oracle_timeout_secs: u64,
    /// Deadline for a whole bug run. `None` disables it.
    pub run_timeout_secs: Option<u64>,
    /// Root directory for persisted retrieval indexes.
    pub index_dir: PathBuf,
    /// Root directory for per-benchmark outcome stores.
    pub results_dir: PathBuf,
    /// Language used for index builds when the bug does not name one.
    pub default_language: String,
    /// Downgrade to text-search localization when the index cannot be built.
    pub fallback_on_index_failure: bool,
    /// Rebuild the retrieval index even if a cached one exists.
    pub force_index_rebuild: bool,
    /// Bytes of failing oracle output echoed back to the agent after a failed iteration.
    pub feedback_excerpt_bytes: usize,
    /// Patch candidates validated per iteration when the model offers several.
    pub max_candidates: usize,
    /// Stop early after this many consecutive iterations whose patch did not
    /// apply. `0` disables.
    pub max_apply_failures: u32,
    /// Stop early after this many iterations whose patch did not compile.
    /// `0` disables.
    pub max_compile_failures: u32,
    /// Stop early after this many consecutive rejected patches proposed
    /// without a single information tool call. `0` disables.
    pub max_consecutive_direct_patches: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_iters: 3,
            model: String::new(),
            temperature: 0.0,
            max_tokens: 4096,
            session: SessionLimits::default(),
            retry: RetryPolicy::default(),
            llm_timeout_secs: 300,
            oracle_timeout_secs: 1800,
            run_timeout_secs: None,
            index_dir: PathBuf::from("./indexes"),
            results_dir: PathBuf::from("./results"),
            default_language: "java".to_string(),
            fallback_on_index_failure: false,
            force_index_rebuild: false,
            feedback_excerpt_bytes: 4000,
            max_candidates: 3,
            max_apply_failures: 5,
            max_compile_failures: 5,
            max_consecutive_direct_patches: 5,
        }
    }
}

impl RepairConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file. Missing fields take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run unable to terminate or to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_llm_turns == 0 {
            return Err(ConfigError::Invalid(
                "session.max_llm_turns must be at least 1".to_string(),
            ));
        }
        if self.session.max_patch_calls == 0 {
            return Err(ConfigError::Invalid(
                "session.max_patch_calls must be at least 1".to_string(),
            ));
        }
        if self.max_candidates == 0 {
            return Err(ConfigError::Invalid(
                "max_candidates must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        Ok(())
    }

    /// Sets the iteration budget.
    pub fn with_max_iters(mut self, max_iters: u32) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the per-session limits.
    pub fn with_session_limits(mut self, limits: SessionLimits) -> Self {
        self.session = limits;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the index directory.
    pub fn with_index_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.index_dir = dir.into();
        self
    }

    /// Sets the results directory.
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Sets the LLM call deadline.
    pub fn with_llm_timeout(mut self, secs: u64) -> Self {
        self.llm_timeout_secs = secs;
        self
    }

    /// Sets the oracle call deadline.
    pub fn with_oracle_timeout(mut self, secs: u64) -> Self {
        self.oracle_timeout_secs = secs;
        self
    }

    /// Sets the whole-run deadline.
    pub fn with_run_timeout(mut self, secs: u64) -> Self {
        self.run_timeout_secs = Some(secs);
        self
    }

    /// Enables fallback to text-search localization on index build failure.
    pub fn with_index_fallback(mut self, fallback: bool) -> Self {
        self.fallback_on_index_failure = fallback;
        self
    }

    /// Sets how many patch candidates one iteration may validate.
    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    /// Sets the consecutive not-applicable limit.
    pub fn with_max_apply_failures(mut self, limit: u32) -> Self {
        self.max_apply_failures = limit;
        self
    }

    /// Sets the compile failure limit.
    pub fn with_max_compile_failures(mut self, limit: u32) -> Self {
        self.max_compile_failures = limit;
        self
    }

    /// Sets the consecutive direct-patch limit.
    pub fn with_max_consecutive_direct_patches(mut self, limit: u32) -> Self {
        self.max_consecutive_direct_patches = limit;
        self
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_config_defaults() {
        let config = RepairConfig::default();
        assert_eq!(config.max_iters, 3);
        assert_eq!(config.session.max_tool_calls, 12);
        assert_eq!(config.session.max_symbol_results, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.default_language, "java");
        assert!(!config.fallback_on_index_failure);
        assert!(config.run_timeout_secs.is_none());
        assert_eq!(config.session.max_patch_calls, 4);
        assert_eq!(config.max_candidates, 3);
        assert_eq!(config.max_apply_failures, 5);
        assert_eq!(config.max_compile_failures, 5);
    }

    #[test]
    fn test_repair_config_builder() {
        let config = RepairConfig::new()
            .with_max_iters(0)
            .with_model("deepseek-chat")
            .with_llm_timeout(30)
            .with_run_timeout(600)
            .with_index_fallback(true);

        assert_eq!(config.max_iters, 0);
        assert_eq!(config.model, "deepseek-chat");
        assert_eq!(config.llm_timeout(), Duration::from_secs(30));
        assert_eq!(config.run_timeout_secs, Some(600));
        assert!(config.fallback_on_index_failure);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
max_iters: 5
session:
  max_tool_calls: 4
retry:
  base_delay_ms: 10
"#;
        let config = RepairConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_iters, 5);
        assert_eq!(config.session.max_tool_calls, 4);
        assert_eq!(config.session.max_llm_turns, 20);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 10);
        assert_eq!(config.oracle_timeout_secs, 1800);
    }

    #[test]
    fn test_yaml_rejects_invalid_values() {
        assert!(RepairConfig::from_yaml_str("temperature: 3.5").is_err());
        assert!(RepairConfig::from_yaml_str("retry:\n  max_attempts: 0").is_err());
        assert!(RepairConfig::from_yaml_str("max_iters: [1, 2]").is_err());
        assert!(RepairConfig::from_yaml_str("session:\n  max_patch_calls: 0").is_err());
        assert!(RepairConfig::from_yaml_str("max_candidates: 0").is_err());
        // A zero tool budget is valid: the session goes straight to patching.
        assert!(RepairConfig::from_yaml_str("session:\n  max_tool_calls: 0").is_ok());
        assert!(RepairConfig::from_yaml_str("max_apply_failures: 0").is_ok());
    }

    #[test]
    fn test_retry_delays_double() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 1000,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }
}
