//! Shell-command oracle configured from YAML.
//!
//! ```yaml
//! checkout: "defects4j checkout -p {project} -v {bug}b -w {workdir}"
//! compile: "defects4j compile -w {workdir}"
//! trigger_tests: "defects4j test -w {workdir} -r"
//! relevant_tests: "defects4j test -w {workdir} -r"
//! full_suite: "defects4j test -w {workdir}"
//! ```
//!
//! Commands run through `sh -c` inside the working copy. They are not
//! sandboxed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{BugInstance, CompileReport, OracleAdapter, TestReport, TestStatus};
use crate::error::{ConfigError, OracleError};
use crate::policy::GatePolicy;

const DEFAULT_MARKER_PATTERN: &str = r"^(PASS|FAIL|ERROR)\s*[:\s]\s*(\S+)";

fn default_shell() -> String {
    "sh".to_string()
}

fn default_marker_regex() -> String {
    DEFAULT_MARKER_PATTERN.to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

/// Commands for one benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOracleConfig {
    /// Omit when working copies are prepared out of band.
    #[serde(default)]
    pub checkout: Option<String>,
    /// Omit to treat every patch as compiling.
    #[serde(default)]
    pub compile: Option<String>,
    pub trigger_tests: String,
    /// Falls back to `full_suite` when absent.
    #[serde(default)]
    pub relevant_tests: Option<String>,
    pub full_suite: String,
    /// Regex with two groups: status (`PASS|FAIL|ERROR`) and test name.
    #[serde(default = "default_marker_regex")]
    pub test_marker_regex: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl CommandOracleConfig {
    pub fn new(trigger_tests: impl Into<String>, full_suite: impl Into<String>) -> Self {
        Self {
            checkout: None,
            compile: None,
            trigger_tests: trigger_tests.into(),
            relevant_tests: None,
            full_suite: full_suite.into(),
            test_marker_regex: default_marker_regex(),
            shell: default_shell(),
            env: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_compile(mut self, command: impl Into<String>) -> Self {
        self.compile = Some(command.into());
        self
    }

    pub fn with_checkout(mut self, command: impl Into<String>) -> Self {
        self.checkout = Some(command.into());
        self
    }

    pub fn with_relevant_tests(mut self, command: impl Into<String>) -> Self {
        self.relevant_tests = Some(command.into());
        self
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Reject a compile gate that has no compile command to run.
    pub fn check_policy(&self, policy: &GatePolicy) -> Result<(), ConfigError> {
        if policy.compile_gate && self.compile.is_none() {
            return Err(ConfigError::Invalid(format!(
                "variant {policy} enables the compile gate but the oracle has no compile command"
            )));
        }
        Ok(())
    }
}

/// Output of one finished command.
#[derive(Debug, Clone)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// [`OracleAdapter`] backed by shell commands.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    config: CommandOracleConfig,
    marker: Regex,
}

impl CommandOracle {
    pub fn new(config: CommandOracleConfig) -> Result<Self, ConfigError> {
        let marker = Regex::new(&format!("(?m){}", config.test_marker_regex)).map_err(|e| {
            ConfigError::Invalid(format!(
                "test_marker_regex '{}': {}",
                config.test_marker_regex, e
            ))
        })?;
        if config.compile.is_none() {
            warn!("Oracle has no compile command; every patch will count as compiling");
        }
        Ok(Self { config, marker })
    }

    pub fn config(&self) -> &CommandOracleConfig {
        &self.config
    }

    fn render(template: &str, bug: &BugInstance, workdir: &Path) -> String {
        template
            .replace("{workdir}", &workdir.display().to_string())
            .replace("{project}", &bug.project_id)
            .replace("{bug}", &bug.bug_id)
            .replace("{benchmark}", &bug.benchmark)
    }

    async fn run(
        &self,
        step: &str,
        template: &str,
        bug: &BugInstance,
        workdir: &Path,
    ) -> Result<CommandOutput, OracleError> {
        let command_line = Self::render(template, bug, workdir);
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c").arg(&command_line);
        if workdir.is_dir() {
            cmd.current_dir(workdir);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(step = step, command = %command_line, "Running oracle command");
        let start = Instant::now();

        let child = cmd.spawn().map_err(|e| {
            OracleError::Transient(format!("Failed to spawn '{}': {}", self.config.shell, e))
        })?;

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(OracleError::Transient(format!("Process error: {e}"))),
            Err(_) => {
                return Err(OracleError::Timeout {
                    step: step.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        };

        if output.status.code().is_none() {
            return Err(OracleError::Transient(format!(
                "Oracle step '{step}' was terminated by a signal"
            )));
        }

        info!(
            step = step,
            exit_code = output.status.code().unwrap_or(-1),
            duration_ms = start.elapsed().as_millis() as u64,
            "Oracle command finished"
        );

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Turn marker lines into a report; without markers the exit status
    /// decides a single synthetic test named after the step.
    fn parse_report(&self, step: &str, output: &CommandOutput) -> TestReport {
        let raw = output.combined();
        let mut results = BTreeMap::new();

        for caps in self.marker.captures_iter(&raw) {
            let (Some(status), Some(name)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let status = if status.as_str().eq_ignore_ascii_case("PASS") {
                TestStatus::Pass
            } else {
                TestStatus::Fail
            };
            // A test reported more than once counts as failing if any report failed.
            results
                .entry(name.as_str().to_string())
                .and_modify(|s| {
                    if status == TestStatus::Fail {
                        *s = TestStatus::Fail;
                    }
                })
                .or_insert(status);
        }

        if results.is_empty() {
            let status = if output.success {
                TestStatus::Pass
            } else {
                TestStatus::Fail
            };
            results.insert(step.to_string(), status);
        }

        TestReport::new(results, raw)
    }

    async fn run_tests(
        &self,
        step: &str,
        template: &str,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        let output = self.run(step, template, bug, working_copy).await?;
        Ok(self.parse_report(step, &output))
    }
}

#[async_trait]
impl OracleAdapter for CommandOracle {
    async fn checkout(&self, bug: &BugInstance) -> Result<PathBuf, OracleError> {
        let workdir = bug.working_copy_path.clone();
        let Some(template) = &self.config.checkout else {
            if workdir.is_dir() {
                return Ok(workdir);
            }
            return Err(OracleError::Fatal(format!(
                "Working copy '{}' does not exist and no checkout command is configured",
                workdir.display()
            )));
        };

        let output = self.run("checkout", template, bug, &workdir).await?;
        if !output.success {
            return Err(OracleError::Fatal(format!(
                "Checkout of {} failed: {}",
                bug.label(),
                output.combined().trim()
            )));
        }
        Ok(workdir)
    }

    async fn run_trigger_tests(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        self.run_tests("trigger_tests", &self.config.trigger_tests, bug, working_copy)
            .await
    }

    async fn run_relevant_tests(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        let template = self
            .config
            .relevant_tests
            .as_deref()
            .unwrap_or(&self.config.full_suite);
        self.run_tests("relevant_tests", template, bug, working_copy)
            .await
    }

    async fn run_full_suite(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<TestReport, OracleError> {
        self.run_tests("full_suite", &self.config.full_suite, bug, working_copy)
            .await
    }

    async fn compile(
        &self,
        bug: &BugInstance,
        working_copy: &Path,
    ) -> Result<CompileReport, OracleError> {
        let Some(template) = &self.config.compile else {
            return Ok(CompileReport::passed());
        };
        let output = self.run("compile", template, bug, working_copy).await?;
        Ok(CompileReport {
            passed: output.success,
            diagnostics: output.combined(),
        })
    }
}
