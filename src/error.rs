//! Error types for the gated repair loop.
//!
//! One enum per subsystem:
//! - Gate policy and configuration loading
//! - Retrieval index build and query
//! - Patch normalization and application
//! - Oracle (build/test) invocations
//! - LLM API interactions and the reasoning session
//! - Outcome persistence

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving gate policies or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown variant '{0}': expected one of G0, G1, G2, G3, G5, baseline, tdd, index, compile, full or custom:<flags>")]
    UnknownVariant(String),

    #[error("Unknown gate flag '{flag}' in variant '{variant}'")]
    UnknownFlag { variant: String, flag: String },

    #[error("Variant '{0}' names no gate flags: list some or write custom:none")]
    EmptyFlags(String),

    #[error("Variant file '{path}' is invalid: {message}")]
    VariantFile { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised while building (or loading) a retrieval index.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("Working copy '{path}' is missing or unreadable: {message}")]
    WorkingCopy { path: PathBuf, message: String },

    #[error("Unsupported language '{0}' for index build")]
    UnsupportedLanguage(String),

    #[error("Failed to walk working copy: {0}")]
    Walk(String),

    #[error("Cached index '{path}' is corrupt: {message}")]
    CorruptIndex { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the index query tools.
#[derive(Debug, Error)]
pub enum IndexQueryError {
    #[error("Span {start}-{end} is out of range for '{file}' ({line_count} lines)")]
    OutOfRange {
        file: String,
        start: usize,
        end: usize,
        line_count: usize,
    },

    #[error("File '{0}' is not part of the indexed working copy")]
    UnknownFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while normalizing or dry-running a proposed edit.
///
/// Every variant maps to the `patch-not-applicable` verdict.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Proposed edit is empty")]
    Empty,

    #[error("Malformed diff: {0}")]
    Malformed(String),

    #[error("Invalid structured edit: {0}")]
    InvalidEdit(String),

    #[error("Path '{0}' escapes the working copy")]
    PathEscape(String),

    #[error("Hunk does not apply to '{file}': {reason}")]
    NotApplicable { file: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by oracle adapter calls (checkout, compile, test runs).
#[derive(Debug, Error)]
pub enum OracleError {
    /// Infrastructure failure; retried with backoff before escalating.
    #[error("Transient oracle failure: {0}")]
    Transient(String),

    #[error("Oracle step '{step}' timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("Fatal oracle failure: {0}")]
    Fatal(String),
}

impl OracleError {
    pub fn is_transient(&self) -> bool {
        matches!(self, OracleError::Transient(_))
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Insufficient account balance: {0}")]
    InsufficientBalance(String),

    #[error("LLM call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether the error is an infrastructure hiccup worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("connection")
                    || msg.contains("temporarily")
            }
            LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Errors that end a reasoning session early.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// Errors raised while applying a patch to the working copy.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Oracle error during compile gate: {0}")]
    Oracle(#[from] OracleError),

    #[error("Failed to write working copy: {0}")]
    Io(#[from] std::io::Error),
}

/// Infrastructure failures while validating a patch. Negative test
/// outcomes are verdicts, never errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Working copy IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ApplyError> for PipelineError {
    fn from(err: ApplyError) -> Self {
        match err {
            ApplyError::Oracle(e) => PipelineError::Oracle(e),
            ApplyError::Io(e) => PipelineError::Io(e),
        }
    }
}

/// Errors raised while acquiring exclusive ownership of a working copy.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Working copy '{0}' is locked by another run")]
    Busy(PathBuf),

    #[error("Cannot open lock file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by outcome stores.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_transient_classification() {
        assert!(LlmError::RateLimited("slow down".to_string()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".to_string()
        }
        .is_transient());
        assert!(LlmError::RequestFailed("Connection refused".to_string()).is_transient());
        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!LlmError::InsufficientBalance("402".to_string()).is_transient());
        assert!(!LlmError::ParseError("garbage".to_string()).is_transient());
    }

    #[test]
    fn test_oracle_error_transient_classification() {
        assert!(OracleError::Transient("spawn failed".to_string()).is_transient());
        assert!(!OracleError::Fatal("no such bug".to_string()).is_transient());
        assert!(!OracleError::Timeout {
            step: "full_suite".to_string(),
            seconds: 10
        }
        .is_transient());
    }

    #[test]
    fn test_error_messages() {
        let err = IndexQueryError::OutOfRange {
            file: "src/Foo.java".to_string(),
            start: 10,
            end: 500,
            line_count: 42,
        };
        assert_eq!(
            err.to_string(),
            "Span 10-500 is out of range for 'src/Foo.java' (42 lines)"
        );

        let err = ConfigError::UnknownVariant("G9".to_string());
        assert!(err.to_string().starts_with("Unknown variant 'G9'"));
    }
}
