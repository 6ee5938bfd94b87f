//! Index-free tools: text search and file reads over the working copy.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Tool, ToolContext, ToolError, ToolResult};
use crate::localize::{read_file, search_in_files, LocalizedSpan};

#[derive(Debug, Deserialize)]
struct SearchParams {
    pattern: String,
    glob: Option<String>,
    max_hits: Option<usize>,
}

/// Grep-like search across the working copy.
pub struct SearchInFilesTool;

#[async_trait]
impl Tool for SearchInFilesTool {
    fn name(&self) -> &str {
        "search_in_files"
    }

    fn description(&self) -> &str {
        "Search project files for a regex (searched literally if it is not a valid regex). Optionally restrict files with a glob such as '*.java' or 'src/**/*.py'. Returns file:line: text for each hit."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string", "description": "Regex or literal text" },
                "glob": { "type": "string", "description": "File filter (optional)" },
                "max_hits": { "type": "integer", "minimum": 1 }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let params: SearchParams = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        if params.pattern.is_empty() {
            return Err(ToolError::InvalidParameters("pattern cannot be empty".to_string()));
        }
        let max_hits = params
            .max_hits
            .unwrap_or(ctx.limits.max_search_hits)
            .clamp(1, ctx.limits.max_search_hits.max(1));

        let root = ctx.working_copy.clone();
        let pattern = params.pattern.clone();
        let glob = params.glob.clone();
        let hits = tokio::task::spawn_blocking(move || {
            search_in_files(&root, &pattern, glob.as_deref(), max_hits)
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
        .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        debug!(pattern = %params.pattern, hits = hits.len(), "search_in_files");
        if hits.is_empty() {
            return Ok(ToolResult::success(format!("No matches for '{}'.", params.pattern)));
        }

        let mut output = hits
            .iter()
            .map(|h| format!("{}:{}: {}", h.file, h.line, h.text))
            .collect::<Vec<_>>()
            .join("\n");
        if hits.len() >= max_hits {
            output.push_str(&format!("\n[stopped after {max_hits} hits]"));
        }
        Ok(ctx.charged(output, Vec::new()))
    }
}

#[derive(Debug, Deserialize)]
struct ReadFileParams {
    path: String,
    start_line: Option<usize>,
    end_line: Option<usize>,
}

/// Read a window of a file with line numbers.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file with line numbers. start_line defaults to 1 and end_line to start_line + 199; the range is clamped to the file."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the project root" },
                "start_line": { "type": "integer", "minimum": 1 },
                "end_line": { "type": "integer", "minimum": 1 }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let params: ReadFileParams = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;

        match read_file(&ctx.working_copy, &params.path, params.start_line, params.end_line) {
            Ok((_, 0, 0)) => Ok(ToolResult::success(format!("{} is empty.", params.path))),
            Ok((text, start, end)) => {
                let path = params.path.trim().trim_start_matches("./");
                Ok(ctx.charged(text, vec![LocalizedSpan::new(path, start, end, "read by agent")]))
            }
            Err(e) => Ok(ToolResult::failure(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionLimits;
    use tempfile::TempDir;

    fn context(budget: usize) -> (TempDir, ToolContext) {
        let wc = TempDir::new().unwrap();
        std::fs::create_dir_all(wc.path().join("src")).unwrap();
        std::fs::write(
            wc.path().join("src/calc.py"),
            "def add(a, b):\n    return a - b\n\n\ndef twice(a):\n    return add(a, a)\n",
        )
        .unwrap();
        let limits = SessionLimits {
            localization_byte_budget: budget,
            ..SessionLimits::default()
        };
        let ctx = ToolContext::new(wc.path(), limits);
        (wc, ctx)
    }

    #[tokio::test]
    async fn test_search_in_files_tool() {
        let (_wc, ctx) = context(65536);
        let result = SearchInFilesTool
            .execute(serde_json::json!({"pattern": "add(", "glob": "*.py"}), &ctx)
            .await
            .unwrap();
        assert_eq!(
            result.output,
            "src/calc.py:1: def add(a, b):\nsrc/calc.py:6:     return add(a, a)"
        );
    }

    #[tokio::test]
    async fn test_read_file_tool_records_span() {
        let (_wc, ctx) = context(65536);
        let result = ReadFileTool
            .execute(serde_json::json!({"path": "./src/calc.py", "start_line": 1, "end_line": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "   1: def add(a, b):\n   2:     return a - b");
        assert_eq!(result.spans, vec![LocalizedSpan::new("src/calc.py", 1, 2, "read by agent")]);

        let missing = ReadFileTool
            .execute(serde_json::json!({"path": "src/nope.py"}), &ctx)
            .await
            .unwrap();
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn test_reads_stop_once_budget_is_spent() {
        let (_wc, ctx) = context(30);
        let first = ReadFileTool
            .execute(serde_json::json!({"path": "src/calc.py"}), &ctx)
            .await
            .unwrap();
        assert!(first.output.ends_with(crate::localize::BUDGET_NOTICE));

        let second = ReadFileTool
            .execute(serde_json::json!({"path": "src/calc.py"}), &ctx)
            .await
            .unwrap();
        assert_eq!(second.output, crate::localize::BUDGET_NOTICE);
        assert!(second.spans.is_empty());
    }
}
