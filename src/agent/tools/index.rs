//! Index query tools: symbol lookup, reference search, span read.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Tool, ToolContext, ToolError, ToolResult};
use crate::localize::LocalizedSpan;

fn parse_params<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidParameters(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct SymbolLookupParams {
    name: String,
    max_results: Option<usize>,
}

/// Find declarations by (possibly qualified) name.
pub struct SymbolLookupTool;

#[async_trait]
impl Tool for SymbolLookupTool {
    fn name(&self) -> &str {
        "symbol_lookup"
    }

    fn description(&self) -> &str {
        "Find where a class, method or function is declared. Accepts simple or qualified names (Foo, pkg.Foo, Foo.bar, Foo#bar, Foo::bar). Returns file and line span for each match, best first."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Symbol name to look up" },
                "max_results": { "type": "integer", "minimum": 1 }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let params: SymbolLookupParams = parse_params(args)?;
        let index = ctx.require_index(self.name())?;
        let max = params
            .max_results
            .unwrap_or(ctx.limits.max_symbol_results)
            .clamp(1, ctx.limits.max_symbol_results.max(1));

        let hits = index.symbol_lookup(&params.name, max);
        debug!(query = %params.name, hits = hits.len(), "symbol_lookup");
        if hits.is_empty() {
            return Ok(ToolResult::success(format!("No symbols match '{}'.", params.name)));
        }

        let output = hits
            .iter()
            .map(|h| format!("{} [{:?}] {}:{}-{} (score {})", h.symbol, h.kind, h.file, h.start, h.end, h.score))
            .collect::<Vec<_>>()
            .join("\n");
        let spans = hits
            .iter()
            .map(|h| LocalizedSpan::new(&h.file, h.start, h.end, format!("declaration of {}", h.symbol)))
            .collect();
        Ok(ctx.charged(output, spans))
    }
}

#[derive(Debug, Deserialize)]
struct FindReferencesParams {
    symbol: String,
    max_results: Option<usize>,
}

/// List call and use sites of a symbol.
pub struct FindReferencesTool;

#[async_trait]
impl Tool for FindReferencesTool {
    fn name(&self) -> &str {
        "find_references"
    }

    fn description(&self) -> &str {
        "List call or use sites of a symbol (matched on its last name segment). Returns file:line locations."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "symbol": { "type": "string", "description": "Symbol whose uses to list" },
                "max_results": { "type": "integer", "minimum": 1 }
            },
            "required": ["symbol"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let params: FindReferencesParams = parse_params(args)?;
        let index = ctx.require_index(self.name())?;
        let max = params
            .max_results
            .unwrap_or(ctx.limits.max_symbol_results)
            .clamp(1, ctx.limits.max_symbol_results.max(1));

        let locations = index.find_references(&params.symbol, max);
        debug!(symbol = %params.symbol, hits = locations.len(), "find_references");
        if locations.is_empty() {
            return Ok(ToolResult::success(format!("No references to '{}'.", params.symbol)));
        }

        let output = locations
            .iter()
            .map(|l| format!("{}:{}", l.file, l.start))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ctx.charged(output, Vec::new()))
    }
}

#[derive(Debug, Deserialize)]
struct ReadSpanParams {
    file: String,
    start: usize,
    end: usize,
}

/// Read an exact line range of an indexed file.
pub struct ReadSpanTool;

#[async_trait]
impl Tool for ReadSpanTool {
    fn name(&self) -> &str {
        "read_span"
    }

    fn description(&self) -> &str {
        "Read lines start..=end (1-based) of an indexed file, with line numbers. Fails if the range is outside the file."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file": { "type": "string", "description": "Path relative to the project root" },
                "start": { "type": "integer", "minimum": 1 },
                "end": { "type": "integer", "minimum": 1 }
            },
            "required": ["file", "start", "end"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let params: ReadSpanParams = parse_params(args)?;
        let index = ctx.require_index(self.name())?;

        match index.read_span(&params.file, params.start, params.end) {
            Ok(text) => Ok(ctx.charged(
                text,
                vec![LocalizedSpan::new(&params.file, params.start, params.end, "read by agent")],
            )),
            // Range and unknown-file errors are the model's to fix.
            Err(e) => Ok(ToolResult::failure(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionLimits;
    use crate::index::IndexBuilder;
    use tempfile::TempDir;

    const SOURCE: &str = "package org.ex;\n\npublic class Calc {\n    public int add(int a, int b) {\n        return a - b;\n    }\n\n    public int twice(int a) {\n        return add(a, a);\n    }\n}\n";

    fn context() -> (TempDir, TempDir, ToolContext) {
        let wc = TempDir::new().unwrap();
        let idx = TempDir::new().unwrap();
        std::fs::create_dir_all(wc.path().join("src/org/ex")).unwrap();
        std::fs::write(wc.path().join("src/org/ex/Calc.java"), SOURCE).unwrap();
        let handle = IndexBuilder::new(idx.path())
            .build(wc.path(), "bench", "Calc", "1b", "java", false)
            .unwrap();
        let ctx = ToolContext::new(wc.path(), SessionLimits::default()).with_index(Some(handle));
        (wc, idx, ctx)
    }

    #[tokio::test]
    async fn test_symbol_lookup_reports_spans() {
        let (_wc, _idx, ctx) = context();
        let result = SymbolLookupTool
            .execute(serde_json::json!({"name": "Calc#add"}), &ctx)
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("src/org/ex/Calc.java:4-6"));
        assert_eq!(result.spans[0].file, "src/org/ex/Calc.java");
        assert_eq!((result.spans[0].start, result.spans[0].end), (4, 6));
    }

    #[tokio::test]
    async fn test_find_references() {
        let (_wc, _idx, ctx) = context();
        let result = FindReferencesTool
            .execute(serde_json::json!({"symbol": "org.ex.Calc.add"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output, "src/org/ex/Calc.java:9");
        assert!(result.spans.is_empty());
    }

    #[tokio::test]
    async fn test_read_span_out_of_range_is_a_failed_result() {
        let (_wc, _idx, ctx) = context();
        let ok = ReadSpanTool
            .execute(serde_json::json!({"file": "src/org/ex/Calc.java", "start": 5, "end": 5}), &ctx)
            .await
            .unwrap();
        assert_eq!(ok.output, "   5:         return a - b;");

        let bad = ReadSpanTool
            .execute(serde_json::json!({"file": "src/org/ex/Calc.java", "start": 5, "end": 99}), &ctx)
            .await
            .unwrap();
        assert!(!bad.success);
        assert!(bad.observation().contains("out of range"));
    }

    #[tokio::test]
    async fn test_index_tools_need_an_index() {
        let ctx = ToolContext::new("/tmp", SessionLimits::default());
        let err = SymbolLookupTool
            .execute(serde_json::json!({"name": "Calc"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAvailable(_)));

        let err = ReadSpanTool
            .execute(serde_json::json!({"file": "x"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
