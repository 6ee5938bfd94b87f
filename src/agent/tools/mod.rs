//! Tools offered to the reasoning session.
//!
//! Which information tools are registered depends on the gate policy: with
//! index retrieval the session only sees the index query tools, without it
//! only text search and file reads. The two terminal tools, `propose_patch`
//! and `no_patch`, are always advertised but handled by the session itself.

pub mod file;
pub mod index;

pub use file::{ReadFileTool, SearchInFilesTool};
pub use index::{FindReferencesTool, ReadSpanTool, SymbolLookupTool};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::SessionLimits;
use crate::index::IndexHandle;
use crate::localize::{ByteBudget, LocalizedSpan, BUDGET_NOTICE};

/// Name of the terminal tool carrying a patch proposal.
pub const PROPOSE_PATCH: &str = "propose_patch";
/// Name of the terminal tool declining to patch.
pub const NO_PATCH: &str = "no_patch";

/// Errors that can occur during tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Tool is not registered for the current gate policy.
    #[error("Tool not available: {0}")]
    NotAvailable(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Source regions this call looked at; folded into the localization context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<LocalizedSpan>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            spans: Vec::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            spans: Vec::new(),
        }
    }

    pub fn with_spans(mut self, spans: Vec<LocalizedSpan>) -> Self {
        self.spans = spans;
        self
    }

    /// Text fed back to the model.
    pub fn observation(&self) -> &str {
        if self.success {
            &self.output
        } else {
            self.error.as_deref().unwrap_or("Unknown error")
        }
    }
}

/// Everything a tool may read during one iteration.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_copy: PathBuf,
    pub index: Option<IndexHandle>,
    pub budget: Arc<ByteBudget>,
    pub limits: SessionLimits,
}

impl ToolContext {
    pub fn new(working_copy: impl Into<PathBuf>, limits: SessionLimits) -> Self {
        Self {
            working_copy: working_copy.into(),
            index: None,
            budget: Arc::new(ByteBudget::new(limits.localization_byte_budget)),
            limits,
        }
    }

    pub fn with_index(mut self, index: Option<IndexHandle>) -> Self {
        self.index = index;
        self
    }

    fn require_index(&self, tool: &str) -> Result<&IndexHandle, ToolError> {
        self.index
            .as_ref()
            .ok_or_else(|| ToolError::NotAvailable(format!("{tool} requires a retrieval index")))
    }

    /// Charge `output` against the byte budget. Spans are dropped when the
    /// budget was already exhausted and nothing was returned.
    pub fn charged(&self, output: String, spans: Vec<LocalizedSpan>) -> ToolResult {
        if self.budget.is_exhausted() {
            return ToolResult::success(BUDGET_NOTICE);
        }
        ToolResult::success(self.budget.charge(output)).with_spans(spans)
    }
}

/// Trait for tools that can be executed by the reasoning session.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the tool's `arguments` object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

/// Registry of the information tools available in one session.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// The tool set for a policy with or without index retrieval.
    pub fn for_policy(index_retrieval: bool) -> Self {
        let mut registry = Self::new();
        if index_retrieval {
            registry.register(Arc::new(SymbolLookupTool));
            registry.register(Arc::new(FindReferencesTool));
            registry.register(Arc::new(ReadSpanTool));
        } else {
            registry.register(Arc::new(SearchInFilesTool));
            registry.register(Arc::new(ReadFileTool));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered information tools, sorted.
    pub fn list_tools(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether `name` is a tool the model may call, terminal tools included.
    pub fn knows(&self, name: &str) -> bool {
        name == PROPOSE_PATCH || name == NO_PATCH || self.tools.contains_key(name)
    }

    /// Function-calling schema of every tool, terminal tools last.
    pub fn to_json_schema(&self) -> Value {
        let mut tools: Vec<Value> = self
            .tools
            .values()
            .map(|tool| function_schema(tool.name(), tool.description(), tool.parameters_schema()))
            .collect();
        tools.extend(terminal_tool_schemas());
        Value::Array(tools)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn function_schema(name: &str, description: &str, parameters: Value) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters
        }
    })
}

fn terminal_tool_schemas() -> Vec<Value> {
    vec![
        function_schema(
            PROPOSE_PATCH,
            "Propose the fix. Give a unified diff against the current files, structured line edits, or a list of alternative candidates. Ends the session.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "diff": {
                        "type": "string",
                        "description": "Unified diff with ---/+++ headers and @@ hunks"
                    },
                    "edits": {
                        "type": "array",
                        "description": "Line edits: [{path, ops: [{type: replace|insert|delete, start_line, end_line, text}]}]; line numbers refer to the current file",
                        "items": { "type": "object" }
                    },
                    "candidates": {
                        "type": "array",
                        "description": "Alternative patches tried in order until one applies and compiles: [{id, strategy, diff | edits}]",
                        "items": { "type": "object" }
                    }
                }
            }),
        ),
        function_schema(
            NO_PATCH,
            "Give up without proposing a patch. Ends the session.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" }
                },
                "required": ["reason"]
            }),
        ),
    ]
}
