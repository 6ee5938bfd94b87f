//! The reasoning session: a bounded tool-use loop over an [`LlmProvider`].
//!
//! [`LlmProvider`]: crate::llm::LlmProvider

pub mod parser;
pub mod prompts;
pub mod session;
pub mod tools;

pub use parser::{JsonToolCallParser, ToolCall, ToolCallParser};
pub use prompts::{Feedback, PromptSet};
pub use session::{ReasoningSession, SessionConfig, SessionOutcome, ToolCallRecord};
pub use tools::{Tool, ToolContext, ToolError, ToolRegistry, ToolResult};
