//! LLM integration for the reasoning session.
//!
//! The repair loop only depends on the [`LlmProvider`] trait; [`LiteLlmClient`]
//! is the concrete OpenAI-compatible client used by the CLI.
//!
//! ```ignore
//! use gated_repair::llm::{LiteLlmClient, LlmProvider, Message, GenerationRequest};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("", vec![Message::user("Hello!")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
};
