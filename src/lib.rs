//! A friendly, curious, geeky chatbot.
//!
//! - `graph::build_agent` assembles the chatbot's configuration: `gpt-4o-mini`
//!   with usage streaming, no tools, and a fixed system prompt
//! - `Agent` runs the reactive model/tool loop (`chat`, `chat_stream`)
//! - OpenAI chat-completions adapter via `OpenAiModel`

pub mod agent;
pub mod error;
pub mod graph;
pub mod llm;
pub mod tools;

pub use agent::{Agent, DEFAULT_RECURSION_LIMIT, Reply, TurnEvent};
pub use error::{AgentError, ProviderError, ToolError};
pub use graph::{AgentConfiguration, ModelHandle, build_agent};
pub use llm::{
    ChatCompletion, ChatMessage, ChatModel, OpenAiModel, OpenAiModelConfig, TokenUsage, ToolCall,
    ToolDefinition,
};
pub use tools::{SharedTool, Tool, Toolbox};
