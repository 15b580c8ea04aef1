//! The chatbot's agent configuration.
//!
//! [`build_agent`] assembles the model handle, tool list and system prompt
//! without doing any I/O; [`AgentConfiguration::into_agent`] turns that bundle
//! into a runnable [`Agent`].

use std::fmt;
use std::sync::Arc;

use crate::agent::Agent;
use crate::error::AgentError;
use crate::llm::{OpenAiModel, OpenAiModelConfig};
use crate::tools::{SharedTool, Toolbox};

pub const MODEL: &str = "gpt-4o-mini";
pub const STREAM_USAGE: bool = true;
pub const SYSTEM_PROMPT: &str = "You are a friendly, curious, geeky AI.";

/// Handle to the remote chat-completion endpoint the agent talks to.
pub type ModelHandle = OpenAiModelConfig;

#[derive(Clone)]
pub struct AgentConfiguration {
    pub model: ModelHandle,
    pub tools: Vec<SharedTool>,
    pub prompt: String,
}

impl fmt::Debug for AgentConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfiguration")
            .field("model", &self.model)
            .field(
                "tools",
                &self.tools.iter().map(|tool| tool.name()).collect::<Vec<_>>(),
            )
            .field("prompt", &self.prompt)
            .finish()
    }
}

impl AgentConfiguration {
    /// Builds the HTTP client for the model handle and wires it into an [`Agent`].
    ///
    /// Credentials are not checked here; a missing `OPENAI_API_KEY` surfaces on
    /// the first turn.
    pub fn into_agent(self) -> Result<Agent, AgentError> {
        let toolbox = Toolbox::new(self.tools)?;
        let model = OpenAiModel::new(self.model)?;

        Ok(Agent::new(Arc::new(model))
            .with_prompt(self.prompt)
            .with_tools(toolbox))
    }
}

/// Assembles the chatbot's configuration from its fixed literals.
pub fn build_agent() -> AgentConfiguration {
    AgentConfiguration {
        model: OpenAiModelConfig::new(MODEL).with_stream_usage(STREAM_USAGE),
        tools: Vec::new(),
        prompt: SYSTEM_PROMPT.to_string(),
    }
}

/// Builds the agent with credentials and endpoint supplied explicitly
/// rather than read from the environment at request time.
pub fn build_agent_with(
    api_key: Option<String>,
    api_base_url: Option<String>,
) -> Result<Agent, AgentError> {
    if api_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
        return Err(AgentError::Setup("api key must not be empty".to_string()));
    }

    let mut configuration = build_agent();
    configuration.model.api_key = api_key;
    configuration.model.api_base_url = api_base_url;
    configuration.into_agent()
}
