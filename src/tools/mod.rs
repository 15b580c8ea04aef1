use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::{AgentError, ToolError};
use crate::llm::{ToolCall, ToolDefinition};

/// A capability the agent can offer the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, arguments: Value) -> Result<String, ToolError>;
}

pub type SharedTool = Arc<dyn Tool>;

/// The ordered set of tools bound to one agent. Names are unique.
#[derive(Clone, Default)]
pub struct Toolbox {
    tools: Vec<SharedTool>,
}

impl fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Toolbox {
    pub fn new(tools: impl IntoIterator<Item = SharedTool>) -> Result<Self, AgentError> {
        let tools = tools.into_iter().collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name()) {
                return Err(AgentError::Setup(format!(
                    "tool '{}' registered twice",
                    tool.name()
                )));
            }
        }

        Ok(Self { tools })
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Dispatches a model-requested call to the matching tool.
    pub async fn run(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.name() == call.name)
            .ok_or_else(|| ToolError::Unknown(call.name.clone()))?;

        check_required(&call.name, &tool.parameters(), &call.arguments)?;
        tool.call(call.arguments.clone()).await
    }
}

fn check_required(tool: &str, schema: &Value, arguments: &Value) -> Result<(), ToolError> {
    let bad = |reason: String| ToolError::BadArguments {
        tool: tool.to_string(),
        reason,
    };

    let Some(provided) = arguments.as_object() else {
        return Err(bad(format!("expected a JSON object, got {arguments}")));
    };

    let missing = schema["required"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|field| !provided.contains_key(*field))
        .collect::<Vec<_>>();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(bad(format!("missing {}", missing.join(", "))))
    }
}
