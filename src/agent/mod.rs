//! Reactive agent: the model is called, any tool calls it asks for are run
//! and fed back, and the turn ends on the first reply that calls no tools.

use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::llm::{ChatCompletion, ChatMessage, ChatModel, TokenUsage, ToolCall};
use crate::tools::Toolbox;

/// Model calls allowed per turn before giving up.
pub const DEFAULT_RECURSION_LIMIT: u32 = 25;

/// Progress of one turn, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Text the model produced alongside tool calls.
    Narration(String),
    ToolStarted(ToolCall),
    ToolFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Usage(TokenUsage),
    Answer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub usage: TokenUsage,
}

enum Route {
    Answer(String),
    Tools(Vec<ToolCall>),
}

impl From<ChatCompletion> for Route {
    fn from(completion: ChatCompletion) -> Self {
        if completion.tool_calls.is_empty() {
            Route::Answer(completion.content.unwrap_or_default())
        } else {
            Route::Tools(completion.tool_calls)
        }
    }
}

pub struct Agent {
    model: Arc<dyn ChatModel>,
    toolbox: Toolbox,
    prompt: Option<String>,
    recursion_limit: u32,
    history: Vec<ChatMessage>,
    usage: TokenUsage,
}

impl Agent {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            toolbox: Toolbox::default(),
            prompt: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            history: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, toolbox: Toolbox) -> Self {
        self.toolbox = toolbox;
        self
    }

    pub fn with_recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    /// Completed turns only; a failed turn leaves no trace here.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Tokens spent across every model call, including calls from failed turns.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub async fn chat(&mut self, input: impl Into<String>) -> Result<Reply, AgentError> {
        let events = self.chat_stream(input);
        futures_util::pin_mut!(events);

        let mut usage = TokenUsage::default();
        while let Some(event) = events.next().await {
            match event? {
                TurnEvent::Usage(call_usage) => usage += call_usage,
                TurnEvent::Answer(text) => return Ok(Reply { text, usage }),
                _ => {}
            }
        }

        Err(AgentError::NoAnswer)
    }

    pub fn chat_stream(
        &mut self,
        input: impl Into<String>,
    ) -> impl Stream<Item = Result<TurnEvent, AgentError>> + '_ {
        let input = input.into();

        try_stream! {
            let mut pending = Vec::new();
            if self.history.is_empty() {
                if let Some(prompt) = &self.prompt {
                    pending.push(ChatMessage::System(prompt.clone()));
                }
            }
            pending.push(ChatMessage::Human(input));

            let tools = self.toolbox.definitions();

            for step in 1..=self.recursion_limit {
                let context = self
                    .history
                    .iter()
                    .chain(&pending)
                    .cloned()
                    .collect::<Vec<_>>();
                debug!(step, messages = context.len(), model = self.model.model_name(), "calling model");

                let completion = self.model.complete(&context, &tools).await?;
                pending.push(completion.to_message());

                if let Some(usage) = completion.usage {
                    self.usage += usage;
                    yield TurnEvent::Usage(usage);
                }

                let narration = completion
                    .content
                    .clone()
                    .filter(|text| !text.is_empty() && !completion.tool_calls.is_empty());

                match Route::from(completion) {
                    Route::Answer(text) => {
                        self.history.append(&mut pending);
                        yield TurnEvent::Answer(text);
                        return;
                    }
                    Route::Tools(calls) => {
                        if let Some(text) = narration {
                            yield TurnEvent::Narration(text);
                        }
                        for call in calls {
                            yield TurnEvent::ToolStarted(call.clone());
                            let result = self.run_tool(&call).await;
                            if let ChatMessage::Tool { call_id, name, content, is_error } = &result {
                                yield TurnEvent::ToolFinished {
                                    call_id: call_id.clone(),
                                    name: name.clone(),
                                    output: content.clone(),
                                    is_error: *is_error,
                                };
                            }
                            pending.push(result);
                        }
                    }
                }
            }

            Err::<(), AgentError>(AgentError::RecursionLimit {
                limit: self.recursion_limit,
            })?;
        }
    }

    async fn run_tool(&self, call: &ToolCall) -> ChatMessage {
        let (content, is_error) = match self.toolbox.run(call).await {
            Ok(output) => (output, false),
            Err(err) => {
                warn!(tool = %call.name, error = %err, "tool call failed");
                (err.to_string(), true)
            }
        };

        ChatMessage::Tool {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        }
    }
}

#[cfg(test)]
mod tests;
