use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::llm::{ChatCompletion, ChatMessage, ChatModel, TokenUsage, ToolCall, ToolDefinition};

const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
const API_KEY_ENV: &str = "OPENAI_API_KEY";
const API_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
const BLANK_CONVERSATION_FILLER: &str = " ";
const STREAM_DONE: &str = "[DONE]";

/// Settings for an OpenAI chat-completions endpoint.
///
/// Credentials are optional here: when `api_key` or `api_base_url` is unset it
/// is looked up from `OPENAI_API_KEY` / `OPENAI_BASE_URL` at request time, so
/// building a config never touches the environment or the network.
#[derive(Clone, PartialEq)]
pub struct OpenAiModelConfig {
    /// Model id (for example `gpt-4o-mini`).
    pub model: String,
    /// Stream the completion and ask the API to append token usage to the stream.
    pub stream_usage: bool,
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl OpenAiModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            stream_usage: false,
            api_key: None,
            api_base_url: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_stream_usage(mut self, stream_usage: bool) -> Self {
        self.stream_usage = stream_usage;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_api_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = Some(api_base_url.into());
        self
    }
}

impl fmt::Debug for OpenAiModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiModelConfig")
            .field("model", &self.model)
            .field("stream_usage", &self.stream_usage)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base_url", &self.api_base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client: Client,
    config: OpenAiModelConfig,
}

impl OpenAiModel {
    pub fn new(config: OpenAiModelConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        Ok(Self { client, config })
    }

    /// Like [`OpenAiModel::new`], but fails early when `OPENAI_API_KEY` is unset.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key =
            std::env::var(API_KEY_ENV).map_err(|_| ProviderError::MissingApiKey(API_KEY_ENV))?;

        Self::new(OpenAiModelConfig::new(model).with_api_key(api_key))
    }

    pub fn config(&self) -> &OpenAiModelConfig {
        &self.config
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        match &self.config.api_key {
            Some(key) => Ok(key.clone()),
            None => std::env::var(API_KEY_ENV).map_err(|_| ProviderError::MissingApiKey(API_KEY_ENV)),
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .api_base_url
            .clone()
            .or_else(|| std::env::var(API_BASE_URL_ENV).ok())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatModel for OpenAiModel {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatCompletion, ProviderError> {
        let api_key = self.api_key()?;
        let body = CompletionBody::new(&self.config, messages, tools);

        debug!(
            model = %self.config.model,
            messages = body.messages.len(),
            tools = tools.len(),
            stream = body.stream,
            "posting chat completion"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = render_api_error(status, &text);
            warn!(model = %self.config.model, %status, "{message}");
            return Err(ProviderError::Api(message));
        }

        if body.stream {
            let bytes = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other));
            return read_event_stream(StreamReader::new(Box::pin(bytes))).await;
        }

        let reply = response
            .json::<CompletionReply>()
            .await
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;

        reply.into_completion()
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<WireToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl CompletionBody {
    fn new(config: &OpenAiModelConfig, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Self {
        let mut wire_messages = messages.iter().filter_map(to_wire).collect::<Vec<_>>();
        if wire_messages.is_empty() {
            wire_messages.push(WireMessage::User {
                content: BLANK_CONVERSATION_FILLER.to_string(),
            });
        }

        Self {
            model: config.model.clone(),
            messages: wire_messages,
            tools: tools
                .iter()
                .map(|tool| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect(),
            temperature: config.temperature,
            max_completion_tokens: config.max_tokens,
            stream: config.stream_usage,
            stream_options: config.stream_usage.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

fn to_wire(message: &ChatMessage) -> Option<WireMessage> {
    let non_empty = |text: &String| (!text.is_empty()).then(|| text.clone());

    match message {
        ChatMessage::System(content) => {
            non_empty(content).map(|content| WireMessage::System { content })
        }
        ChatMessage::Human(content) => non_empty(content).map(|content| WireMessage::User { content }),
        ChatMessage::Ai {
            content,
            tool_calls,
        } => {
            let content = content.as_ref().and_then(non_empty);
            if content.is_none() && tool_calls.is_empty() {
                return None;
            }

            Some(WireMessage::Assistant {
                content,
                tool_calls: tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        kind: function_kind(),
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            })
        }
        ChatMessage::Tool {
            call_id,
            content,
            is_error,
            ..
        } => Some(WireMessage::Tool {
            tool_call_id: call_id.clone(),
            content: if *is_error {
                format!("Error: {content}")
            } else {
                content.clone()
            },
        }),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionReply {
    #[serde(default)]
    choices: Vec<ReplyChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ReplyChoice {
    message: Option<ReplyMessage>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        let input_tokens = usage.prompt_tokens.unwrap_or(0);
        let output_tokens = usage.completion_tokens.unwrap_or(0);
        Self {
            input_tokens,
            output_tokens,
            total_tokens: usage
                .total_tokens
                .unwrap_or_else(|| input_tokens.saturating_add(output_tokens)),
        }
    }
}

impl CompletionReply {
    fn into_completion(self) -> Result<ChatCompletion, ProviderError> {
        let message = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("no choices in reply".to_string()))?
            .message
            .ok_or_else(|| ProviderError::Malformed("choice has no message".to_string()))?;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| decode_tool_call(call.id, call.function.name, &call.function.arguments))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ChatCompletion {
            content: first_non_empty(message.content, message.refusal),
            tool_calls,
            usage: self.usage.map(TokenUsage::from),
        })
    }
}

fn first_non_empty(content: Option<String>, refusal: Option<String>) -> Option<String> {
    content
        .filter(|text| !text.is_empty())
        .or(refusal.filter(|text| !text.is_empty()))
}

fn decode_tool_call(id: String, name: String, arguments: &str) -> Result<ToolCall, ProviderError> {
    let arguments = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(arguments).map_err(|err| {
            ProviderError::Malformed(format!("arguments for tool '{name}' are not JSON: {err}"))
        })?
    };

    Ok(ToolCall {
        id,
        name,
        arguments,
    })
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    refusal: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: usize,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<Value>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Rebuilds one completion from `chat.completion.chunk` deltas.
///
/// Content and argument fragments are appended; a call's id and name are
/// taken from the first fragment that carries them.
#[derive(Debug, Default)]
struct DeltaAssembler {
    content: String,
    refusal: String,
    tool_calls: BTreeMap<usize, PendingToolCall>,
    usage: Option<TokenUsage>,
    chunks: usize,
}

impl DeltaAssembler {
    /// Feeds one SSE line; returns `true` on the `[DONE]` terminator.
    fn feed_line(&mut self, line: &str) -> Result<bool, ProviderError> {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return Ok(false);
        };

        match data {
            "" => Ok(false),
            STREAM_DONE => Ok(true),
            _ => {
                let chunk = serde_json::from_str::<StreamChunk>(data).map_err(|err| {
                    ProviderError::Malformed(format!("stream chunk is not JSON: {err}"))
                })?;
                self.feed_chunk(chunk)?;
                Ok(false)
            }
        }
    }

    fn feed_chunk(&mut self, chunk: StreamChunk) -> Result<(), ProviderError> {
        if let Some(error) = chunk.error {
            return Err(ProviderError::Api(format!(
                "openai stream error: {}",
                error.message.as_deref().unwrap_or("unknown openai api error")
            )));
        }

        self.chunks += 1;
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        for delta in chunk.choices.into_iter().filter_map(|choice| choice.delta) {
            self.content.extend(delta.content);
            self.refusal.extend(delta.refusal);

            for fragment in delta.tool_calls.into_iter().flatten() {
                let pending = self.tool_calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id.filter(|_| pending.id.is_empty()) {
                    pending.id = id;
                }
                let Some(function) = fragment.function else {
                    continue;
                };
                if let Some(name) = function.name.filter(|_| pending.name.is_empty()) {
                    pending.name = name;
                }
                pending.arguments.extend(function.arguments);
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<ChatCompletion, ProviderError> {
        if self.chunks == 0 {
            return Err(ProviderError::Malformed(
                "stream ended before any chunk arrived".to_string(),
            ));
        }

        let tool_calls = self
            .tool_calls
            .into_values()
            .map(|call| decode_tool_call(call.id, call.name, &call.arguments))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ChatCompletion {
            content: first_non_empty(Some(self.content), Some(self.refusal)),
            tool_calls,
            usage: self.usage,
        })
    }
}

async fn read_event_stream<R>(reader: R) -> Result<ChatCompletion, ProviderError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut assembler = DeltaAssembler::default();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|err| ProviderError::Transport(format!("stream interrupted: {err}")))?
    {
        if assembler.feed_line(&line)? {
            break;
        }
    }

    debug!(chunks = assembler.chunks, usage = ?assembler.usage, "chat completion stream closed");
    assembler.finish()
}

/// Renders a non-2xx reply: the OpenAI error envelope when the body holds
/// one, otherwise the status line and raw body.
fn render_api_error(status: StatusCode, body: &str) -> String {
    let Ok(ErrorEnvelope { error }) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return if body.trim().is_empty() {
            format!("openai api request failed ({status})")
        } else {
            format!("openai api request failed ({status}): {body}")
        };
    };

    let code = match error.code {
        Some(Value::String(code)) => code,
        Some(other) => other.to_string(),
        None => status.as_u16().to_string(),
    };
    let kind = error.kind.unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown")
            .to_lowercase()
            .replace(' ', "_")
    });
    let message = error
        .message
        .unwrap_or_else(|| "unknown openai api error".to_string());

    format!("openai api error {code} {kind}: {message}")
}
