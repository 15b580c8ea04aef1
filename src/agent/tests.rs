use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::*;
use crate::error::{ProviderError, ToolError};
use crate::llm::ToolDefinition;
use crate::tools::{SharedTool, Tool};

type Request = (Vec<ChatMessage>, Vec<ToolDefinition>);

/// Replays canned completions and records every request it receives.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ChatCompletion, ProviderError>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedModel {
    fn new(replies: Vec<Result<ChatCompletion, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::default(),
        })
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatCompletion, ProviderError> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push((messages.to_vec(), tools.to_vec()));

        self.replies
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Malformed("script exhausted".to_string())))
    }
}

struct Add;

#[async_trait]
impl Tool for Add {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "adds two integers"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        match (arguments["a"].as_i64(), arguments["b"].as_i64()) {
            (Some(a), Some(b)) => Ok((a + b).to_string()),
            _ => Err(ToolError::Failed {
                tool: "add".to_string(),
                reason: "operands must be integers".to_string(),
            }),
        }
    }
}

fn answer(text: &str) -> Result<ChatCompletion, ProviderError> {
    Ok(ChatCompletion {
        content: Some(text.to_string()),
        ..ChatCompletion::default()
    })
}

fn answer_with_usage(text: &str, usage: TokenUsage) -> Result<ChatCompletion, ProviderError> {
    Ok(ChatCompletion {
        content: Some(text.to_string()),
        tool_calls: Vec::new(),
        usage: Some(usage),
    })
}

fn request_tool(id: &str, name: &str, arguments: Value) -> Result<ChatCompletion, ProviderError> {
    Ok(ChatCompletion {
        content: None,
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
        usage: None,
    })
}

fn usage(input_tokens: u32, output_tokens: u32) -> TokenUsage {
    TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
    }
}

fn agent_with_add(model: Arc<ScriptedModel>) -> Agent {
    let toolbox = Toolbox::new([Arc::new(Add) as SharedTool]).expect("toolbox builds");
    Agent::new(model).with_tools(toolbox)
}

async fn collect_turn(agent: &mut Agent, input: &str) -> Vec<TurnEvent> {
    agent
        .chat_stream(input)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("turn succeeds")
}

#[tokio::test]
async fn plain_reply_ends_the_turn() {
    let model = ScriptedModel::new(vec![answer("hello, fellow human")]);
    let mut agent = Agent::new(model.clone()).with_prompt("be geeky");

    let reply = agent.chat("hi").await.expect("turn succeeds");

    assert_eq!(reply.text, "hello, fellow human");
    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].1.is_empty());
    assert_eq!(
        requests[0].0,
        vec![
            ChatMessage::System("be geeky".to_string()),
            ChatMessage::Human("hi".to_string()),
        ]
    );
}

#[tokio::test]
async fn prompt_is_sent_once_across_turns_and_again_after_reset() {
    let model = ScriptedModel::new(vec![answer("one"), answer("two"), answer("three")]);
    let mut agent = Agent::new(model.clone()).with_prompt("be geeky");

    agent.chat("first").await.expect("first turn");
    agent.chat("second").await.expect("second turn");
    assert_eq!(agent.history().len(), 5);

    agent.reset();
    agent.chat("third").await.expect("third turn");

    let requests = model.requests();
    let system_count = |messages: &[ChatMessage]| {
        messages
            .iter()
            .filter(|message| matches!(message, ChatMessage::System(_)))
            .count()
    };
    assert_eq!(system_count(requests[1].0.as_slice()), 1);
    assert_eq!(requests[1].0.last(), Some(&ChatMessage::Human("second".to_string())));
    assert_eq!(
        requests[2].0,
        vec![
            ChatMessage::System("be geeky".to_string()),
            ChatMessage::Human("third".to_string()),
        ]
    );
}

#[tokio::test]
async fn tool_results_are_fed_back_before_the_answer() {
    let model = ScriptedModel::new(vec![
        request_tool("call_1", "add", json!({"a": 40, "b": 2})),
        answer("the answer is 42"),
    ]);
    let mut agent = agent_with_add(model.clone());

    let events = collect_turn(&mut agent, "what is 40 + 2?").await;

    assert_eq!(
        events[1],
        TurnEvent::ToolFinished {
            call_id: "call_1".to_string(),
            name: "add".to_string(),
            output: "42".to_string(),
            is_error: false,
        }
    );
    assert_eq!(events.last(), Some(&TurnEvent::Answer("the answer is 42".to_string())));

    let requests = model.requests();
    assert_eq!(requests[0].1[0].name, "add");
    assert!(matches!(
        requests[1].0.last(),
        Some(ChatMessage::Tool { content, is_error: false, .. }) if content == "42"
    ));
}

#[tokio::test]
async fn tool_failures_go_back_to_the_model() {
    let model = ScriptedModel::new(vec![
        request_tool("call_1", "teleport", json!({})),
        request_tool("call_2", "add", json!({"a": 1})),
        answer("I cannot do that"),
    ]);
    let mut agent = agent_with_add(model);

    let events = collect_turn(&mut agent, "beam me up").await;

    let failures = events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::ToolFinished {
                output,
                is_error: true,
                ..
            } => Some(output.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        failures,
        vec![
            "tool not found: teleport",
            "add rejected its arguments: missing b",
        ]
    );
    assert_eq!(events.last(), Some(&TurnEvent::Answer("I cannot do that".to_string())));
}

#[tokio::test]
async fn recursion_limit_stops_endless_tool_loops() {
    let model = ScriptedModel::new(vec![
        request_tool("call_1", "add", json!({"a": 1, "b": 1})),
        request_tool("call_2", "add", json!({"a": 1, "b": 1})),
    ]);
    let mut agent = agent_with_add(model).with_recursion_limit(2);

    let err = agent.chat("loop forever").await.expect_err("must fail");

    assert!(matches!(err, AgentError::RecursionLimit { limit: 2 }));
    assert!(agent.history().is_empty());
}

#[tokio::test]
async fn failed_turn_is_not_replayed_in_the_next_request() {
    let model = ScriptedModel::new(vec![
        Err(ProviderError::Api("openai api error 500 server_error: oops".to_string())),
        answer("second time lucky"),
    ]);
    let mut agent = Agent::new(model.clone()).with_prompt("sys");

    let err = agent.chat("first").await.expect_err("first turn fails");
    assert!(matches!(err, AgentError::Provider(ProviderError::Api(_))));
    assert!(agent.history().is_empty());

    agent.chat("second").await.expect("second turn");

    assert_eq!(
        model.requests()[1].0,
        vec![
            ChatMessage::System("sys".to_string()),
            ChatMessage::Human("second".to_string()),
        ]
    );
}

#[tokio::test]
async fn usage_is_reported_per_turn_and_summed_on_the_agent() {
    let model = ScriptedModel::new(vec![
        answer_with_usage("one", usage(12, 3)),
        answer_with_usage("two", usage(20, 5)),
    ]);
    let mut agent = Agent::new(model);

    let first = agent.chat("a").await.expect("first turn");
    let second = agent.chat("b").await.expect("second turn");

    assert_eq!(first.usage, usage(12, 3));
    assert_eq!(second.usage, usage(20, 5));
    assert_eq!(agent.usage(), usage(32, 8));
}

#[tokio::test]
async fn narration_is_surfaced_only_alongside_tool_calls() {
    let model = ScriptedModel::new(vec![
        Ok(ChatCompletion {
            content: Some("let me compute".to_string()),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "add".to_string(),
                arguments: json!({"a": 2, "b": 2}),
            }],
            usage: None,
        }),
        answer("4"),
    ]);
    let mut agent = agent_with_add(model);

    let events = collect_turn(&mut agent, "2 + 2").await;

    assert_eq!(events[0], TurnEvent::Narration("let me compute".to_string()));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, TurnEvent::Narration(_)))
            .count(),
        1
    );
}
