//! Runs the agent loop offline against a scripted model.
//!
//! ```sh
//! cargo run --example chat
//! ```

use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use geeky_chatbot::graph::SYSTEM_PROMPT;
use geeky_chatbot::{
    Agent, ChatCompletion, ChatMessage, ChatModel, ProviderError, SharedTool, TokenUsage, Tool,
    ToolCall, ToolDefinition, ToolError, Toolbox, TurnEvent,
};
use serde_json::{Value, json};

struct ScriptedModel {
    replies: Mutex<VecDeque<ChatCompletion>>,
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatCompletion, ProviderError> {
        println!("  model sees {} messages", messages.len());
        self.replies
            .lock()
            .map_err(|_| ProviderError::Malformed("script lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| ProviderError::Malformed("script exhausted".to_string()))
    }
}

struct Fibonacci;

#[async_trait]
impl Tool for Fibonacci {
    fn name(&self) -> &str {
        "fibonacci"
    }

    fn description(&self) -> &str {
        "returns the n-th Fibonacci number"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"n": {"type": "integer", "minimum": 0, "maximum": 90}},
            "required": ["n"]
        })
    }

    async fn call(&self, arguments: Value) -> Result<String, ToolError> {
        let n = arguments["n"]
            .as_u64()
            .filter(|n| *n <= 90)
            .ok_or_else(|| ToolError::BadArguments {
                tool: "fibonacci".to_string(),
                reason: "n must be an integer in 0..=90".to_string(),
            })?;

        let (mut a, mut b) = (0u64, 1u64);
        for _ in 0..n {
            (a, b) = (b, a + b);
        }
        Ok(a.to_string())
    }
}

fn usage(input_tokens: u32, output_tokens: u32) -> Option<TokenUsage> {
    Some(TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens + output_tokens,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let script = VecDeque::from([
        ChatCompletion {
            content: Some("Hello, fellow nerd! Ask me anything.".to_string()),
            tool_calls: Vec::new(),
            usage: usage(18, 9),
        },
        ChatCompletion {
            content: Some("Let me crunch that.".to_string()),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "fibonacci".to_string(),
                arguments: json!({"n": 42}),
            }],
            usage: usage(40, 16),
        },
        ChatCompletion {
            content: Some("F(42) is 267914296. Golden ratio vibes!".to_string()),
            tool_calls: Vec::new(),
            usage: usage(62, 14),
        },
    ]);
    let model = ScriptedModel {
        replies: Mutex::new(script),
    };

    let toolbox = Toolbox::new([Arc::new(Fibonacci) as SharedTool])?;
    let mut agent = Agent::new(Arc::new(model))
        .with_prompt(SYSTEM_PROMPT)
        .with_tools(toolbox);

    println!("> hi!");
    let reply = agent.chat("hi!").await?;
    println!("{}\n", reply.text);

    println!("> what is the 42nd Fibonacci number?");
    {
        let stream = agent.chat_stream("what is the 42nd Fibonacci number?");
        futures_util::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event? {
                TurnEvent::Narration(text) => println!("({text})"),
                TurnEvent::ToolStarted(call) => println!("  -> {}({})", call.name, call.arguments),
                TurnEvent::ToolFinished { output, .. } => println!("  <- {output}"),
                TurnEvent::Usage(_) => {}
                TurnEvent::Answer(text) => println!("{text}"),
            }
        }
    }

    let total = agent.usage();
    println!(
        "\n{} history entries, {} tokens in total",
        agent.history().len(),
        total.total_tokens
    );

    Ok(())
}
