use std::env;
use std::error::Error;
use std::io::Write;

use futures_util::StreamExt;
use geeky_chatbot::{Agent, TurnEvent, build_agent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "geeky_chatbot=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let configuration = build_agent();
    info!(
        model = %configuration.model.model,
        stream_usage = configuration.model.stream_usage,
        tools = configuration.tools.len(),
        "assembled agent configuration"
    );
    let mut agent = configuration.into_agent()?;

    let prompt = env::args().skip(1).collect::<Vec<_>>().join(" ");
    if !prompt.trim().is_empty() {
        run_turn(&mut agent, prompt).await?;
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                agent.reset();
                println!("(history cleared)");
                continue;
            }
            _ => {}
        }

        if let Err(err) = run_turn(&mut agent, line.to_string()).await {
            eprintln!("error: {err}");
        }
    }

    let usage = agent.usage();
    info!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens,
        "session finished"
    );

    Ok(())
}

async fn run_turn(agent: &mut Agent, prompt: String) -> Result<(), Box<dyn Error>> {
    let stream = agent.chat_stream(prompt);
    futures_util::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event? {
            TurnEvent::Narration(text) => println!("({text})"),
            TurnEvent::ToolStarted(call) => {
                println!("tool-call [{}] {}: {}", call.id, call.name, call.arguments)
            }
            TurnEvent::ToolFinished {
                call_id,
                name,
                output,
                is_error,
            } => println!("tool-result [{call_id}] {name} (error={is_error}): {output}"),
            TurnEvent::Usage(usage) => info!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                total_tokens = usage.total_tokens,
                "model usage"
            ),
            TurnEvent::Answer(text) => println!("{text}"),
        }
    }

    Ok(())
}
