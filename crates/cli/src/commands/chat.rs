//! `anjia chat`: run one advisor turn in-process.

use std::io::Write;
use std::sync::Arc;

use anjia_agent::{AgentLoop, SessionStore, StreamEvent, TurnRequest};
use anjia_config::AppConfig;
use anjia_providers::OpenAiCompatGateway;
use tracing::debug;

pub async fn run(
    message: String,
    conversation_id: Option<String>,
    max_iterations: Option<u32>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Check for API key early; give a clear error
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    ANJIA_API_KEY  = 'sk-...'");
        eprintln!("    OPENAI_API_KEY = 'sk-...'");
        eprintln!("  and OPENAI_API_BASE_URL for a non-OpenAI endpoint.");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let max_iterations = resolve_iterations(max_iterations, &config)?;

    let gateway = OpenAiCompatGateway::from_config(&config.model, config.agent.gateway_timeout());
    let tools = anjia_tools::default_registry(config.agent.tool_timeout());
    let agent = Arc::new(AgentLoop::from_config(
        Arc::new(gateway),
        Arc::new(tools),
        &config.agent,
    ));
    let sessions = SessionStore::from_config(&config.sessions);

    let lease = sessions.get_or_create(conversation_id.as_deref()).await?;
    debug!(
        conversation_id = %lease.id,
        model = %config.model.model,
        gateway = agent.gateway_name(),
        streaming = agent.streams_text(),
        max_iterations,
        "Running chat turn"
    );
    let (mut rx, turn) = agent.spawn_turn(
        lease,
        TurnRequest {
            message,
            max_iterations,
        },
    );

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match &event {
            StreamEvent::ResponseChunk { content } => {
                print!("{content}");
                stdout.flush()?;
            }
            StreamEvent::ResponseEnd { .. } => println!(),
            other => {
                if let Some(line) = describe(other) {
                    eprintln!("{line}");
                }
            }
        }
    }

    let outcome = turn.await?;
    if outcome.error.is_some() && !json {
        return Err(format!("Turn failed after {} iterations", outcome.iterations).into());
    }
    Ok(())
}

fn resolve_iterations(
    requested: Option<u32>,
    config: &AppConfig,
) -> Result<u32, Box<dyn std::error::Error>> {
    let cap = config.agent.max_iterations_cap;
    match requested {
        None => Ok(config.agent.default_max_iterations),
        Some(n) if (1..=cap).contains(&n) => Ok(n),
        Some(n) => Err(format!("--max-iterations must be between 1 and {cap}, got {n}").into()),
    }
}

/// Status line for a non-text event.
fn describe(event: &StreamEvent) -> Option<String> {
    match event {
        StreamEvent::Thinking { message, .. } => Some(format!("  … {message}")),
        StreamEvent::ToolCall {
            tool_name,
            tool_args,
            ..
        } => Some(format!("  → {tool_name} {tool_args}")),
        StreamEvent::ToolResult {
            tool_name, result, ..
        } => Some(format!("  ← {tool_name} {result}")),
        StreamEvent::Done {
            status,
            iterations,
            conversation_id,
        } => Some(format!(
            "  [{status:?}] {iterations} iteration(s), conversation {conversation_id}"
        )),
        StreamEvent::Error { error, message } => Some(format!("  [Error] {message}: {error}")),
        StreamEvent::ResponseStart { .. }
        | StreamEvent::ResponseChunk { .. }
        | StreamEvent::ResponseEnd { .. } => None,
    }
}
