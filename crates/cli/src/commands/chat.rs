//! `axon chat`: interactive or single-message chat.
//!
//! Output is driven entirely by the agent's broadcast events. Ctrl+C during a
//! turn interrupts it; Ctrl+C at the prompt exits.

use axon_config::AppConfig;
use axon_core::bus::{EventFilter, EventStream, SubscribeOptions};
use axon_core::event::{EventPayload, SystemEvent};
use axon_persistence::SessionRecorder;
use axon_providers::AnthropicProvider;
use axon_runtime::{Runtime, RuntimeAgent, RuntimeConfig};
use axon_tools::WorkflowDocument;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// How turn output is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Text,
    Events,
}

pub async fn run(
    config: AppConfig,
    message: Option<String>,
    events: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set AXON_API_KEY or ANTHROPIC_API_KEY, or add api_key to:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = Arc::new(AnthropicProvider::from_config(&config)?);
    let workflow = WorkflowDocument::new().shared();
    let tools = axon_tools::registry_with_workflow(&workflow);
    let tool_names = tools.names().join(", ");

    let runtime = Runtime::new(RuntimeConfig::from(&config), provider, tools)?;
    let recorder = match axon_persistence::open_store(&config.persistence).await? {
        Some(store) => Some(SessionRecorder::attach(&runtime.events(), store)?),
        None => None,
    };

    let cwd = std::env::current_dir().ok();
    let agent = runtime.quick_start(None, cwd.as_deref())?;
    let output = if events { Output::Events } else { Output::Text };
    let mut stream = agent_events(&runtime, &agent);

    match message {
        Some(message) => {
            run_turn(&agent, &mut stream, &message, output).await?;
        }
        None => {
            if output == Output::Text {
                println!();
                println!("  axon: interactive mode");
                println!("  Model:  {}", config.model);
                println!("  Tools:  {tool_names}");
                println!("  Type 'exit' or press Ctrl+C to quit.");
                println!();
            }
            interactive(&agent, &mut stream, output).await?;
        }
    }

    drop(stream);
    if let Some(recorder) = recorder {
        recorder.close().await;
    }
    runtime.shutdown().await;
    Ok(())
}

fn agent_events(runtime: &Runtime, agent: &RuntimeAgent) -> EventStream {
    let agent_id = agent.agent_id().to_string();
    runtime.events().stream(
        EventFilter::Any,
        SubscribeOptions::new()
            .with_filter(move |e| e.broadcastable && e.agent_id() == Some(agent_id.as_str())),
    )
}

async fn interactive(
    agent: &RuntimeAgent,
    stream: &mut EventStream,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if output == Output::Text {
            print!("  You > ");
            std::io::stdout().flush()?;
        }

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        if let Err(e) = run_turn(agent, stream, line, output).await {
            eprintln!("  [Error] {e}");
        }
    }
    if output == Output::Text {
        println!();
    }
    Ok(())
}

/// Send one message and print its events until the turn ends.
async fn run_turn(
    agent: &RuntimeAgent,
    stream: &mut EventStream,
    message: &str,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    let message_id = agent.receive(message)?;
    debug!(message_id = %message_id, "Message sent");

    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                agent.interrupt()?;
                continue;
            }
        };
        let Some(event) = event else {
            warn!("Event stream closed mid-turn");
            break;
        };

        match output {
            Output::Events => println!("{}", serde_json::to_string(&event)?),
            Output::Text => print_text(&event)?,
        }
        if ends_turn(&event) {
            break;
        }
    }
    Ok(())
}

fn print_text(event: &SystemEvent) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    match &event.payload {
        EventPayload::MessageStart { .. } => write!(stdout, "\n  Assistant > ")?,
        EventPayload::TextDelta { text, .. } => write!(stdout, "{text}")?,
        EventPayload::ToolUseContentBlockStart { tool_name, .. } => {
            write!(stdout, "\n  [tool] {tool_name} ... ")?
        }
        EventPayload::ToolResult { is_error, .. } => {
            write!(stdout, "{}", if *is_error { "failed" } else { "done" })?
        }
        EventPayload::Interrupted { .. } => writeln!(stdout, "\n  [interrupted]")?,
        EventPayload::ErrorReceived { message, .. } => writeln!(stdout, "\n  [Error] {message}")?,
        EventPayload::TurnResponse(_) => writeln!(stdout, "\n")?,
        _ => {}
    }
    stdout.flush()
}

fn ends_turn(event: &SystemEvent) -> bool {
    matches!(
        event.payload,
        EventPayload::TurnResponse(_)
            | EventPayload::Interrupted { .. }
            | EventPayload::ErrorReceived { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::event::{EventSource, TurnEventData};

    fn event(payload: EventPayload) -> SystemEvent {
        SystemEvent::new(EventSource::Agent, payload).broadcastable(true)
    }

    #[test]
    fn turn_ends_on_terminal_events() {
        assert!(ends_turn(&event(EventPayload::TurnResponse(TurnEventData::default()))));
        assert!(ends_turn(&event(EventPayload::Interrupted { reason: "user".into() })));
        assert!(ends_turn(&event(EventPayload::ErrorReceived {
            message: "boom".into(),
            error_code: Some("api_error".into()),
        })));
        assert!(!ends_turn(&event(EventPayload::TextDelta {
            index: 0,
            text: "partial".into(),
        })));
    }
}
