//! Ikigai - a terminal environment for coordinating multiple LLM agents
//! over one durable, replayable event log (spec §1).

mod agent;
mod coordination;
mod db;
mod driver;
mod error;
mod lifecycle;
mod llm;
mod mailbox;
mod replay;
mod repl;
mod runtime;
mod wait;

use db::EventStore;
use llm::{LlmConfig, ModelRegistry};
use runtime::{Runtime, TerminalEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Splits a raw terminal line into a `{command, args}` pair if it starts
/// with `/`, else treats the whole line as free-form user input. This
/// tokenizing step is a terminal-frontend concern, not a core-crate one
/// (SPEC_FULL.md §E) — `ReplCommand::parse` only ever sees the result.
fn tokenize(line: &str) -> TerminalEvent {
    let line = line.trim_end_matches(['\n', '\r']);
    match line.strip_prefix('/') {
        Some(rest) => {
            let (command, args) = rest.split_once(' ').unwrap_or((rest, ""));
            TerminalEvent::Command {
                command: command.to_string(),
                args: args.to_string(),
            }
        }
        None => TerminalEvent::UserInput(line.to_string()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ikigai=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let db_path = std::env::var("IKIGAI_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.ikigai/ikigai.db")
    });
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "opening event store");
    let store = EventStore::open(&db_path)?;
    let session_id = store.create_session()?;

    let llm_config = LlmConfig::from_env();
    let models = Arc::new(ModelRegistry::new(&llm_config));
    if models.has_models() {
        tracing::info!(
            models = ?models.available_models(),
            default = %models.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("No LLM API keys configured. Set ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY, or IKIGAI_GATEWAY.");
    }

    let http_client = reqwest::Client::new();
    let mut runtime = Runtime::bootstrap(store, session_id, models, http_client)?;

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if input_tx.send(tokenize(&line)).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = output_rx.recv().await {
            println!("{line}");
        }
    });

    runtime.run(input_rx, output_tx).await?;
    Ok(())
}
