//! Nyaya - terminal client for the legal assistant chat service.

mod render;
mod repl;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use nyaya_chat::{ChatConfig, ChatSession, HttpBackend, TurnOutcome};

/// Nyaya legal assistant
#[derive(Parser)]
#[command(name = "nyaya")]
#[command(about = "Chat with the Nyaya legal assistant from the terminal")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults to ~/.nyaya/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Chat endpoint URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Continue a persisted conversation
    #[arg(long, global = true)]
    chat_id: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat (default)
    Chat,
    /// Ask one question and print the answer
    Ask {
        /// The question
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Print a persisted conversation
    History {
        chat_id: String,
        /// Print messages as JSON
        #[arg(long)]
        json: bool,
    },
    /// List persisted conversations
    List {
        /// Print summaries as JSON
        #[arg(long)]
        json: bool,
    },
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // stdout carries the conversation, so logs go to stderr.
    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// File config (explicit or default location), then environment, then flags.
fn load_config(args: &Args) -> anyhow::Result<ChatConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| ChatConfig::default_path().filter(|p| p.exists()));

    let mut config = match path {
        Some(path) => ChatConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ChatConfig::default(),
    };
    config
        .apply_env()
        .context("Failed to load config from environment")?;

    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(chat_id) = &args.chat_id {
        config.chat_id = Some(chat_id.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_config(&args)?;
    let backend = HttpBackend::from_config(&config)?;

    match args.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            let messages = match config.chat_id.as_deref() {
                Some(chat_id) => backend
                    .load_conversation(chat_id)
                    .await
                    .with_context(|| format!("Failed to load conversation {chat_id}"))?
                    .messages,
                None => Vec::new(),
            };
            let session = ChatSession::with_transcript(backend, config, messages);
            repl::run(session).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ask { message } => {
            let session = ChatSession::new(backend, config);
            let text = message.join(" ");
            let outcome = render::drive(&session, {
                let session = session.clone();
                async move { session.send(text).await }
            })
            .await?;

            Ok(match outcome {
                TurnOutcome::Completed(_) => ExitCode::SUCCESS,
                other => {
                    render::report(&other, false);
                    ExitCode::FAILURE
                }
            })
        }
        Command::History { chat_id, json } => {
            let conversation = backend
                .load_conversation(&chat_id)
                .await
                .with_context(|| format!("Failed to load conversation {chat_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&conversation.messages)?);
            } else {
                render::print_conversation(&conversation);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List { json } => {
            let summaries = backend
                .list_conversations()
                .await
                .context("Failed to list conversations")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                render::print_summaries(&summaries);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_logs);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
