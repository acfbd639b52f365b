//! Interactive chat loop.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};

use nyaya_chat::{ChatSession, HttpBackend, MessageId, Role, TurnOutcome};

use crate::render;

const HELP: &str = "\
Commands:
  /retry              resend the last message after a failure
  /regenerate [id]    regenerate an answer (defaults to the latest)
  /clear              start over
  /history            print the conversation
  /quit               exit
Ctrl-C stops a streaming answer.";

/// A parsed line of input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Send(String),
    Retry,
    Regenerate(Option<String>),
    Clear,
    History,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Send(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "retry" => Input::Retry,
        "regenerate" | "regen" => Input::Regenerate(parts.next().map(str::to_string)),
        "clear" => Input::Clear,
        "history" => Input::History,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

fn prompt() -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()
}

pub async fn run(session: ChatSession<HttpBackend>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    if session.messages().is_empty() {
        eprintln!("Ask a legal question. Type /help for commands.");
    } else {
        render::print_messages(&session.messages());
    }

    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let outcome = match parse_input(&line) {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => {
                eprintln!("{HELP}");
                continue;
            }
            Input::Unknown(command) => {
                eprintln!("Unknown command /{command}. Type /help for commands.");
                continue;
            }
            Input::Clear => {
                session.clear();
                eprintln!("Conversation cleared.");
                continue;
            }
            Input::History => {
                render::print_messages(&session.messages());
                continue;
            }
            Input::Send(text) => {
                let turn = session.clone();
                render::drive(&session, async move { turn.send(text).await }).await?
            }
            Input::Retry => {
                let turn = session.clone();
                render::drive(&session, async move { turn.retry().await }).await?
            }
            Input::Regenerate(target) => {
                let Some(id) = target.map(MessageId::from).or_else(|| latest_answer(&session))
                else {
                    eprintln!("No answer to regenerate.");
                    continue;
                };
                let turn = session.clone();
                render::drive(&session, async move { turn.regenerate(&id).await }).await?
            }
        };

        if !matches!(outcome, TurnOutcome::Completed(_)) {
            render::report(&outcome, true);
        }
    }

    session.close();
    Ok(())
}

fn latest_answer(session: &ChatSession<HttpBackend>) -> Option<MessageId> {
    session
        .messages()
        .into_iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.id)
}
