//! Terminal output for turns and conversations.

use std::future::Future;
use std::io::Write;

use tokio::sync::broadcast::error::RecvError;

use nyaya_chat::{
    ChatBackend, ChatSession, Conversation, ConversationSummary, IgnoreReason, Message, Role,
    SessionEvent, TurnOutcome,
};

/// Run `turn` on its own task, streaming its increments to stdout.
///
/// Ctrl-C stops the turn instead of killing the process.
pub async fn drive<B, F>(session: &ChatSession<B>, turn: F) -> anyhow::Result<TurnOutcome>
where
    B: ChatBackend,
    F: Future<Output = TurnOutcome> + Send + 'static,
{
    let mut events = session.subscribe();
    let mut handle = tokio::spawn(turn);
    let mut stdout = std::io::stdout();
    let mut printed = false;

    loop {
        tokio::select! {
            joined = &mut handle => {
                while let Ok(event) = events.try_recv() {
                    printed |= print_event(&mut stdout, &event)?;
                }
                if printed {
                    writeln!(stdout)?;
                }
                return Ok(joined?);
            }
            event = events.recv() => match event {
                Ok(event) => printed |= print_event(&mut stdout, &event)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Output fell behind the stream");
                }
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                if session.stop() {
                    eprintln!("\n[stopped]");
                }
            }
        }
    }
}

/// Print one event; returns whether anything went to stdout.
fn print_event(out: &mut impl Write, event: &SessionEvent) -> std::io::Result<bool> {
    match event {
        SessionEvent::Increment { text, .. } => {
            write!(out, "{text}")?;
            out.flush()?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Explain a turn that did not complete.
///
/// `interactive` adds hints for REPL commands.
pub fn report(outcome: &TurnOutcome, interactive: bool) {
    match outcome {
        TurnOutcome::Completed(_) => {}
        TurnOutcome::Cancelled => eprintln!("Response cancelled."),
        TurnOutcome::Failed(error) if !error.is_user_visible() => {
            tracing::debug!(error = %error, "Turn failed quietly");
        }
        TurnOutcome::Failed(error) => {
            eprintln!("Error: {error}");
            if interactive && error.is_retriable() {
                eprintln!("Type /retry to try again.");
            }
        }
        TurnOutcome::Ignored(reason) => eprintln!("{}", ignore_message(*reason)),
    }
}

fn ignore_message(reason: IgnoreReason) -> &'static str {
    match reason {
        IgnoreReason::Busy => "Still answering the previous message.",
        IgnoreReason::EmptyMessage => "Nothing to send.",
        IgnoreReason::NothingToRetry => "Nothing to retry.",
        IgnoreReason::UnknownMessage => "No assistant message with that id.",
        IgnoreReason::NoPrecedingUserMessage => "That reply has no question to regenerate from.",
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "nyaya",
        Role::System => "system",
    }
}

pub fn format_message(message: &Message) -> String {
    format!("[{}] {}", role_label(message.role), message.content)
}

pub fn print_messages(messages: &[Message]) {
    for message in messages {
        println!("{}", format_message(message));
    }
}

pub fn print_conversation(conversation: &Conversation) {
    println!("# {}", conversation.title);
    if conversation.messages.is_empty() {
        println!("(no messages)");
        return;
    }
    print_messages(&conversation.messages);
}

pub fn print_summaries(summaries: &[ConversationSummary]) {
    if summaries.is_empty() {
        println!("No conversations found.");
        return;
    }
    for summary in summaries {
        match &summary.title {
            Some(title) => println!("{}  {}", summary.id, title),
            None => println!("{}", summary.id),
        }
    }
}
