//! Streaming chat session controller.
//!
//! A [`ChatSession`] turns user messages into an ordered transcript while
//! streaming assistant replies from a [`ChatBackend`]. It runs the state
//! machine
//!
//! ```text
//! Idle -> Sending -> Streaming -> Idle | Errored
//! Errored -> Sending (retry) | RetriesExhausted
//! ```
//!
//! Every command returns a [`TurnOutcome`]; failures become the session's
//! error state and never escape as `Err`.
//!
//! All transcript mutation happens in short synchronous sections under the
//! session lock. The lock is never held across an await, and every mutation a
//! turn makes after an await first checks that the turn's request still owns
//! the request slot.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::backend::{ChatBackend, ChatRequest};
use crate::config::ChatConfig;
use crate::decoder::decode_stream;
use crate::error::ChatError;
use crate::message::{Message, MessageId, MessageStatus};
use crate::request::{RequestGuard, RequestId, RequestManager};
use crate::transcript::{Transcript, UndoToken};

/// Content substituted when a reply finishes without any text.
pub const FALLBACK_RESPONSE: &str = "Sorry, I encountered an error generating a response.";

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Where the session is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Request issued, waiting for response headers.
    Sending,
    /// Headers received, increments arriving.
    Streaming,
    /// Last turn failed; `retry` may resend it.
    Errored,
    /// Retry budget spent. Only a fresh `send` or `clear` moves on.
    RetriesExhausted,
}

/// Why a command did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Another turn is in flight.
    Busy,
    EmptyMessage,
    /// No failed turn to resend.
    NothingToRetry,
    /// No assistant message with that id.
    UnknownMessage,
    NoPrecedingUserMessage,
}

/// Result of a session command.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The assistant reply, as committed to the transcript.
    Completed(Message),
    /// The turn was stopped, cleared or superseded.
    Cancelled,
    Failed(ChatError),
    Ignored(IgnoreReason),
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Completed(message) => Some(message),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ChatError> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Notifications for observers of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    UserMessage(Message),
    AssistantStarted {
        request_id: RequestId,
        message_id: MessageId,
    },
    Increment {
        message_id: MessageId,
        text: String,
    },
    Completed(Message),
    Cancelled {
        request_id: RequestId,
    },
    Failed(ChatError),
    Cleared,
}

#[derive(Default)]
struct Inner {
    transcript: Transcript,
    state: SessionState,
    last_user_content: Option<String>,
    retry_count: u32,
    error: Option<ChatError>,
    /// Request driving the current turn.
    turn: Option<RequestId>,
    /// Placeholder the current turn inserted.
    pending: Option<UndoToken>,
}

impl Inner {
    /// Committed context to send along with the trailing user message.
    fn history(&self) -> Vec<Message> {
        let mut history = self.transcript.committed();
        if history.last().is_some_and(Message::is_user) {
            history.pop();
        }
        history
    }

    /// Remove the placeholder `undo` names and forget it if it is the pending one.
    fn rollback(&mut self, undo: &UndoToken) {
        if self.transcript.rollback(undo) {
            tracing::debug!(request_id = %undo.request_id(), "Rolled back assistant placeholder");
        }
        if self.pending.as_ref() == Some(undo) {
            self.pending = None;
        }
    }

    fn owns_turn(&self, id: RequestId) -> bool {
        self.turn == Some(id)
    }

    /// Undo what turn `id` left behind and return whether it still owned the
    /// session. A no-op for turns that already finished.
    fn abandon(&mut self, id: RequestId) -> bool {
        if let Some(undo) = self.pending.clone().filter(|u| u.request_id() == id) {
            self.rollback(&undo);
        }
        let owned = self.owns_turn(id);
        if owned {
            self.turn = None;
            self.state = SessionState::Idle;
        }
        owned
    }
}

/// Rolls a turn back when its future is dropped before finishing.
struct AbandonOnDrop<'a, B> {
    shared: &'a Shared<B>,
    request_id: RequestId,
}

impl<B> Drop for AbandonOnDrop<'_, B> {
    fn drop(&mut self) {
        let owned = self.shared.inner.lock().abandon(self.request_id);
        if owned {
            tracing::debug!(request_id = %self.request_id, "Turn dropped before finishing");
            let _ = self.shared.events.send(SessionEvent::Cancelled {
                request_id: self.request_id,
            });
        }
    }
}

struct Shared<B> {
    backend: B,
    config: ChatConfig,
    requests: RequestManager,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

/// Handle to one chat session. Clones share the same session.
pub struct ChatSession<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for ChatSession<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: ChatBackend> ChatSession<B> {
    /// Start a fresh, unsaved conversation.
    pub fn new(backend: B, config: ChatConfig) -> Self {
        Self::with_transcript(backend, config, Vec::new())
    }

    /// Start from a previously persisted transcript.
    pub fn with_transcript(backend: B, config: ChatConfig, messages: Vec<Message>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let messages = messages
            .into_iter()
            .map(|mut m| {
                m.status = MessageStatus::Committed;
                m
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                requests: RequestManager::new(),
                inner: Mutex::new(Inner {
                    transcript: Transcript::from_messages(messages),
                    ..Inner::default()
                }),
                events,
            }),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Subscribe to session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.inner.lock().transcript.to_vec()
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    pub fn is_loading(&self) -> bool {
        self.shared.requests.is_loading()
    }

    /// The last user-visible error, cleared by the next send or retry.
    pub fn error(&self) -> Option<ChatError> {
        self.shared.inner.lock().error.clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.inner.lock().retry_count
    }

    pub fn last_user_content(&self) -> Option<String> {
        self.shared.inner.lock().last_user_content.clone()
    }

    /// Send a new user message and stream the reply.
    ///
    /// Ignored while another turn is in flight; follow-up sends are not queued.
    pub async fn send(&self, text: impl Into<String>) -> TurnOutcome {
        let text = text.into();
        if text.trim().is_empty() {
            return TurnOutcome::Ignored(IgnoreReason::EmptyMessage);
        }

        let Some(guard) = self.claim() else {
            return TurnOutcome::Ignored(IgnoreReason::Busy);
        };
        let request = self.prepare_send(&guard, text);
        self.exchange(guard, request).await
    }

    /// Resend the last user message after a failed turn.
    pub async fn retry(&self) -> TurnOutcome {
        let Some(guard) = self.claim() else {
            return TurnOutcome::Ignored(IgnoreReason::Busy);
        };
        match self.prepare_retry(&guard) {
            Ok(request) => self.exchange(guard, request).await,
            Err(outcome) => outcome,
        }
    }

    /// Drop the assistant message `message_id` and everything after it, then
    /// resend the user message that prompted it.
    pub async fn regenerate(&self, message_id: &MessageId) -> TurnOutcome {
        let Some(guard) = self.claim() else {
            return TurnOutcome::Ignored(IgnoreReason::Busy);
        };
        match self.prepare_regenerate(&guard, message_id) {
            Ok(request) => self.exchange(guard, request).await,
            Err(reason) => TurnOutcome::Ignored(reason),
        }
    }

    /// Cancel the in-flight turn, discarding any partial reply.
    ///
    /// Returns whether a turn was running.
    pub fn stop(&self) -> bool {
        let Some(id) = self.shared.requests.cancel() else {
            return false;
        };

        let owned = self.shared.inner.lock().abandon(id);
        if !owned {
            // The turn finished between the cancel and the lock.
            tracing::debug!(request_id = %id, "Stop arrived after the turn finished");
            return false;
        }

        tracing::info!(request_id = %id, "Turn stopped");
        self.emit(SessionEvent::Cancelled { request_id: id });
        true
    }

    /// Cancel any in-flight turn and forget the conversation.
    pub fn clear(&self) {
        let cancelled = self.shared.requests.cancel();

        let mut inner = self.shared.inner.lock();
        inner.transcript.clear();
        inner.state = SessionState::Idle;
        inner.last_user_content = None;
        inner.retry_count = 0;
        inner.error = None;
        inner.turn = None;
        inner.pending = None;
        drop(inner);

        tracing::debug!(cancelled = ?cancelled, "Session cleared");
        self.emit(SessionEvent::Cleared);
    }

    /// Tear the session down, cancelling whatever is in flight.
    pub fn close(&self) {
        if self.stop() {
            tracing::debug!("Session closed with a turn in flight");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    fn claim(&self) -> Option<RequestGuard> {
        match self.shared.requests.begin() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::debug!("Turn already in flight, ignoring command");
                None
            }
        }
    }

    fn build_request(&self, inner: &Inner, content: String) -> ChatRequest {
        let config = &self.shared.config;
        ChatRequest::new(content)
            .with_history(&inner.history())
            .with_chat_id(config.chat_id.clone())
            .with_user_id(config.user_id.clone())
            .with_session_id(config.session_id.clone().or_else(|| config.chat_id.clone()))
            .with_save_chat_history(config.save_chat_history)
    }

    /// Mark the turn started and build its request.
    fn begin_turn(&self, inner: &mut Inner, guard: &RequestGuard, content: String) -> ChatRequest {
        inner.error = None;
        inner.state = SessionState::Sending;
        inner.turn = Some(guard.id());
        inner.pending = None;
        self.build_request(inner, content)
    }

    fn append_user(&self, inner: &mut Inner, content: &str) {
        let user = Message::user(content);
        inner.transcript.append(user.clone());
        inner.last_user_content = Some(content.to_string());
        self.emit(SessionEvent::UserMessage(user));
    }

    fn prepare_send(&self, guard: &RequestGuard, text: String) -> ChatRequest {
        let mut inner = self.shared.inner.lock();
        self.append_user(&mut inner, &text);
        inner.retry_count = 0;
        tracing::debug!(request_id = %guard.id(), len = text.len(), "Sending message");
        self.begin_turn(&mut inner, guard, text)
    }

    fn prepare_retry(&self, guard: &RequestGuard) -> Result<ChatRequest, TurnOutcome> {
        let max = self.shared.config.max_retries;
        let mut inner = self.shared.inner.lock();

        let Some(content) = inner.last_user_content.clone() else {
            return Err(TurnOutcome::Ignored(IgnoreReason::NothingToRetry));
        };
        match inner.state {
            SessionState::Errored => {}
            SessionState::RetriesExhausted => {
                return Err(TurnOutcome::Failed(ChatError::RetriesExhausted { max }));
            }
            _ => return Err(TurnOutcome::Ignored(IgnoreReason::NothingToRetry)),
        }

        if inner.retry_count >= max {
            let error = ChatError::RetriesExhausted { max };
            inner.state = SessionState::RetriesExhausted;
            inner.error = Some(error.clone());
            drop(inner);

            tracing::warn!(max_retries = max, "Retry budget exhausted");
            self.emit(SessionEvent::Failed(error.clone()));
            return Err(TurnOutcome::Failed(error));
        }

        inner.retry_count += 1;
        tracing::info!(
            request_id = %guard.id(),
            attempt = inner.retry_count,
            max_retries = max,
            "Retrying last message"
        );
        Ok(self.begin_turn(&mut inner, guard, content))
    }

    fn prepare_regenerate(
        &self,
        guard: &RequestGuard,
        message_id: &MessageId,
    ) -> Result<ChatRequest, IgnoreReason> {
        let mut inner = self.shared.inner.lock();

        let position = inner
            .transcript
            .position(message_id)
            .filter(|&i| inner.transcript.at(i).is_some_and(Message::is_assistant))
            .ok_or(IgnoreReason::UnknownMessage)?;
        let user_index = position
            .checked_sub(1)
            .filter(|&i| inner.transcript.at(i).is_some_and(Message::is_user))
            .ok_or(IgnoreReason::NoPrecedingUserMessage)?;
        let content = inner
            .transcript
            .at(user_index)
            .map(|m| m.content.clone())
            .ok_or(IgnoreReason::NoPrecedingUserMessage)?;

        let removed = inner.transcript.truncate_from(user_index);
        tracing::debug!(
            request_id = %guard.id(),
            removed = removed.len(),
            "Regenerating reply"
        );

        self.append_user(&mut inner, &content);
        inner.retry_count = 0;
        Ok(self.begin_turn(&mut inner, guard, content))
    }

    /// Issue the request and stream the reply into the transcript.
    async fn exchange(&self, guard: RequestGuard, request: ChatRequest) -> TurnOutcome {
        // Locals drop before arguments, so this runs while `guard` holds the slot.
        let _abandon = AbandonOnDrop {
            shared: &self.shared,
            request_id: guard.id(),
        };

        let response = match guard.open(&self.shared.backend, &request).await {
            Ok(response) => response,
            Err(e) => return self.finish_failed(guard, None, e),
        };

        let Some(undo) = self.start_streaming(&guard, response.content_type.as_deref()) else {
            return self.finish_cancelled(guard, None);
        };

        let mut increments = decode_stream(
            response.body,
            guard.token().clone(),
            self.shared.config.stream_idle_timeout(),
        );
        while let Some(item) = increments.next().await {
            let text = match item {
                Ok(text) => text,
                Err(e) => return self.finish_failed(guard, Some(undo), e),
            };
            if !self.apply_increment(&guard, &undo, text) {
                return self.finish_cancelled(guard, Some(undo));
            }
        }

        self.finish_completed(guard, undo)
    }

    fn start_streaming(&self, guard: &RequestGuard, content_type: Option<&str>) -> Option<UndoToken> {
        let mut inner = self.shared.inner.lock();
        if !guard.is_active() {
            return None;
        }

        let placeholder = Message::assistant_placeholder();
        let undo = UndoToken::new(guard.id(), placeholder.id.clone());
        inner.transcript.append(placeholder);
        inner.pending = Some(undo.clone());
        inner.state = SessionState::Streaming;
        drop(inner);

        tracing::debug!(request_id = %guard.id(), content_type = ?content_type, "Streaming reply");
        self.emit(SessionEvent::AssistantStarted {
            request_id: guard.id(),
            message_id: undo.message_id().clone(),
        });
        Some(undo)
    }

    fn apply_increment(&self, guard: &RequestGuard, undo: &UndoToken, text: String) -> bool {
        let mut inner = self.shared.inner.lock();
        if !guard.is_active() {
            return false;
        }

        let id = undo.message_id();
        if !inner
            .transcript
            .replace_last(|m| &m.id == id, |m| m.content.push_str(&text))
        {
            // Placeholder gone, e.g. cleared while streaming.
            return false;
        }
        drop(inner);

        self.emit(SessionEvent::Increment {
            message_id: id.clone(),
            text,
        });
        true
    }

    fn finish_completed(&self, guard: RequestGuard, undo: UndoToken) -> TurnOutcome {
        let mut inner = self.shared.inner.lock();
        if !guard.is_active() {
            drop(inner);
            return self.finish_cancelled(guard, Some(undo));
        }

        let mut fallback = false;
        let id = undo.message_id();
        inner.transcript.replace_last(
            |m| &m.id == id,
            |m| {
                if m.content.is_empty() {
                    m.content = FALLBACK_RESPONSE.to_string();
                    fallback = true;
                }
                m.status = MessageStatus::Committed;
            },
        );
        let Some(message) = inner.transcript.get(id).cloned() else {
            drop(inner);
            return self.finish_cancelled(guard, None);
        };

        inner.state = SessionState::Idle;
        inner.retry_count = 0;
        inner.turn = None;
        inner.pending = None;
        // Free the slot while the state change is still exclusive.
        drop(guard);
        drop(inner);

        if fallback {
            tracing::warn!("Reply finished without content, using fallback text");
        }
        tracing::info!(chars = message.content.len(), "Turn completed");
        self.emit(SessionEvent::Completed(message.clone()));
        TurnOutcome::Completed(message)
    }

    fn finish_cancelled(&self, guard: RequestGuard, undo: Option<UndoToken>) -> TurnOutcome {
        let id = guard.id();
        let mut inner = self.shared.inner.lock();
        if let Some(undo) = &undo {
            inner.rollback(undo);
        }

        // Stop and clear already reset the state; reaching here while still
        // owning the turn means the token fired some other way.
        let owned = inner.owns_turn(id);
        if owned {
            inner.turn = None;
            inner.state = SessionState::Idle;
        }
        drop(guard);
        drop(inner);

        if owned {
            self.emit(SessionEvent::Cancelled { request_id: id });
        }
        tracing::debug!(request_id = %id, "Turn cancelled");
        TurnOutcome::Cancelled
    }

    fn finish_failed(
        &self,
        guard: RequestGuard,
        undo: Option<UndoToken>,
        error: ChatError,
    ) -> TurnOutcome {
        if error == ChatError::Aborted {
            return self.finish_cancelled(guard, undo);
        }

        let id = guard.id();
        let mut inner = self.shared.inner.lock();
        if let Some(undo) = &undo {
            inner.rollback(undo);
        }
        if !guard.is_active() || !inner.owns_turn(id) {
            drop(inner);
            return self.finish_cancelled(guard, None);
        }

        inner.state = SessionState::Errored;
        inner.error = Some(error.clone());
        inner.turn = None;
        inner.pending = None;
        drop(guard);
        drop(inner);

        tracing::warn!(request_id = %id, error = %error, "Turn failed");
        self.emit(SessionEvent::Failed(error.clone()));
        TurnOutcome::Failed(error)
    }
}

impl<B> Drop for Shared<B> {
    fn drop(&mut self) {
        if let Some(id) = self.requests.cancel() {
            tracing::debug!(request_id = %id, "Session dropped with a turn in flight");
        }
    }
}
