//! Collaborator contract for the remote chat endpoint.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{Message, StoredMessage};

/// Raw response body, chunk by chunk in transport order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Body of a chat request: the new message plus conversation context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Text the user just submitted.
    pub message: String,
    /// Committed transcript before this message, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<StoredMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Persisted conversation to scope the request to. Sent in the path, not the body.
    #[serde(skip)]
    pub chat_id: Option<String>,
    #[serde(default = "default_true")]
    pub save_chat_history: bool,
}

fn default_true() -> bool {
    true
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            save_chat_history: true,
            ..Default::default()
        }
    }

    /// Attach the prior transcript as context.
    pub fn with_history(mut self, history: &[Message]) -> Self {
        self.messages = history.iter().map(StoredMessage::from).collect();
        self
    }

    pub fn with_chat_id(mut self, chat_id: Option<String>) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_save_chat_history(mut self, save: bool) -> Self {
        self.save_chat_history = save;
        self
    }
}

/// A response whose headers arrived with a success status.
pub struct ChatResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for ChatResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// The remote endpoint a session talks to.
///
/// Implementations return `Http` for non-2xx responses and `Network` for
/// transport failures. They never need to handle cancellation; the request
/// manager races them against the session's abort token.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue a request and wait for the response headers.
    async fn open(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

#[async_trait]
impl<T: ChatBackend + ?Sized> ChatBackend for std::sync::Arc<T> {
    async fn open(&self, request: &ChatRequest) -> Result<ChatResponse> {
        (**self).open(request).await
    }
}
