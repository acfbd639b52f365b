//! HTTP implementation of [`ChatBackend`].

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{ByteStream, ChatBackend, ChatRequest, ChatResponse};
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::http_client;
use crate::message::{Message, StoredMessage};

/// Title given to a conversation the backend returned nothing useful for.
pub const DEFAULT_CONVERSATION_TITLE: &str = "Legal AI Assistant";

const ACCEPT_STREAM: &str = "text/event-stream, application/json, text/plain";
const BODY_PREVIEW_LEN: usize = 200;

/// A persisted conversation, hydrated from the backend of record.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

/// One entry of the conversation list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(alias = "sessionId", alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "updatedAt", alias = "createdAt")]
    pub timestamp: Option<String>,
}

/// Client for the chat endpoint.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    conversations_endpoint: Option<String>,
    auth_token: Option<String>,
}

impl HttpBackend {
    /// Create a backend for `endpoint` with the default streaming client.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: http_client::create_streaming_client()?,
            endpoint: endpoint.into(),
            conversations_endpoint: None,
            auth_token: None,
        })
    }

    /// Create a backend from configuration.
    pub fn from_config(config: &ChatConfig) -> Result<Self> {
        let client = http_client::create_client(config.request_timeout(), config.connect_timeout())?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            conversations_endpoint: Some(config.conversations_endpoint.clone()),
            auth_token: config.auth_token.clone(),
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_conversations_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.conversations_endpoint = Some(endpoint.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn chat_url(&self, chat_id: Option<&str>) -> String {
        let base = self.endpoint.trim_end_matches('/');
        match chat_id {
            Some(id) if !id.is_empty() => format!("{base}/{id}"),
            _ => base.to_string(),
        }
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {token}")),
            None => req,
        }
    }

    /// Fetch a persisted conversation by id.
    pub async fn load_conversation(&self, chat_id: &str) -> Result<Conversation> {
        let url = self.chat_url(Some(chat_id));
        tracing::debug!(url = %url, "Loading conversation");

        let resp = self
            .authorize(self.client.get(&url).header(ACCEPT, "application/json"))
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(e, &url))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp, &url).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ChatError::from_reqwest(e, &url))?;
        Ok(conversation_from_value(chat_id, body))
    }

    /// List the user's persisted conversations.
    ///
    /// A 404 from the backend means the user has none yet.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let url = self
            .conversations_endpoint
            .clone()
            .ok_or_else(|| ChatError::config("No conversations endpoint configured"))?;

        let resp = self
            .authorize(self.client.get(&url).header(ACCEPT, "application/json"))
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(e, &url))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(url = %url, "No conversations found");
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(error_from_response(resp, &url).await);
        }

        let summaries: Vec<ConversationSummary> = resp
            .json()
            .await
            .map_err(|e| ChatError::from_reqwest(e, &url))?;
        Ok(summaries)
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn open(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let url = self.chat_url(request.chat_id.as_deref());
        tracing::debug!(
            url = %url,
            history = request.messages.len(),
            "Sending chat request"
        );

        let resp = self
            .authorize(
                self.client
                    .post(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, ACCEPT_STREAM),
            )
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %url, "Failed to send request");
                ChatError::from_reqwest(e, &url)
            })?;

        tracing::debug!(status = %resp.status(), "Response received");

        if !resp.status().is_success() {
            return Err(error_from_response(resp, &url).await);
        }

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let endpoint = url.clone();
        let body: ByteStream = Box::pin(
            resp.bytes_stream()
                .map(move |chunk| chunk.map_err(|e| ChatError::from_reqwest(e, &endpoint))),
        );

        Ok(ChatResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Turn a non-2xx response into `ChatError::Http`, preferring a JSON error message.
async fn error_from_response(resp: reqwest::Response, url: &str) -> ChatError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| json_error_message(&v))
        .unwrap_or_else(|| {
            let preview: String = body.chars().take(BODY_PREVIEW_LEN).collect();
            if preview.len() < body.len() {
                format!("HTTP {status} from {url}: {preview}...")
            } else if preview.is_empty() {
                format!("HTTP {status} from {url}")
            } else {
                format!("HTTP {status} from {url}: {preview}")
            }
        });

    tracing::error!(status = %status, url = %url, body = %body, "Chat request failed");
    ChatError::http(status.as_u16(), message)
}

fn json_error_message(value: &Value) -> Option<String> {
    match value.get("error") {
        Some(Value::String(message)) => Some(message.clone()),
        Some(error) => error.get("message")?.as_str().map(String::from),
        None => value.get("message")?.as_str().map(String::from),
    }
}

/// Normalize whatever the backend returned for a conversation.
fn conversation_from_value(chat_id: &str, value: Value) -> Conversation {
    let Value::Object(mut object) = value else {
        return Conversation {
            id: chat_id.to_string(),
            title: DEFAULT_CONVERSATION_TITLE.to_string(),
            messages: Vec::new(),
        };
    };

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(chat_id)
        .to_string();
    let title = object
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_CONVERSATION_TITLE)
        .to_string();

    let raw = match object.remove("messages") {
        Some(Value::Array(items)) => items,
        _ => match object.remove("chat") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
    };

    let messages = raw
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<StoredMessage>(item) {
            Ok(stored) => Some(Message::from(stored)),
            Err(e) => {
                tracing::warn!(error = %e, chat_id, "Skipping unreadable stored message");
                None
            }
        })
        .collect();

    Conversation {
        id,
        title,
        messages,
    }
}
