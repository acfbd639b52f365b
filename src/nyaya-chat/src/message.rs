//! Transcript message types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique message identifier, assigned client-side at creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Whether a message may still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Inserted by an in-flight request; may be appended to or rolled back.
    Pending,
    /// Final. Never mutated again.
    #[default]
    Committed,
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    fn new(role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            created_at: Utc::now(),
            status,
        }
    }

    /// Create a committed user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), MessageStatus::Committed)
    }

    /// Create a committed assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into(), MessageStatus::Committed)
    }

    /// Create a committed system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into(), MessageStatus::Committed)
    }

    /// Create the empty, pending assistant message that streamed text lands in.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, String::new(), MessageStatus::Pending)
    }

    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

/// Message shape used by the backend of record for persisted conversations.
///
/// Older records use `message`/`type: "ai"`, newer ones `content`/`role`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "content")]
    pub message: String,
    #[serde(default, rename = "type", alias = "role")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        let role = match stored.kind.as_str() {
            "user" | "human" => Role::User,
            "system" => Role::System,
            _ => Role::Assistant,
        };
        Self {
            id: stored.id.map(MessageId::from).unwrap_or_default(),
            role,
            content: stored.message,
            created_at: stored.timestamp.unwrap_or_else(Utc::now),
            status: MessageStatus::Committed,
        }
    }
}

impl From<&Message> for StoredMessage {
    fn from(message: &Message) -> Self {
        let kind = match message.role {
            Role::User => "user",
            Role::Assistant => "ai",
            Role::System => "system",
        };
        Self {
            id: Some(message.id.to_string()),
            message: message.content.clone(),
            kind: kind.to_string(),
            timestamp: Some(message.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Message::user("hello");
        let b = Message::user("hello");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_placeholder_is_pending_and_empty() {
        let placeholder = Message::assistant_placeholder();
        assert!(placeholder.is_pending());
        assert!(placeholder.is_assistant());
        assert!(placeholder.content.is_empty());
        assert!(!Message::user("hi").is_pending());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_stored_message_legacy_shape() {
        let stored: StoredMessage = serde_json::from_str(
            r#"{"id":"ai-1","message":"Section 498A applies.","type":"ai","timestamp":"2025-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        let message = Message::from(stored);
        assert_eq!(message.id.as_str(), "ai-1");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "Section 498A applies.");
        assert_eq!(message.status, MessageStatus::Committed);
    }

    #[test]
    fn test_stored_message_role_content_shape() {
        let stored: StoredMessage =
            serde_json::from_str(r#"{"content":"What is bail?","role":"user"}"#).unwrap();
        let message = Message::from(stored);
        assert_eq!(message.role, Role::User);
        assert_eq!(message.content, "What is bail?");
        assert!(!message.id.as_str().is_empty());
    }

    #[test]
    fn test_stored_message_from_message() {
        let message = Message::assistant("answer");
        let stored = StoredMessage::from(&message);
        assert_eq!(stored.kind, "ai");
        assert_eq!(stored.id.as_deref(), Some(message.id.as_str()));
    }
}
