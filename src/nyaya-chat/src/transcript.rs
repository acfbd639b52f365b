//! Ordered, append-only conversation transcript.
//!
//! Order is insertion order and ids never change. Only messages still marked
//! [`MessageStatus::Pending`] can be edited or rolled back; everything else is
//! frozen once created.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, MessageStatus};
use crate::request::RequestId;

/// Names the single message a request inserted, so that request can undo
/// exactly its own mutation and nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoToken {
    request_id: RequestId,
    message_id: MessageId,
}

impl UndoToken {
    pub fn new(request_id: RequestId, message_id: MessageId) -> Self {
        Self {
            request_id,
            message_id,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

/// Transcript store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transcript from previously persisted messages.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Add a message to the end.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Mutate the last message matching `predicate`.
    ///
    /// Returns `false` when nothing matched or the match is already committed.
    pub fn replace_last<P, U>(&mut self, predicate: P, updater: U) -> bool
    where
        P: Fn(&Message) -> bool,
        U: FnOnce(&mut Message),
    {
        match self.messages.iter_mut().rev().find(|m| predicate(m)) {
            Some(message) if message.is_pending() => {
                updater(message);
                true
            }
            _ => false,
        }
    }

    /// Discard the most recent entry.
    pub fn remove_last(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Remove the message an undo token names, if it is still pending.
    pub fn rollback(&mut self, token: &UndoToken) -> bool {
        let Some(index) = self.position(token.message_id()) else {
            return false;
        };
        if self.messages[index].status != MessageStatus::Pending {
            return false;
        }
        self.messages.remove(index);
        true
    }

    /// Drop the message at `index` and everything after it.
    pub fn truncate_from(&mut self, index: usize) -> Vec<Message> {
        if index >= self.messages.len() {
            return Vec::new();
        }
        self.messages.split_off(index)
    }

    /// Index of the message with the given id.
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn at(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Committed messages only; the context sent along with a new request.
    pub fn committed(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_pending())
            .cloned()
            .collect()
    }
}
