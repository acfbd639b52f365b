//! Streaming chat session controller for the Nyaya legal assistant.
//!
//! A [`ChatSession`] owns a conversation transcript and at most one in-flight
//! request to the chat endpoint. Replies stream in as text increments and are
//! appended to a pending assistant message, which is committed when the stream
//! ends or rolled back if the turn is stopped or fails.

pub mod backend;
pub mod client;
pub mod config;
pub mod decoder;
pub mod error;
pub mod http_client;
pub mod message;
pub mod request;
pub mod session;
pub mod transcript;
pub mod voice;

pub use backend::{ByteStream, ChatBackend, ChatRequest, ChatResponse};
pub use client::{Conversation, ConversationSummary, DEFAULT_CONVERSATION_TITLE, HttpBackend};
pub use config::{ChatConfig, VoiceConfig};
pub use decoder::{IncrementStream, StreamDecoder, WireFormat, decode_stream};
pub use error::{ChatError, Result};
pub use message::{Message, MessageId, MessageStatus, Role, StoredMessage};
pub use request::{InFlight, RequestGuard, RequestId, RequestManager, StopHandle};
pub use session::{
    ChatSession, FALLBACK_RESPONSE, IgnoreReason, SessionEvent, SessionState, TurnOutcome,
};
pub use transcript::{Transcript, UndoToken};
pub use voice::{
    AlwaysOnline, Connectivity, RecognitionErrorKind, RecognitionEvent, RecognitionSegment,
    RecognitionStream, SpeechSource, VoiceInput, VoiceSubscription, format_fragment,
};

// Test module
#[cfg(test)]
mod tests;
