//! Stream decoding.
//!
//! Turns the raw response body into text increments. Two wire shapes are
//! accepted:
//!
//! - event-stream: newline-delimited `data: {"content": "..."}` frames,
//!   terminated by `data: [DONE]`
//! - whole body: the full answer in one body, either plain text or JSON
//!
//! The shape is sniffed from the first bytes of the body. The content type is
//! not trusted, since the backend labels whole-body replies as
//! `text/event-stream` too.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::ByteStream;
use crate::error::{ChatError, Result};

/// Terminal sentinel of an event stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Line prefixes that identify an event stream.
const EVENT_STREAM_PREFIXES: [&[u8]; 5] = [b"data:", b"event:", b"id:", b"retry:", b":"];

/// JSON fields that may carry the answer in a whole-body reply.
const WHOLE_BODY_FIELDS: [&str; 4] = ["content", "output", "message", "answer"];

/// Lazy sequence of text increments.
pub type IncrementStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Wire shape of a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    EventStream,
    WholeBody,
}

/// Incremental body decoder.
///
/// Bytes are buffered until a complete frame (or, in whole-body mode, the
/// complete body) is available, so multi-byte characters split across chunks
/// survive intact.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    format: Option<WireFormat>,
    buffer: Vec<u8>,
    skipped_frames: usize,
    last_malformed: Option<ChatError>,
    saw_done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder with a fixed wire format instead of sniffing.
    pub fn with_format(format: WireFormat) -> Self {
        Self {
            format: Some(format),
            ..Self::default()
        }
    }

    /// The detected format, once enough bytes arrived to tell.
    pub fn format(&self) -> Option<WireFormat> {
        self.format
    }

    /// Number of malformed frames skipped so far.
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    /// The most recent frame that failed to parse.
    pub fn last_malformed(&self) -> Option<&ChatError> {
        self.last_malformed.as_ref()
    }

    /// Whether the `[DONE]` sentinel was seen.
    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    /// Feed one chunk, returning the increments it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        if self.format.is_none() {
            self.format = sniff(&self.buffer);
        }

        match self.format {
            Some(WireFormat::EventStream) => self.drain_lines(),
            _ => Vec::new(),
        }
    }

    /// Signal end of body, returning whatever the buffer still holds.
    pub fn finish(&mut self) -> Vec<String> {
        let format = self.format.or_else(|| {
            if self.buffer.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(WireFormat::WholeBody)
            }
        });

        match format {
            Some(WireFormat::EventStream) => {
                let mut increments = self.drain_lines();
                let rest = std::mem::take(&mut self.buffer);
                increments.extend(self.handle_line(&rest));
                increments
            }
            Some(WireFormat::WholeBody) => {
                let body = std::mem::take(&mut self.buffer);
                extract_whole_body(&String::from_utf8_lossy(&body))
                    .into_iter()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut increments = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            increments.extend(self.handle_line(&line));
        }
        increments
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches(['\n', '\r']);
        let data = line.strip_prefix("data:")?;
        let data = data.strip_prefix(' ').unwrap_or(data);
        self.parse_frame(data)
    }

    fn parse_frame(&mut self, data: &str) -> Option<String> {
        let data = data.trim();
        if data.is_empty() {
            return None;
        }
        if data == DONE_SENTINEL {
            self.saw_done = true;
            return None;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(frame)) => match frame.get("content") {
                Some(Value::String(content)) if !content.is_empty() => Some(content.clone()),
                _ => {
                    tracing::trace!("Frame without content, ignoring");
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                let error = ChatError::MalformedFrame(e.to_string());
                self.skipped_frames += 1;
                tracing::warn!(
                    error = %error,
                    frame_len = data.len(),
                    "Skipping malformed stream frame"
                );
                self.last_malformed = Some(error);
                None
            }
        }
    }
}

/// Decide the wire format from the first non-whitespace bytes.
fn sniff(buffer: &[u8]) -> Option<WireFormat> {
    let start = buffer.iter().position(|b| !b.is_ascii_whitespace())?;
    let head = &buffer[start..];

    for prefix in EVENT_STREAM_PREFIXES {
        if head.starts_with(prefix) {
            return Some(WireFormat::EventStream);
        }
        if prefix.starts_with(head) {
            // Not enough bytes yet to rule the prefix out.
            return None;
        }
    }
    Some(WireFormat::WholeBody)
}

/// Pull the answer out of a whole-body reply.
fn extract_whole_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(text)) => Some(text).filter(|t| !t.is_empty()),
        Ok(Value::Object(object)) => WHOLE_BODY_FIELDS
            .iter()
            .find_map(|field| object.get(*field).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| Some(body.to_string())),
        _ => Some(body.to_string()),
    }
}

enum Read {
    Chunk(Bytes),
    End,
    Cancelled,
    Failed(ChatError),
}

async fn read_chunk(body: &mut ByteStream, idle_timeout: Option<Duration>) -> Read {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, body.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Read::Failed(ChatError::StreamTimeout {
                    secs: limit.as_secs(),
                });
            }
        },
        None => body.next().await,
    };

    match next {
        Some(Ok(bytes)) => Read::Chunk(bytes),
        Some(Err(e)) => Read::Failed(e),
        None => Read::End,
    }
}

/// Decode `body` into increments, observing `token` between every chunk read.
///
/// The stream ends after the body closes, after the first error, or with
/// [`ChatError::Aborted`] once the token fires. A stall longer than
/// `idle_timeout` ends it with [`ChatError::StreamTimeout`].
pub fn decode_stream(
    mut body: ByteStream,
    token: CancellationToken,
    idle_timeout: Option<Duration>,
) -> IncrementStream {
    Box::pin(async_stream::stream! {
        let mut decoder = StreamDecoder::new();
        let mut chunks = 0usize;

        loop {
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => Read::Cancelled,
                read = read_chunk(&mut body, idle_timeout) => read,
            };

            match read {
                Read::Chunk(bytes) => {
                    chunks += 1;
                    for increment in decoder.push(&bytes) {
                        if token.is_cancelled() {
                            yield Err(ChatError::Aborted);
                            return;
                        }
                        yield Ok(increment);
                    }
                }
                Read::End => {
                    for increment in decoder.finish() {
                        yield Ok(increment);
                    }
                    tracing::debug!(
                        chunks,
                        format = ?decoder.format(),
                        skipped_frames = decoder.skipped_frames(),
                        last_malformed = ?decoder.last_malformed(),
                        "Response stream closed"
                    );
                    return;
                }
                Read::Cancelled => {
                    yield Err(ChatError::Aborted);
                    return;
                }
                Read::Failed(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}
