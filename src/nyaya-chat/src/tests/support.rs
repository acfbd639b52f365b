//! Scripted backend for driving sessions in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use parking_lot::Mutex;

use crate::backend::{ByteStream, ChatBackend, ChatRequest, ChatResponse};
use crate::error::{ChatError, Result};

pub(crate) type BodySender = mpsc::UnboundedSender<Result<Bytes>>;

pub(crate) enum Reply {
    /// Complete body delivered as these chunks.
    Chunks(Vec<&'static str>),
    /// Body fed by the test through a [`BodySender`].
    Manual(mpsc::UnboundedReceiver<Result<Bytes>>),
    Status(u16),
    Network,
    /// Headers never arrive.
    Hang,
}

/// Backend replaying one scripted reply per request.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        })
    }

    pub(crate) fn push(&self, reply: Reply) {
        self.replies.lock().push_back(reply);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn open(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let reply = self.replies.lock().pop_front().unwrap_or(Reply::Status(500));
        let body: ByteStream = match reply {
            Reply::Chunks(chunks) => Box::pin(futures::stream::iter(
                chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))),
            )),
            Reply::Manual(rx) => Box::pin(rx),
            Reply::Status(status) => return Err(ChatError::http(status, "scripted failure")),
            Reply::Network => {
                return Err(ChatError::network("http://scripted", "connection refused"));
            }
            Reply::Hang => return futures::future::pending().await,
        };

        Ok(ChatResponse {
            status: 200,
            content_type: Some("text/event-stream".to_string()),
            body,
        })
    }
}

/// A manually fed reply and the sender that feeds it.
pub(crate) fn manual_reply() -> (Reply, BodySender) {
    let (tx, rx) = mpsc::unbounded();
    (Reply::Manual(rx), tx)
}

pub(crate) fn feed(tx: &BodySender, chunk: &'static str) {
    tx.unbounded_send(Ok(Bytes::from_static(chunk.as_bytes())))
        .expect("body receiver alive");
}

/// Yield until `condition` holds, failing the test after a few seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}
