//! Request lifecycle management.
//!
//! A session owns exactly one [`RequestManager`], which owns one request
//! slot. At most one request occupies the slot at a time; each occupant gets
//! a fresh cancellation token, and every mutation made on behalf of a request
//! is guarded by [`RequestGuard::is_active`] so a cancelled or superseded
//! request cannot touch the transcript after the fact.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{ChatBackend, ChatRequest, ChatResponse};
use crate::error::{ChatError, Result};

/// Identifies one request issued by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

struct ActiveRequest {
    id: RequestId,
    token: CancellationToken,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveRequest>,
    issued: u64,
}

impl Slot {
    fn cancel(&mut self) -> Option<RequestId> {
        let active = self.active.take()?;
        active.token.cancel();
        Some(active.id)
    }

    fn is_active(&self, id: RequestId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == id)
    }
}

/// Owns the single pending-request slot of a session.
pub struct RequestManager {
    slot: Arc<Mutex<Slot>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Claim the slot for a new request.
    ///
    /// Fails with [`ChatError::Busy`] while another request holds it.
    pub fn begin(&self) -> Result<RequestGuard> {
        let mut slot = self.slot.lock();
        if slot.active.is_some() {
            return Err(ChatError::Busy);
        }

        slot.issued += 1;
        let id = RequestId(slot.issued);
        let token = CancellationToken::new();
        slot.active = Some(ActiveRequest {
            id,
            token: token.clone(),
        });
        tracing::debug!(request_id = %id, "Request slot claimed");

        Ok(RequestGuard {
            id,
            token,
            slot: Arc::clone(&self.slot),
        })
    }

    /// Claim the slot and issue `request`, returning once headers arrive.
    pub async fn send<B>(&self, backend: &B, request: &ChatRequest) -> Result<InFlight>
    where
        B: ChatBackend + ?Sized,
    {
        let guard = self.begin()?;
        let response = guard.open(backend, request).await?;
        Ok(InFlight { guard, response })
    }

    /// Signal the active request's token and free the slot.
    ///
    /// Returns the id of the request that was cancelled, if any.
    pub fn cancel(&self) -> Option<RequestId> {
        let cancelled = self.slot.lock().cancel();
        if let Some(id) = cancelled {
            tracing::debug!(request_id = %id, "Request cancelled");
        }
        cancelled
    }

    pub fn is_loading(&self) -> bool {
        self.slot.lock().active.is_some()
    }

    pub fn is_active(&self, id: RequestId) -> bool {
        self.slot.lock().is_active(id)
    }

    /// A handle that can cancel the active request from another task.
    pub fn cancel_handle(&self) -> StopHandle {
        StopHandle {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        self.slot.lock().cancel();
    }
}

/// Cloneable handle for stopping whatever request is in flight.
#[derive(Clone)]
pub struct StopHandle {
    slot: Arc<Mutex<Slot>>,
}

impl StopHandle {
    /// Cancel the active request, if any. Returns whether one was running.
    pub fn stop(&self) -> bool {
        self.slot.lock().cancel().is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.slot.lock().active.is_some()
    }
}

/// Exclusive claim on the request slot.
///
/// Dropping the guard frees the slot, unless the request was already
/// cancelled and a newer one took its place.
pub struct RequestGuard {
    id: RequestId,
    token: CancellationToken,
    slot: Arc<Mutex<Slot>>,
}

impl RequestGuard {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The abort token shared with the in-flight fetch and stream reader.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether this request still owns the slot.
    pub fn is_active(&self) -> bool {
        self.slot.lock().is_active(self.id)
    }

    /// Issue `request` and wait for headers, giving up as soon as the token fires.
    pub async fn open<B>(&self, backend: &B, request: &ChatRequest) -> Result<ChatResponse>
    where
        B: ChatBackend + ?Sized,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(ChatError::Aborted),
            result = backend.open(request) => {
                if self.token.is_cancelled() {
                    return Err(ChatError::Aborted);
                }
                result
            }
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.is_active(self.id) {
            slot.active = None;
        }
    }
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// A request whose response headers arrived successfully.
#[derive(Debug)]
pub struct InFlight {
    pub guard: RequestGuard,
    pub response: ChatResponse,
}

impl InFlight {
    pub fn into_parts(self) -> (RequestGuard, ChatResponse) {
        (self.guard, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ByteStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingBackend {
        calls: AtomicUsize,
        delay: Duration,
        status: u16,
    }

    impl CountingBackend {
        fn new(delay: Duration, status: u16) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                status,
            }
        }
    }

    #[async_trait]
    impl ChatBackend for CountingBackend {
        async fn open(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.status >= 400 {
                return Err(ChatError::http(self.status, "Internal server error"));
            }
            let body: ByteStream = Box::pin(futures::stream::empty());
            Ok(ChatResponse {
                status: self.status,
                content_type: None,
                body,
            })
        }
    }

    #[test]
    fn test_begin_rejects_second_request() {
        let manager = RequestManager::new();
        let guard = manager.begin().expect("first claim");
        assert!(manager.is_loading());
        assert_eq!(manager.begin().unwrap_err(), ChatError::Busy);
        drop(guard);
        assert!(!manager.is_loading());
        assert!(manager.begin().is_ok());
    }

    #[test]
    fn test_request_ids_increase() {
        let manager = RequestManager::new();
        let first = manager.begin().unwrap().id();
        let second = manager.begin().unwrap().id();
        assert!(second > first);
    }

    #[test]
    fn test_cancel_frees_slot_and_fires_token() {
        let manager = RequestManager::new();
        let guard = manager.begin().unwrap();
        assert_eq!(manager.cancel(), Some(guard.id()));
        assert!(guard.is_cancelled());
        assert!(!guard.is_active());
        assert!(!manager.is_loading());
        assert_eq!(manager.cancel(), None);
    }

    #[test]
    fn test_stale_guard_drop_keeps_newer_request() {
        let manager = RequestManager::new();
        let old = manager.begin().unwrap();
        manager.cancel();
        let new = manager.begin().unwrap();
        drop(old);
        assert!(new.is_active());
        assert!(manager.is_loading());
    }

    #[test]
    fn test_stop_handle() {
        let manager = RequestManager::new();
        let handle = manager.cancel_handle();
        assert!(!handle.stop());
        let guard = manager.begin().unwrap();
        assert!(handle.is_loading());
        assert!(handle.stop());
        assert!(guard.is_cancelled());
    }

    #[test]
    fn test_dropping_manager_cancels() {
        let manager = RequestManager::new();
        let guard = manager.begin().unwrap();
        drop(manager);
        assert!(guard.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_while_busy_makes_no_call() {
        let manager = RequestManager::new();
        let backend = CountingBackend::new(Duration::ZERO, 200);
        let _held = manager.begin().unwrap();

        let result = manager.send(&backend, &ChatRequest::new("hi")).await;
        assert_eq!(result.unwrap_err(), ChatError::Busy);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_returns_in_flight() {
        let manager = RequestManager::new();
        let backend = CountingBackend::new(Duration::ZERO, 200);
        let in_flight = manager.send(&backend, &ChatRequest::new("hi")).await.unwrap();
        assert_eq!(in_flight.response.status, 200);
        assert!(in_flight.guard.is_active());
    }

    #[tokio::test]
    async fn test_send_http_error_frees_slot() {
        let manager = RequestManager::new();
        let backend = CountingBackend::new(Duration::ZERO, 500);
        let err = manager
            .send(&backend, &ChatRequest::new("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(!manager.is_loading());
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_headers() {
        let manager = RequestManager::new();
        let backend = CountingBackend::new(Duration::from_secs(30), 200);
        let handle = manager.cancel_handle();
        let request = ChatRequest::new("hi");

        let (result, _) = tokio::join!(manager.send(&backend, &request), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.stop();
        });
        assert_eq!(result.unwrap_err(), ChatError::Aborted);
    }
}
