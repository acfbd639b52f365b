//! HTTP client factory.
//!
//! All clients share the same User-Agent, tcp_nodelay and pool settings.
//! Chat requests stream for a long time, so their client gets a long overall
//! timeout; stalls mid-stream are caught by the decoder's idle timeout instead.

use std::time::Duration;

use reqwest::Client;

use crate::error::{ChatError, Result};

/// User-Agent string for all HTTP requests
pub const USER_AGENT: &str = concat!("nyaya-cli/", env!("CARGO_PKG_VERSION"));

/// Default timeout for plain JSON requests (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall timeout for streamed chat replies (5 minutes)
pub const STREAMING_TIMEOUT: Duration = Duration::from_secs(300);

/// Default connect timeout (10 seconds)
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle pooled connections are closed after this long so DNS is re-resolved.
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates an HTTP client with default configuration (30s timeout).
pub fn create_default_client() -> Result<Client> {
    create_client(Some(DEFAULT_TIMEOUT), CONNECT_TIMEOUT)
}

/// Creates an HTTP client for streamed replies (5min timeout).
pub fn create_streaming_client() -> Result<Client> {
    create_client(Some(STREAMING_TIMEOUT), CONNECT_TIMEOUT)
}

/// Creates an HTTP client with custom request and connect timeouts.
///
/// The request timeout spans the whole response body; `None` leaves it unbounded.
pub fn create_client(timeout: Option<Duration>, connect_timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .tcp_nodelay(true)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| ChatError::config(format!("Failed to build HTTP client: {e}")))
}
