//! Error types for the chat session controller.

use thiserror::Error;

/// Result type alias for chat operations.
pub type Result<T> = std::result::Result<T, ChatError>;

/// Main error type for chat sessions.
///
/// Errors carry messages rather than transport handles so a session can keep
/// the last one around as its error state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    // Request lifecycle
    #[error("A request is already in flight")]
    Busy,

    #[error("Request aborted")]
    Aborted,

    // Transport errors
    #[error("Network error contacting {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Stream stalled: no data received for {secs} seconds")]
    StreamTimeout { secs: u64 },

    // Stream decoding
    #[error("Malformed stream frame: {0}")]
    MalformedFrame(String),

    // Session policy
    #[error("Max retries ({max}) exceeded")]
    RetriesExhausted { max: u32 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Voice input
    #[error("Voice input error: {0}")]
    Voice(String),
}

impl ChatError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an HTTP error for a non-success status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create a network error for the given endpoint.
    pub fn network(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Convert a transport error, adding a hint when a proxy looks responsible.
    pub fn from_reqwest(e: reqwest::Error, endpoint: &str) -> Self {
        if let Some(status) = e.status() {
            return Self::http(status.as_u16(), e.to_string());
        }

        let err_str = e.to_string();
        let message = match detect_proxy_in_use() {
            Some(proxy)
                if err_str.contains("Connection refused")
                    || err_str.contains("connection refused")
                    || err_str.contains("proxy") =>
            {
                format!(
                    "{err_str}. This may be a proxy configuration issue ({proxy}). \
                     Check your HTTPS_PROXY/HTTP_PROXY settings."
                )
            }
            _ => err_str,
        };

        Self::network(endpoint, message)
    }

    /// Whether the error should be shown to the user as an error banner.
    ///
    /// `Busy` is suppressed locally and `Aborted` is a user action.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Busy | Self::Aborted | Self::MalformedFrame(_))
    }

    /// Whether resending the same message may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::StreamTimeout { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// HTTP status code, if this error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Detect if a proxy is configured via environment variables.
fn detect_proxy_in_use() -> Option<String> {
    std::env::var("HTTPS_PROXY")
        .ok()
        .or_else(|| std::env::var("https_proxy").ok())
        .or_else(|| std::env::var("HTTP_PROXY").ok())
        .or_else(|| std::env::var("http_proxy").ok())
}

impl From<std::io::Error> for ChatError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<toml::de::Error> for ChatError {
    fn from(e: toml::de::Error) -> Self {
        Self::TomlParse(e.to_string())
    }
}
