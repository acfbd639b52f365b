//! Session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

/// Chat session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Chat endpoint; a conversation id is appended to scope requests.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Endpoint listing the user's persisted conversations.
    #[serde(default = "default_conversations_endpoint")]
    pub conversations_endpoint: String,

    /// Persisted conversation to continue. None starts a new one.
    #[serde(default)]
    pub chat_id: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub session_id: Option<String>,

    /// Bearer token sent with every request.
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_true")]
    pub save_chat_history: bool,

    /// Retries allowed after a failed turn before the session gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds without a chunk before a stream is considered stalled. 0 disables.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Overall request timeout. It covers the full streamed reply, so it also
    /// caps how long an answer may stream. 0 disables it and leaves stalls to
    /// the idle timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub voice: VoiceConfig,
}

fn default_endpoint() -> String {
    "http://localhost:3000/api/chat".to_string()
}

fn default_conversations_endpoint() -> String {
    "http://localhost:3000/api/chats".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_stream_idle_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            conversations_endpoint: default_conversations_endpoint(),
            chat_id: None,
            user_id: None,
            session_id: None,
            auth_token: None,
            save_chat_history: true,
            max_retries: default_max_retries(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            voice: VoiceConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Io(format!("{}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `NYAYA_*` environment variables applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `NYAYA_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("NYAYA_ENDPOINT") {
            self.endpoint = endpoint;
        }

        if let Ok(endpoint) = std::env::var("NYAYA_CONVERSATIONS_ENDPOINT") {
            self.conversations_endpoint = endpoint;
        }

        if let Ok(chat_id) = std::env::var("NYAYA_CHAT_ID") {
            self.chat_id = Some(chat_id).filter(|id| !id.is_empty());
        }

        if let Ok(user_id) = std::env::var("NYAYA_USER_ID") {
            self.user_id = Some(user_id);
        }

        if let Ok(token) = std::env::var("NYAYA_AUTH_TOKEN") {
            self.auth_token = Some(token);
        }

        if let Ok(save) = std::env::var("NYAYA_SAVE_CHAT_HISTORY") {
            self.save_chat_history = parse_env("NYAYA_SAVE_CHAT_HISTORY", &save)?;
        }

        if let Ok(retries) = std::env::var("NYAYA_MAX_RETRIES") {
            self.max_retries = parse_env("NYAYA_MAX_RETRIES", &retries)?;
        }

        if let Ok(secs) = std::env::var("NYAYA_STREAM_IDLE_TIMEOUT") {
            self.stream_idle_timeout_secs = parse_env("NYAYA_STREAM_IDLE_TIMEOUT", &secs)?;
        }

        if let Ok(lang) = std::env::var("NYAYA_VOICE_LANG") {
            self.voice.lang = lang;
        }

        self.validate()
    }

    /// Default config file location: `~/.nyaya/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".nyaya").join("config.toml"))
    }

    /// Check that the endpoint is a usable http(s) URL.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(ChatError::config("endpoint must not be empty"));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ChatError::config(format!(
                "endpoint must be an http(s) URL, got '{}'",
                self.endpoint
            )));
        }
        Ok(())
    }

    /// Idle timeout for streamed replies, if enabled.
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_secs > 0).then(|| Duration::from_secs(self.stream_idle_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Overall request timeout, if enabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ChatError::config(format!("invalid value for {name}: '{value}'")))
}

/// Voice input configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Recognition language tag.
    #[serde(default = "default_lang")]
    pub lang: String,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Delay before the first automatic reconnect.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Delay before a user-requested retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Growth factor applied to the reconnect delay per attempt. 1.0 keeps it fixed.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_lang() -> String {
    "en-US".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    1500
}

fn default_retry_delay() -> u64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            retry_delay_ms: default_retry_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl VoiceConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
