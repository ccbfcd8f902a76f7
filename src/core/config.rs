//! Configuration for the chat engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::errors::{ChatError, ChatResult};

/// Top-level configuration for the chat engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Request/response HTTP API settings.
    pub api: ApiConfig,
    /// Streaming channel settings.
    pub stream: StreamConfig,
    /// Local persistence settings.
    pub storage: StorageConfig,
}

impl ChatConfig {
    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        if self.api.request_timeout_secs == 0 {
            return Err(ChatError::InvalidConfig(
                "api.request_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.api.page_size == 0 {
            return Err(ChatError::InvalidConfig(
                "api.page_size must be > 0".to_string(),
            ));
        }

        Url::parse(&self.api.base_url)?;

        let stream_url = Url::parse(&self.stream.url)?;
        if !matches!(stream_url.scheme(), "ws" | "wss") {
            return Err(ChatError::InvalidConfig(format!(
                "stream.url must use ws:// or wss://, got {}",
                stream_url.scheme()
            )));
        }

        Ok(())
    }
}

/// Request/response HTTP API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the chat API, including any path prefix.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Page size used when listing conversations.
    pub page_size: u32,
}

impl ApiConfig {
    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            request_timeout_secs: 30,
            page_size: 100,
        }
    }
}

/// Streaming channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
    /// WebSocket endpoint URL (`ws://` or `wss://`).
    pub url: String,
    /// Whether outbound chat frames ask the backend to stream the reply.
    pub request_streaming: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/api/v1/chat/ws".to_string(),
            request_streaming: true,
        }
    }
}

/// Local persistence settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("companion_chat.sqlite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChatConfig;

    #[test]
    fn test_default_config_validates() {
        assert!(ChatConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = ChatConfig::default();
        config.api.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        let mut config = ChatConfig::default();
        config.api.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_url_must_be_websocket() {
        let mut config = ChatConfig::default();
        config.stream.url = "http://127.0.0.1:8000/chat/ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_api_url_is_rejected() {
        let mut config = ChatConfig::default();
        config.api.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
