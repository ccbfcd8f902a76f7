//! Error types for the chat engine.

use thiserror::Error;

/// Chat engine error type.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// HTTP client construction/configuration error.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    /// Classified failure from a network-facing backend call.
    #[error("backend error: {0}")]
    Backend(#[from] SendFailure),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// The closed set of failure kinds a network-facing call can report.
///
/// Every kind maps to its own user-facing explanation; all of them trigger
/// the same offline-placeholder fallback during a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendFailureKind {
    /// The backend endpoint answered 404.
    EndpointNotFound,
    /// TCP connection was refused.
    ConnectionRefused,
    /// The request timed out.
    Timeout,
    /// DNS resolution failed.
    HostUnreachable,
    /// Anything else.
    Unexpected,
}

impl SendFailureKind {
    /// Short stable token used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EndpointNotFound => "not-found",
            Self::ConnectionRefused => "connection-refused",
            Self::Timeout => "timeout",
            Self::HostUnreachable => "unresolved-host",
            Self::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for SendFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged failure value returned from every network-facing call.
///
/// Expected network trouble is data, not a panic or an opaque error chain:
/// callers match on [`SendFailureKind`] and show [`SendFailure::user_message`]
/// instead of a raw transport string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct SendFailure {
    /// Which of the five classified kinds occurred.
    pub kind: SendFailureKind,
    /// Transport-level detail, for logs only. Never shown verbatim.
    pub detail: String,
}

impl SendFailure {
    /// Build a failure of the given kind.
    #[must_use]
    pub fn new(kind: SendFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// 404 from the backend.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(SendFailureKind::EndpointNotFound, detail)
    }

    /// Connection refused.
    #[must_use]
    pub fn connection_refused(detail: impl Into<String>) -> Self {
        Self::new(SendFailureKind::ConnectionRefused, detail)
    }

    /// Request timeout.
    #[must_use]
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(SendFailureKind::Timeout, detail)
    }

    /// DNS resolution failure.
    #[must_use]
    pub fn host_unreachable(detail: impl Into<String>) -> Self {
        Self::new(SendFailureKind::HostUnreachable, detail)
    }

    /// Unclassified failure.
    #[must_use]
    pub fn unexpected(detail: impl Into<String>) -> Self {
        Self::new(SendFailureKind::Unexpected, detail)
    }

    /// True when the backend reported the resource missing.
    ///
    /// Callers use this to drop local conversations the server no longer
    /// knows about.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, SendFailureKind::EndpointNotFound)
    }

    /// Short human-readable explanation, one distinct string per kind.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self.kind {
            SendFailureKind::EndpointNotFound => {
                "The chat service endpoint was not found (404). Make sure the server is running."
                    .to_owned()
            }
            SendFailureKind::ConnectionRefused => "Could not connect to the server.".to_owned(),
            SendFailureKind::Timeout => "The server took too long to respond.".to_owned(),
            SendFailureKind::HostUnreachable => "The server is unreachable.".to_owned(),
            SendFailureKind::Unexpected => format!("Error: {}", self.detail),
        }
    }

    /// Body of the assistant-role placeholder persisted when a send fails.
    #[must_use]
    pub fn offline_notice(&self) -> String {
        format!(
            "⚠️ **Offline mode**\n\n{}\n\nYour message has been saved locally.",
            self.user_message()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{SendFailure, SendFailureKind};
    use std::collections::HashSet;

    #[test]
    fn test_each_kind_has_a_distinct_user_message() {
        let kinds = [
            SendFailureKind::EndpointNotFound,
            SendFailureKind::ConnectionRefused,
            SendFailureKind::Timeout,
            SendFailureKind::HostUnreachable,
            SendFailureKind::Unexpected,
        ];
        let messages: HashSet<String> = kinds
            .iter()
            .map(|k| SendFailure::new(*k, "boom").user_message())
            .collect();
        assert_eq!(messages.len(), kinds.len());
    }

    #[test]
    fn test_unexpected_carries_the_detail() {
        let failure = SendFailure::unexpected("socket exploded");
        assert!(failure.user_message().contains("socket exploded"));
    }

    #[test]
    fn test_offline_notice_mentions_local_save() {
        let notice = SendFailure::connection_refused("refused").offline_notice();
        assert!(notice.starts_with("⚠️"));
        assert!(notice.contains("Could not connect to the server."));
        assert!(notice.contains("saved locally"));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(SendFailure::not_found("404").is_not_found());
        assert!(!SendFailure::timeout("t").is_not_found());
    }
}
