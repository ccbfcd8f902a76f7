//! Persisted record types: conversations, messages, and their metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ids::{ConversationId, MessageId};

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Authored by the local user.
    User,
    /// Authored by the assistant (including offline placeholders).
    Assistant,
}

impl MessageRole {
    /// Stable wire/storage token.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a wire role. Anything unrecognized decays to `Assistant`,
    /// matching the backend's own default for reply messages.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("user") {
            Self::User
        } else {
            Self::Assistant
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance metadata the backend attaches to assistant replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Name of the agent that produced the reply.
    pub agent_name: Option<String>,
    /// Upstream provider identifier.
    pub provider: Option<String>,
    /// Display color associated with the provider.
    pub provider_color: Option<String>,
    /// Concrete model that generated the content.
    pub model_used: Option<String>,
    /// Confidence score in `0.0..=1.0`.
    pub confidence: Option<f32>,
}

impl Provenance {
    /// Provenance stamped onto synthesized offline placeholders.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            agent_name: Some("offline".to_string()),
            provider: Some("offline".to_string()),
            ..Self::default()
        }
    }
}

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message identity (backend-issued or locally minted).
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author role.
    pub role: MessageRole,
    /// Textual content. Append-only except for the streaming fold.
    pub content: String,
    /// Optional provenance metadata.
    pub provenance: Provenance,
    /// Creation instant; messages order by it within a conversation.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a user-authored message under a pre-minted id.
    #[must_use]
    pub fn user(id: MessageId, conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id,
            conversation_id,
            role: MessageRole::User,
            content: content.into(),
            provenance: Provenance::default(),
            created_at: Utc::now(),
        }
    }

    /// Build an assistant-authored message.
    #[must_use]
    pub fn assistant(
        id: MessageId,
        conversation_id: ConversationId,
        content: impl Into<String>,
        provenance: Provenance,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            role: MessageRole::Assistant,
            content: content.into(),
            provenance,
            created_at,
        }
    }

    /// Copy of this message with its content replaced.
    ///
    /// The streaming fold uses this for the one sanctioned in-place
    /// mutation of a trailing assistant message.
    #[must_use]
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        let mut updated = self.clone();
        updated.content = content.into();
        updated
    }

    /// Creation instant as epoch milliseconds (storage representation).
    #[must_use]
    pub const fn created_at_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

/// One conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identity (backend-issued or locally minted).
    pub id: ConversationId,
    /// Display title.
    pub title: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Freshness marker, bumped after every successful send.
    pub updated_at: DateTime<Utc>,
    /// Instant of the latest message, when known.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Whether the user archived this thread.
    pub is_archived: bool,
    /// Whether the user pinned this thread.
    pub is_pinned: bool,
    /// Server-generated running summary, when available.
    pub summary: Option<String>,
    /// Server-reported message count, when available.
    pub message_count: Option<u32>,
}

impl Conversation {
    /// Title used when none was supplied or derivable.
    pub const DEFAULT_TITLE: &'static str = "New chat";

    /// Build a fresh conversation with both timestamps set to now.
    #[must_use]
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            created_at: now,
            updated_at: now,
            last_message_at: None,
            is_archived: false,
            is_pinned: false,
            summary: None,
            message_count: None,
        }
    }

    /// Resolve an optional/blank title to something displayable.
    #[must_use]
    pub fn title_or_default(title: Option<&str>) -> String {
        match title {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => Self::DEFAULT_TITLE.to_string(),
        }
    }

    /// Instant used for most-recently-active ordering: the latest message
    /// when known, otherwise the freshness marker.
    #[must_use]
    pub fn recency(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.updated_at)
    }
}

/// Convert storage epoch milliseconds back into an instant.
///
/// Out-of-range values fall back to the epoch rather than failing the read.
#[must_use]
pub fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}
