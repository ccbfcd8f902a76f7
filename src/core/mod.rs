//! Core chat types, identifiers, configuration, and errors.

pub mod config;
pub mod errors;
pub mod ids;
pub mod types;

pub use config::{ApiConfig, ChatConfig, StorageConfig, StreamConfig};
pub use errors::{ChatError, ChatResult, SendFailure, SendFailureKind};
pub use ids::{ConversationId, MessageId, StreamId};
pub use types::{ChatMessage, Conversation, MessageRole, Provenance, datetime_from_millis};
