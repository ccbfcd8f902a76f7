//! Durable local cache of conversations and messages with a live change feed.

pub mod feed;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::core::errors::ChatResult;
use crate::core::ids::{ConversationId, MessageId};
use crate::core::types::{ChatMessage, Conversation};

pub use feed::{ConversationListFeed, MessageFeed};
pub use sqlite::SqliteChatStore;

/// Boxed future type for store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Change notification fanned out to live feeds after each committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// The conversation list changed (insert, update, delete, or wipe).
    ConversationsChanged,
    /// The messages of one conversation changed.
    MessagesChanged(ConversationId),
}

/// Local message store contract.
///
/// The store exclusively owns persisted records; every write notifies
/// subscribers so feeds can re-query. All writes are idempotent by id.
pub trait ChatStore: Send + Sync {
    /// Insert or update a conversation. Never touches its messages.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn upsert_conversation(&self, conversation: Conversation) -> StoreFuture<'_, ChatResult<()>>;

    /// Insert or update one message.
    ///
    /// # Errors
    /// Returns an error if storage access fails (including a missing
    /// owning conversation).
    fn upsert_message(&self, message: ChatMessage) -> StoreFuture<'_, ChatResult<()>>;

    /// Insert or update a batch of messages in one transaction.
    ///
    /// # Errors
    /// Returns an error if storage access fails; the batch is all-or-nothing.
    fn upsert_messages(&self, messages: Vec<ChatMessage>) -> StoreFuture<'_, ChatResult<()>>;

    /// Delete a conversation and, by cascade, all of its messages.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_conversation(&self, id: &ConversationId) -> StoreFuture<'_, ChatResult<()>>;

    /// Delete a single message.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_message(&self, id: &MessageId) -> StoreFuture<'_, ChatResult<()>>;

    /// Fetch one conversation by id.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn conversation(&self, id: &ConversationId)
    -> StoreFuture<'_, ChatResult<Option<Conversation>>>;

    /// All conversations, most recently active first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn conversations(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>>;

    /// Messages of a conversation in creation order (id as tiebreak).
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn messages_of(&self, id: &ConversationId) -> StoreFuture<'_, ChatResult<Vec<ChatMessage>>>;

    /// Bump a conversation's freshness markers (`updated_at` and
    /// `last_message_at`) without altering content.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn touch_updated_at(
        &self,
        id: &ConversationId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ChatResult<()>>;

    /// Replace a conversation's title.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn update_title(
        &self,
        id: &ConversationId,
        title: &str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ChatResult<()>>;

    /// Wipe every conversation and message (logout/reset path).
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn clear_all(&self) -> StoreFuture<'_, ChatResult<()>>;

    /// Subscribe to change notifications. No replay: only changes committed
    /// after this call are observed.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}
