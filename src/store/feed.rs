//! Live feeds over the store: snapshot first, then re-query per change.
//!
//! Feeds are the only path by which consumers observe new content. A
//! lagged broadcast receiver coalesces into one fresh re-query; a closed
//! store ends the feed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::core::errors::ChatResult;
use crate::core::ids::ConversationId;
use crate::core::types::{ChatMessage, Conversation};
use crate::store::{ChatStore, StoreChange};

/// Live view of one conversation's ordered messages.
pub struct MessageFeed {
    store: Arc<dyn ChatStore>,
    conversation_id: ConversationId,
    changes: broadcast::Receiver<StoreChange>,
    primed: bool,
}

impl MessageFeed {
    /// Subscribe to the messages of `conversation_id`.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, conversation_id: ConversationId) -> Self {
        let changes = store.subscribe();
        Self {
            store,
            conversation_id,
            changes,
            primed: false,
        }
    }

    /// Conversation this feed is bound to.
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Next snapshot. The first call yields the current rows; later calls
    /// wait for a relevant change. `None` once the store has closed.
    pub async fn next(&mut self) -> Option<ChatResult<Vec<ChatMessage>>> {
        if !self.primed {
            self.primed = true;
            return Some(self.store.messages_of(&self.conversation_id).await);
        }
        loop {
            match self.changes.recv().await {
                Ok(StoreChange::MessagesChanged(id)) if id == self.conversation_id => {
                    return Some(self.store.messages_of(&self.conversation_id).await);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Message feed lagged by {skipped} changes; re-querying");
                    return Some(self.store.messages_of(&self.conversation_id).await);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Live view of the conversation list, most recently active first.
pub struct ConversationListFeed {
    store: Arc<dyn ChatStore>,
    changes: broadcast::Receiver<StoreChange>,
    primed: bool,
}

impl ConversationListFeed {
    /// Subscribe to the conversation list.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        let changes = store.subscribe();
        Self {
            store,
            changes,
            primed: false,
        }
    }

    /// Next snapshot, same contract as [`MessageFeed::next`].
    pub async fn next(&mut self) -> Option<ChatResult<Vec<Conversation>>> {
        if !self.primed {
            self.primed = true;
            return Some(self.store.conversations().await);
        }
        loop {
            match self.changes.recv().await {
                Ok(StoreChange::ConversationsChanged) => {
                    return Some(self.store.conversations().await);
                }
                Ok(StoreChange::MessagesChanged(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Conversation feed lagged by {skipped} changes; re-querying");
                    return Some(self.store.conversations().await);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
