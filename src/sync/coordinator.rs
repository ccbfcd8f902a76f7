//! Decides how a user-authored message becomes a persisted exchange.
//!
//! The coordinator is the only component that mixes network and storage.
//! The send path persists optimistically, reconciles server-issued ids,
//! and falls back to an offline placeholder, so every send leaves a
//! consistent local record behind whether or not the backend answered.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::core::config::ChatConfig;
use crate::core::errors::{ChatResult, SendFailure};
use crate::core::ids::{ConversationId, MessageId};
use crate::core::types::{ChatMessage, Conversation, MessageRole, Provenance};
use crate::store::{ChatStore, SqliteChatStore};
use crate::sync::api::{
    ChatBackend, HttpChatBackend, RemoteConversation, RemoteMessage, SendMessageReply,
    SendMessageRequest,
};
use crate::transport::{SessionHandle, StreamEvent, StreamSession};

/// Longest derived title before the text is cut and ellipsized.
const TITLE_MAX_CHARS: usize = 40;

/// Result of one send, server-acknowledged or not.
///
/// Both variants carry a valid conversation id and the id the user message
/// was persisted under, so callers can track delivery state per message.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The backend answered and the reply was persisted.
    Delivered {
        /// Conversation the exchange landed in.
        conversation_id: ConversationId,
        /// Id the user message was persisted under.
        user_message_id: MessageId,
        /// The persisted assistant reply.
        reply: ChatMessage,
    },
    /// The backend was unreachable; a placeholder reply was persisted.
    Offline {
        /// Conversation the exchange landed in (minted when unknown).
        conversation_id: ConversationId,
        /// Id the user message was persisted under.
        user_message_id: MessageId,
        /// The persisted offline-placeholder message.
        placeholder: ChatMessage,
        /// Classified reason the send failed.
        failure: SendFailure,
    },
}

impl SendOutcome {
    /// Conversation the exchange landed in; valid in both variants.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Delivered {
                conversation_id, ..
            }
            | Self::Offline {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Id the user message was persisted under.
    #[must_use]
    pub const fn user_message_id(&self) -> &MessageId {
        match self {
            Self::Delivered {
                user_message_id, ..
            }
            | Self::Offline {
                user_message_id, ..
            } => user_message_id,
        }
    }

    /// True when the server acknowledged the exchange.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Single authority for turning user input into synchronized chat state.
///
/// Explicitly constructed from injected dependencies; owns at most one
/// live streaming session at a time.
pub struct SyncCoordinator {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn ChatStore>,
    tokens: Arc<dyn TokenProvider>,
    config: ChatConfig,
    session: Mutex<Option<SessionHandle>>,
}

impl SyncCoordinator {
    /// Assemble a coordinator from already-built dependencies.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn ChatStore>,
        tokens: Arc<dyn TokenProvider>,
        config: ChatConfig,
    ) -> Self {
        Self {
            backend,
            store,
            tokens,
            config,
            session: Mutex::new(None),
        }
    }

    /// Assemble the production set: HTTP backend plus `SQLite` store.
    ///
    /// Returns the store alongside the coordinator so callers can attach
    /// live feeds to the same database.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the database
    /// cannot be opened, or the HTTP client cannot be built.
    pub async fn with_sqlite(
        config: ChatConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> ChatResult<(Self, Arc<SqliteChatStore>)> {
        config.validate()?;
        let store = Arc::new(SqliteChatStore::open(&config.storage).await?);
        let backend = Arc::new(HttpChatBackend::new(&config.api, Arc::clone(&tokens))?);
        let coordinator = Self::new(backend, Arc::clone(&store) as Arc<dyn ChatStore>, tokens, config);
        Ok((coordinator, store))
    }

    /// Send `text`, persisting both sides of the exchange.
    ///
    /// With a known conversation the user message is written before the
    /// network call. Without one the id is taken from the server's answer,
    /// or minted locally when the send fails, so the caller always gets a
    /// conversation it can keep chatting in. `user_message_id` lets the
    /// caller pre-mint the id it tracks delivery under.
    ///
    /// # Errors
    /// Returns an error only for storage failures; network failures are
    /// data, reported through [`SendOutcome::Offline`].
    pub async fn send_message(
        &self,
        text: &str,
        conversation_id: Option<&ConversationId>,
        user_message_id: Option<MessageId>,
    ) -> ChatResult<SendOutcome> {
        let user_message_id = user_message_id.unwrap_or_default();
        let mut user_persisted = false;

        if let Some(id) = conversation_id {
            self.ensure_conversation_exists(id, text).await?;
            let user = ChatMessage::user(user_message_id.clone(), id.clone(), text);
            self.store.upsert_message(user).await?;
            user_persisted = true;
        }

        let request = SendMessageRequest {
            message: text.to_string(),
            conversation_id: conversation_id.map(|id| id.as_str().to_string()),
            stream: self.config.stream.request_streaming,
        };

        match self.backend.send_message(request).await {
            Ok(reply) => {
                self.record_delivery(text, conversation_id, user_message_id, user_persisted, &reply)
                    .await
            }
            Err(failure) => {
                self.record_offline(text, conversation_id, user_message_id, user_persisted, failure)
                    .await
            }
        }
    }

    async fn record_delivery(
        &self,
        text: &str,
        requested: Option<&ConversationId>,
        user_message_id: MessageId,
        user_persisted: bool,
        reply: &SendMessageReply,
    ) -> ChatResult<SendOutcome> {
        // Server-issued ids win; the caller's id and a fresh mint are
        // fallbacks for backends that omit them.
        let conversation_id = reply
            .conversation_id()
            .map(ConversationId::from_raw)
            .or_else(|| requested.cloned())
            .unwrap_or_default();

        self.ensure_conversation_exists(&conversation_id, text).await?;

        if !user_persisted {
            let user = ChatMessage::user(user_message_id.clone(), conversation_id.clone(), text);
            self.store.upsert_message(user).await?;
        }

        let reply_id = reply
            .message_id()
            .map_or_else(MessageId::generate, MessageId::from_raw);
        let created_at = parse_server_timestamp(reply.created_at());
        #[allow(clippy::cast_possible_truncation)]
        let confidence = reply.confidence().map(|value| value as f32);
        let provenance = Provenance {
            agent_name: reply.agent_name().map(str::to_string),
            provider: reply.provider().map(str::to_string),
            provider_color: reply.provider_color().map(str::to_string),
            model_used: reply.model_used().map(str::to_string),
            confidence,
        };
        let assistant = ChatMessage::assistant(
            reply_id,
            conversation_id.clone(),
            reply.content(),
            provenance,
            created_at,
        );
        self.store.upsert_message(assistant.clone()).await?;
        self.store.touch_updated_at(&conversation_id, created_at).await?;

        info!("Delivered message to conversation {conversation_id}");
        Ok(SendOutcome::Delivered {
            conversation_id,
            user_message_id,
            reply: assistant,
        })
    }

    async fn record_offline(
        &self,
        text: &str,
        requested: Option<&ConversationId>,
        user_message_id: MessageId,
        user_persisted: bool,
        failure: SendFailure,
    ) -> ChatResult<SendOutcome> {
        warn!(
            kind = failure.kind.as_str(),
            "Send failed, persisting offline placeholder: {}", failure.detail
        );

        let conversation_id = requested.cloned().unwrap_or_default();
        self.ensure_conversation_exists(&conversation_id, text).await?;

        if !user_persisted {
            let user = ChatMessage::user(user_message_id.clone(), conversation_id.clone(), text);
            self.store.upsert_message(user).await?;
        }

        let now = Utc::now();
        let placeholder = ChatMessage::assistant(
            MessageId::generate(),
            conversation_id.clone(),
            failure.offline_notice(),
            Provenance::offline(),
            now,
        );
        self.store.upsert_message(placeholder.clone()).await?;
        self.store.touch_updated_at(&conversation_id, now).await?;

        Ok(SendOutcome::Offline {
            conversation_id,
            user_message_id,
            placeholder,
            failure,
        })
    }

    /// Pull the authoritative message list of a conversation into the
    /// store. Last writer wins per message id; one transaction.
    ///
    /// # Errors
    /// Returns an error if the backend call or a storage write fails.
    pub async fn sync_conversation_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ChatResult<Vec<ChatMessage>> {
        let remote = self.backend.messages(conversation_id).await?;
        let messages: Vec<ChatMessage> = remote
            .iter()
            .map(|message| message_from_remote(conversation_id, message))
            .collect();

        // The FK requires the conversation row before its messages.
        self.ensure_conversation_exists(conversation_id, "").await?;
        self.store.upsert_messages(messages.clone()).await?;
        // Freshness moves to now, never backward: the remote list may lag
        // local-only activity the server has not seen yet.
        self.store
            .touch_updated_at(conversation_id, Utc::now())
            .await?;

        debug!(
            "Synced {} messages into conversation {conversation_id}",
            messages.len()
        );
        Ok(messages)
    }

    /// Create a conversation, preferring the server but never failing the
    /// user: network trouble falls back to a locally minted record.
    ///
    /// # Errors
    /// Returns an error only when the local write fails.
    pub async fn create_conversation(&self, title: Option<String>) -> ChatResult<Conversation> {
        match self.backend.create_conversation(title.clone()).await {
            Ok(remote) => {
                let conversation = conversation_from_remote(&remote);
                self.store.upsert_conversation(conversation.clone()).await?;
                info!("Created conversation {} on the server", conversation.id);
                Ok(conversation)
            }
            Err(failure) => {
                warn!(
                    kind = failure.kind.as_str(),
                    "Server-side create failed, minting a local conversation: {}", failure.detail
                );
                self.create_local_conversation(title).await
            }
        }
    }

    /// Create a conversation with a locally minted id.
    ///
    /// # Errors
    /// Returns an error when the local write fails.
    pub async fn create_local_conversation(
        &self,
        title: Option<String>,
    ) -> ChatResult<Conversation> {
        let conversation = Conversation::new(
            ConversationId::generate(),
            Conversation::title_or_default(title.as_deref()),
        );
        self.store.upsert_conversation(conversation.clone()).await?;
        Ok(conversation)
    }

    /// Delete a conversation. The remote delete is best-effort; the local
    /// cascade delete always runs, since local state drives the display.
    ///
    /// # Errors
    /// Returns an error when the local delete fails.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> ChatResult<()> {
        match self.backend.delete_conversation(conversation_id).await {
            Ok(status) => debug!(
                "Server delete of conversation {conversation_id} returned {}",
                status.status
            ),
            Err(failure) => warn!(
                kind = failure.kind.as_str(),
                "Server delete of conversation {conversation_id} failed: {}", failure.detail
            ),
        }
        self.store.delete_conversation(conversation_id).await
    }

    /// Delete one message locally, then best-effort on the server.
    ///
    /// # Errors
    /// Returns an error when the local delete fails.
    pub async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> ChatResult<()> {
        self.store.delete_message(message_id).await?;
        if let Err(failure) = self.backend.delete_message(conversation_id, message_id).await {
            warn!(
                kind = failure.kind.as_str(),
                "Server delete of message {message_id} failed: {}", failure.detail
            );
        }
        Ok(())
    }

    /// Reconcile the local conversation list against the server: prune
    /// local conversations the server dropped, upsert the returned ones.
    ///
    /// # Errors
    /// Returns an error when the backend call fails; the last-known local
    /// list is retained untouched in that case.
    pub async fn refresh_conversations(&self) -> ChatResult<Vec<Conversation>> {
        let page = self
            .backend
            .list_conversations(1, self.config.api.page_size)
            .await?;
        let remote: Vec<Conversation> = page.items.iter().map(conversation_from_remote).collect();
        let keep: HashSet<&str> = remote.iter().map(|c| c.id.as_str()).collect();

        for stale in self.store.conversations().await? {
            if !keep.contains(stale.id.as_str()) {
                debug!("Pruning conversation {} absent from the server", stale.id);
                self.store.delete_conversation(&stale.id).await?;
            }
        }
        for conversation in remote {
            self.store.upsert_conversation(conversation).await?;
        }
        self.store.conversations().await
    }

    /// Ask the server for a better title and adopt it locally.
    ///
    /// # Errors
    /// Returns an error when the backend call or the local update fails.
    pub async fn regenerate_title(&self, conversation_id: &ConversationId) -> ChatResult<String> {
        let reply = self.backend.regenerate_title(conversation_id).await?;
        self.store
            .update_title(conversation_id, &reply.title, Utc::now())
            .await?;
        info!("Regenerated title for {conversation_id}: {}", reply.title);
        Ok(reply.title)
    }

    /// Wipe every locally persisted conversation and message.
    ///
    /// # Errors
    /// Returns an error when the storage wipe fails.
    pub async fn clear_all_local_data(&self) -> ChatResult<()> {
        self.store.clear_all().await
    }

    /// Open the streaming session for `identity`, superseding any prior
    /// session. Connection state and frames arrive on the returned
    /// receiver.
    pub async fn connect(&self, identity: &str) -> mpsc::Receiver<StreamEvent> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            debug!("Superseding the previous streaming session");
            previous.close();
        }
        let (handle, events) =
            StreamSession::open(&self.config.stream, identity, Arc::clone(&self.tokens)).await;
        *slot = Some(handle);
        events
    }

    /// Close the streaming session, if one is open.
    pub async fn disconnect(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.close();
            info!("Streaming session closed");
        }
    }

    /// Forward a typing signal over the stream; a no-op without a session.
    pub async fn typing(&self, active: bool) {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) if active => session.send_typing_start(),
            Some(session) => session.send_typing_stop(),
            None => debug!("Typing signal dropped, no streaming session"),
        }
    }

    /// Send a keepalive ping over the stream; a no-op without a session.
    pub async fn ping(&self) {
        let slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            session.send_ping();
        } else {
            debug!("Ping dropped, no streaming session");
        }
    }

    /// Push a chat message over the stream instead of HTTP; a no-op
    /// without a session.
    pub async fn send_via_stream(&self, text: &str, conversation_id: Option<&ConversationId>) {
        let slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            session.send_chat_message(
                text,
                conversation_id.map(ConversationId::as_str),
                self.config.stream.request_streaming,
            );
        } else {
            debug!("Stream send dropped, no streaming session");
        }
    }

    async fn ensure_conversation_exists(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> ChatResult<()> {
        if self.store.conversation(conversation_id).await?.is_none() {
            let conversation = Conversation::new(conversation_id.clone(), suggest_title(text));
            self.store.upsert_conversation(conversation).await?;
        }
        Ok(())
    }
}

/// Derive a display title from the first line-ish of the text.
fn suggest_title(text: &str) -> String {
    let flattened = text.trim().replace('\n', " ");
    if flattened.is_empty() {
        return Conversation::DEFAULT_TITLE.to_string();
    }
    if flattened.chars().count() <= TITLE_MAX_CHARS {
        flattened
    } else {
        let head: String = flattened.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    }
}

fn parse_optional_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

/// Wire timestamps are epoch-milliseconds strings; anything unparsable
/// degrades to the current instant rather than failing the sync.
fn parse_server_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(parse_optional_timestamp)
        .unwrap_or_else(Utc::now)
}

fn conversation_from_remote(remote: &RemoteConversation) -> Conversation {
    Conversation {
        id: ConversationId::from_raw(remote.id.clone()),
        title: Conversation::title_or_default(Some(&remote.title)),
        created_at: parse_server_timestamp(remote.created_at.as_deref()),
        updated_at: parse_server_timestamp(remote.updated_at.as_deref()),
        last_message_at: remote
            .last_message_at
            .as_deref()
            .and_then(parse_optional_timestamp),
        is_archived: remote.is_archived,
        is_pinned: remote.is_pinned,
        summary: remote.summary.clone(),
        message_count: remote.message_count,
    }
}

fn message_from_remote(conversation_id: &ConversationId, remote: &RemoteMessage) -> ChatMessage {
    ChatMessage {
        id: MessageId::from_raw(remote.id.clone()),
        conversation_id: conversation_id.clone(),
        role: MessageRole::from_wire(&remote.role),
        content: remote.content.clone(),
        provenance: Provenance {
            agent_name: remote.agent_name.clone(),
            provider: remote.provider.clone(),
            provider_color: remote.provider_color.clone(),
            model_used: remote.model_used.clone(),
            confidence: None,
        },
        created_at: parse_server_timestamp(remote.created_at.as_deref()),
    }
}
