//! The state machine behind the active conversation.
//!
//! One controller per process. It composes the coordinator (network and
//! persistence policy), the store feed (live message list), and the
//! streaming events into [`ConversationView`] snapshots on a `watch`
//! channel. Sends run on detached tasks, so an in-flight send survives
//! teardown of whatever triggered it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conversation::{ConversationView, SendStatus, StreamingEnvelope};
use crate::core::errors::{ChatError, ChatResult};
use crate::core::ids::{ConversationId, MessageId};
use crate::core::types::MessageRole;
use crate::store::{ChatStore, MessageFeed};
use crate::sync::{SendOutcome, SyncCoordinator};
use crate::transport::StreamEvent;

/// Lock `mutex`, recovering the guard if a panicking holder poisoned it.
/// These guards protect plain data, so the value stays usable.
fn lock_or_recover<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a streaming event touches the trailing assistant message.
enum Fold {
    /// Overwrite with server-cumulative content.
    Replace(String),
    /// Append a legacy inline chunk.
    Append(String),
}

struct ControllerInner {
    coordinator: Arc<SyncCoordinator>,
    store: Arc<dyn ChatStore>,
    view: watch::Sender<ConversationView>,
    statuses: DashMap<MessageId, SendStatus>,
    active: StdMutex<Option<ConversationId>>,
    feed_task: StdMutex<Option<JoinHandle<()>>>,
    stream_task: StdMutex<Option<JoinHandle<()>>>,
}

/// Drives the active conversation and publishes renderable snapshots.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ConversationController {
    inner: Arc<ControllerInner>,
}

impl ConversationController {
    /// Build a controller over an assembled coordinator and store.
    #[must_use]
    pub fn new(coordinator: Arc<SyncCoordinator>, store: Arc<dyn ChatStore>) -> Self {
        let (view, _) = watch::channel(ConversationView::default());
        Self {
            inner: Arc::new(ControllerInner {
                coordinator,
                store,
                view,
                statuses: DashMap::new(),
                active: StdMutex::new(None),
                feed_task: StdMutex::new(None),
                stream_task: StdMutex::new(None),
            }),
        }
    }

    /// Snapshot channel consumers render from.
    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<ConversationView> {
        self.inner.view.subscribe()
    }

    /// Submit user text on a detached task. Blank input is ignored.
    ///
    /// Returns the minted message id the send is tracked under, so the
    /// caller can correlate later status changes.
    pub fn send(&self, text: &str) -> Option<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring blank send");
            return None;
        }

        let message_id = MessageId::generate();
        self.inner
            .statuses
            .insert(message_id.clone(), SendStatus::Sending);
        self.inner.publish_statuses();

        let inner = Arc::clone(&self.inner);
        let task_text = text.to_string();
        let task_id = message_id.clone();
        tokio::spawn(async move {
            inner.run_send(task_text, task_id).await;
        });
        Some(message_id)
    }

    /// Re-submit a failed message as a brand-new send.
    ///
    /// The failed user row is removed from the store (the live view drops
    /// it); the offline placeholder stays behind as the durable record of
    /// what happened.
    pub async fn retry(&self, message_id: &MessageId) {
        let failed = self
            .inner
            .statuses
            .get(message_id)
            .is_some_and(|status| *status == SendStatus::Failed);
        if !failed {
            debug!("Retry ignored for {message_id}: not in the failed state");
            return;
        }

        let text = {
            let view = self.inner.view.borrow();
            view.messages
                .iter()
                .find(|message| &message.id == message_id)
                .map(|message| message.content.clone())
        };
        let Some(text) = text else {
            warn!("Retry ignored for {message_id}: message no longer in view");
            return;
        };

        if let Err(err) = self.inner.store.delete_message(message_id).await {
            warn!("Could not drop the failed message {message_id}: {err}");
            return;
        }
        self.inner.statuses.remove(message_id);
        self.inner.publish_statuses();

        self.send(&text);
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// Clears ephemeral state, re-subscribes the live feed, and reconciles
    /// against the server in the background. Selecting the already active
    /// conversation is a no-op.
    pub async fn select_conversation(&self, conversation_id: &ConversationId) {
        {
            let mut active = lock_or_recover(&self.inner.active);
            if active.as_ref() == Some(conversation_id) {
                debug!("Conversation {conversation_id} already selected");
                return;
            }
            *active = Some(conversation_id.clone());
        }

        self.inner.statuses.clear();
        let selected = conversation_id.clone();
        self.inner.view.send_modify(move |view| {
            view.conversation = Some(selected);
            view.messages.clear();
            view.statuses.clear();
            view.streaming = None;
            view.typing = false;
            view.banner = None;
        });
        self.inner.start_feed(conversation_id.clone());

        let inner = Arc::clone(&self.inner);
        let id = conversation_id.clone();
        tokio::spawn(async move {
            match inner.coordinator.sync_conversation_messages(&id).await {
                Ok(_) => {}
                Err(ChatError::Backend(failure)) if failure.is_not_found() => {
                    warn!("Conversation {id} is gone on the server; dropping it");
                    inner.drop_missing_conversation(&id).await;
                }
                Err(err) => warn!("Background sync of conversation {id} failed: {err}"),
            }
        });
    }

    /// Clear the view for a fresh draft. The conversation itself is
    /// created lazily by the first send.
    pub fn new_conversation(&self) {
        *lock_or_recover(&self.inner.active) = None;
        if let Some(task) = lock_or_recover(&self.inner.feed_task).take() {
            task.abort();
        }
        self.inner.statuses.clear();
        self.inner.view.send_modify(|view| {
            view.conversation = None;
            view.messages.clear();
            view.statuses.clear();
            view.streaming = None;
            view.typing = false;
            view.banner = None;
        });
        info!("Started a new draft conversation");
    }

    /// Delete a conversation everywhere, clearing the view when it was
    /// the active one.
    ///
    /// # Errors
    /// Returns an error when the local delete fails.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> ChatResult<()> {
        self.inner.coordinator.delete_conversation(conversation_id).await?;
        let was_active =
            lock_or_recover(&self.inner.active).as_ref() == Some(conversation_id);
        if was_active {
            self.new_conversation();
        }
        Ok(())
    }

    /// Delete one message of the active conversation, local then remote.
    ///
    /// # Errors
    /// Returns an error when the local delete fails.
    pub async fn delete_message(&self, message_id: &MessageId) -> ChatResult<()> {
        let active = lock_or_recover(&self.inner.active).clone();
        let Some(conversation_id) = active else {
            debug!("No active conversation; ignoring message delete");
            return Ok(());
        };
        self.inner.statuses.remove(message_id);
        self.inner.publish_statuses();
        self.inner
            .coordinator
            .delete_message(&conversation_id, message_id)
            .await
    }

    /// Forward a typing signal over the stream, best-effort.
    pub async fn notify_typing(&self, active: bool) {
        self.inner.coordinator.typing(active).await;
    }

    /// Fold one streaming event into the view and, where the event carries
    /// reply content, into the store.
    pub async fn apply_stream_event(&self, event: StreamEvent) {
        self.inner.apply_stream_event(event).await;
    }

    /// Open the streaming session for `identity` and consume its events.
    /// Re-attaching supersedes the prior consumer task.
    pub async fn attach_stream(&self, identity: &str) {
        let mut events = self.inner.coordinator.connect(identity).await;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                inner.apply_stream_event(event).await;
            }
            debug!("Streaming event channel closed");
        });
        if let Some(previous) = lock_or_recover(&self.inner.stream_task).replace(task) {
            previous.abort();
        }
    }

    /// Stop feed and stream consumers and close the session. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        if let Some(task) = lock_or_recover(&self.inner.feed_task).take() {
            task.abort();
        }
        if let Some(task) = lock_or_recover(&self.inner.stream_task).take() {
            task.abort();
        }
        self.inner.coordinator.disconnect().await;
        info!("Conversation controller shut down");
    }
}

impl ControllerInner {
    fn publish_statuses(&self) {
        let snapshot: HashMap<MessageId, SendStatus> = self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        self.view.send_modify(|view| view.statuses = snapshot);
    }

    async fn run_send(self: Arc<Self>, text: String, message_id: MessageId) {
        let active = lock_or_recover(&self.active).clone();
        match self
            .coordinator
            .send_message(&text, active.as_ref(), Some(message_id.clone()))
            .await
        {
            Ok(outcome) => {
                let status = if outcome.is_delivered() {
                    SendStatus::Sent
                } else {
                    SendStatus::Failed
                };
                self.statuses.insert(message_id, status);
                self.publish_statuses();
                if let SendOutcome::Offline { failure, .. } = &outcome {
                    let banner = failure.user_message();
                    self.view.send_modify(move |view| view.banner = Some(banner));
                }
                // First send of a draft: adopt the conversation the
                // coordinator resolved, keeping in-flight statuses.
                if active.is_none() {
                    self.adopt_conversation(outcome.conversation_id().clone());
                }
            }
            Err(err) => {
                error!("Send could not be persisted: {err}");
                self.statuses.insert(message_id, SendStatus::Failed);
                self.publish_statuses();
                self.view.send_modify(|view| {
                    view.banner = Some("Failed to save the message".to_string());
                });
            }
        }
    }

    fn adopt_conversation(self: &Arc<Self>, conversation_id: ConversationId) {
        {
            let mut active = lock_or_recover(&self.active);
            if active.as_ref() == Some(&conversation_id) {
                return;
            }
            *active = Some(conversation_id.clone());
        }
        let selected = conversation_id.clone();
        self.view
            .send_modify(move |view| view.conversation = Some(selected));
        self.start_feed(conversation_id);
    }

    fn start_feed(self: &Arc<Self>, conversation_id: ConversationId) {
        if let Some(previous) = lock_or_recover(&self.feed_task).take() {
            previous.abort();
        }
        // Subscribing before the spawn means no store change can slip
        // between the snapshot and the follow loop.
        let mut feed = MessageFeed::new(Arc::clone(&self.store), conversation_id);
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(result) = feed.next().await {
                match result {
                    Ok(messages) => inner.view.send_modify(move |view| view.messages = messages),
                    Err(err) => warn!("Message feed query failed: {err}"),
                }
            }
            debug!("Message feed ended");
        });
        *lock_or_recover(&self.feed_task) = Some(task);
    }

    async fn drop_missing_conversation(&self, conversation_id: &ConversationId) {
        // The server already forgot it; only the local row needs to go.
        if let Err(err) = self.store.delete_conversation(conversation_id).await {
            warn!("Failed to drop missing conversation {conversation_id}: {err}");
        }
        let was_active = {
            let mut active = lock_or_recover(&self.active);
            if active.as_ref() == Some(conversation_id) {
                *active = None;
                true
            } else {
                false
            }
        };
        if was_active {
            if let Some(task) = lock_or_recover(&self.feed_task).take() {
                task.abort();
            }
            self.view.send_modify(|view| {
                view.conversation = None;
                view.messages.clear();
                view.streaming = None;
                view.banner = Some("Conversation not found".to_string());
            });
        }
    }

    async fn apply_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Connected => {
                info!("Streaming transport connected");
                self.view.send_modify(|view| {
                    view.connected = true;
                    view.banner = None;
                });
            }
            StreamEvent::Disconnected => {
                info!("Streaming transport disconnected");
                self.view.send_modify(|view| {
                    view.connected = false;
                    view.typing = false;
                    view.streaming = None;
                });
            }
            StreamEvent::AiTyping(typing) => {
                self.view.send_modify(|view| view.typing = typing);
            }
            StreamEvent::StreamStart(stream_id) => {
                debug!("Assistant stream {stream_id} started");
                self.view.send_modify(move |view| {
                    view.streaming = Some(StreamingEnvelope {
                        stream_id,
                        content: String::new(),
                        progress: 0.0,
                    });
                });
            }
            StreamEvent::StreamChunk {
                chunk: _,
                full_content,
                progress,
            } => {
                let cumulative = full_content.clone();
                self.view.send_modify(move |view| {
                    if let Some(envelope) = view.streaming.as_mut() {
                        envelope.content = cumulative;
                        envelope.progress = progress;
                    }
                });
                self.fold_into_trailing_assistant(Fold::Replace(full_content))
                    .await;
            }
            StreamEvent::StreamEnd(full_content) => {
                debug!("Assistant stream ended");
                self.fold_into_trailing_assistant(Fold::Replace(full_content))
                    .await;
                self.view.send_modify(|view| {
                    view.streaming = None;
                    view.typing = false;
                });
            }
            StreamEvent::Message(envelope) => {
                if !envelope.chunk.is_empty() {
                    self.fold_into_trailing_assistant(Fold::Append(envelope.chunk))
                        .await;
                }
            }
            StreamEvent::EmotionUpdate(signal) => {
                self.view.send_modify(move |view| view.emotion = Some(signal));
            }
            StreamEvent::Notification(payload) => {
                debug!("Notification frame: {payload}");
            }
            StreamEvent::Error(message) => {
                warn!("Streaming error: {message}");
                self.view.send_modify(move |view| view.banner = Some(message));
            }
        }
    }

    /// Write streamed content through to the trailing assistant message.
    ///
    /// Persisted content is never altered unless the most recent message
    /// in the live view is an assistant message.
    async fn fold_into_trailing_assistant(&self, fold: Fold) {
        let trailing = {
            let view = self.view.borrow();
            view.messages
                .last()
                .filter(|message| message.role == MessageRole::Assistant)
                .cloned()
        };
        let Some(message) = trailing else {
            return;
        };

        let updated = match fold {
            Fold::Replace(content) => {
                if message.content == content {
                    return;
                }
                message.with_content(content)
            }
            Fold::Append(chunk) => {
                let mut content = message.content.clone();
                content.push_str(&chunk);
                message.with_content(content)
            }
        };
        if let Err(err) = self.store.upsert_message(updated).await {
            warn!("Streaming fold failed to persist: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::core::config::ChatConfig;
    use crate::core::errors::SendFailure;
    use crate::core::ids::StreamId;
    use crate::core::types::{ChatMessage, Conversation, Provenance, datetime_from_millis};
    use crate::store::SqliteChatStore;
    use crate::sync::api::{
        ApiFuture, ChatBackend, ConversationPage, DeleteStatus, MessageBody, RemoteConversation,
        RemoteMessage, SendMessageReply, SendMessageRequest, TitleReply,
    };
    use crate::transport::FrameDecoder;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Default)]
    struct StubBackend {
        send_results: StdMutex<VecDeque<Result<SendMessageReply, SendFailure>>>,
        message_lists: StdMutex<VecDeque<Result<Vec<RemoteMessage>, SendFailure>>>,
    }

    fn pop<T>(queue: &StdMutex<VecDeque<Result<T, SendFailure>>>) -> Result<T, SendFailure> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SendFailure::unexpected("not scripted")))
    }

    impl ChatBackend for StubBackend {
        fn send_message(
            &self,
            _request: SendMessageRequest,
        ) -> ApiFuture<'_, Result<SendMessageReply, SendFailure>> {
            let result = pop(&self.send_results);
            Box::pin(async move { result })
        }

        fn list_conversations(
            &self,
            _page: u32,
            _size: u32,
        ) -> ApiFuture<'_, Result<ConversationPage, SendFailure>> {
            Box::pin(async move { Err(SendFailure::unexpected("not scripted")) })
        }

        fn create_conversation(
            &self,
            _title: Option<String>,
        ) -> ApiFuture<'_, Result<RemoteConversation, SendFailure>> {
            Box::pin(async move { Err(SendFailure::unexpected("not scripted")) })
        }

        fn messages(
            &self,
            _conversation_id: &ConversationId,
        ) -> ApiFuture<'_, Result<Vec<RemoteMessage>, SendFailure>> {
            let result = pop(&self.message_lists);
            Box::pin(async move { result })
        }

        fn delete_conversation(
            &self,
            _conversation_id: &ConversationId,
        ) -> ApiFuture<'_, Result<DeleteStatus, SendFailure>> {
            Box::pin(async move {
                Ok(DeleteStatus {
                    status: "ok".to_string(),
                })
            })
        }

        fn delete_message(
            &self,
            _conversation_id: &ConversationId,
            _message_id: &MessageId,
        ) -> ApiFuture<'_, Result<DeleteStatus, SendFailure>> {
            Box::pin(async move {
                Ok(DeleteStatus {
                    status: "ok".to_string(),
                })
            })
        }

        fn regenerate_title(
            &self,
            _conversation_id: &ConversationId,
        ) -> ApiFuture<'_, Result<TitleReply, SendFailure>> {
            Box::pin(async move { Err(SendFailure::unexpected("not scripted")) })
        }
    }

    async fn harness(
        backend: Arc<StubBackend>,
    ) -> ChatResult<(ConversationController, Arc<SqliteChatStore>)> {
        let store = Arc::new(SqliteChatStore::open_in_memory().await?);
        let coordinator = Arc::new(SyncCoordinator::new(
            backend,
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Arc::new(StaticTokenProvider::new("tok")),
            ChatConfig::default(),
        ));
        let controller = ConversationController::new(coordinator, Arc::clone(&store) as Arc<dyn ChatStore>);
        Ok((controller, store))
    }

    async fn wait_until<F>(rx: &mut watch::Receiver<ConversationView>, predicate: F)
    where
        F: FnMut(&ConversationView) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for a view update")
            .expect("view channel closed");
    }

    fn seeded_message(
        id: &str,
        conversation: &ConversationId,
        role: MessageRole,
        content: &str,
        at_millis: i64,
    ) -> ChatMessage {
        ChatMessage {
            id: MessageId::from_raw(id),
            conversation_id: conversation.clone(),
            role,
            content: content.to_string(),
            provenance: Provenance::default(),
            created_at: datetime_from_millis(at_millis),
        }
    }

    async fn seed_exchange(
        store: &SqliteChatStore,
        conversation: &ConversationId,
        assistant_content: &str,
    ) -> ChatResult<()> {
        store
            .upsert_conversation(Conversation::new(conversation.clone(), "Seeded"))
            .await?;
        store
            .upsert_message(seeded_message(
                "m-user",
                conversation,
                MessageRole::User,
                "Question",
                1_000,
            ))
            .await?;
        store
            .upsert_message(seeded_message(
                "m-assistant",
                conversation,
                MessageRole::Assistant,
                assistant_content,
                2_000,
            ))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_streaming_chunks_fold_into_the_trailing_assistant_message() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        backend.message_lists.lock().unwrap().push_back(Ok(Vec::new()));
        let (controller, store) = harness(backend).await?;
        let conversation = ConversationId::from_raw("c1");
        seed_exchange(&store, &conversation, "").await?;

        let mut view = controller.watch_view();
        controller.select_conversation(&conversation).await;
        wait_until(&mut view, |v| v.messages.len() == 2).await;

        controller
            .apply_stream_event(StreamEvent::StreamStart(StreamId::from_raw("s1")))
            .await;
        controller
            .apply_stream_event(StreamEvent::StreamChunk {
                chunk: "Hel".to_string(),
                full_content: "Hel".to_string(),
                progress: 0.4,
            })
            .await;
        wait_until(&mut view, |v| {
            v.messages.last().is_some_and(|m| m.content == "Hel")
        })
        .await;
        {
            let snapshot = view.borrow();
            let envelope = snapshot.streaming.as_ref().unwrap();
            assert_eq!(envelope.content, "Hel");
            assert!((envelope.progress - 0.4).abs() < f64::EPSILON);
        }

        controller
            .apply_stream_event(StreamEvent::StreamChunk {
                chunk: "lo".to_string(),
                full_content: "Hello".to_string(),
                progress: 0.8,
            })
            .await;
        controller
            .apply_stream_event(StreamEvent::StreamEnd("Hello!".to_string()))
            .await;
        wait_until(&mut view, |v| {
            v.messages.last().is_some_and(|m| m.content == "Hello!") && v.streaming.is_none()
        })
        .await;

        let persisted = store.messages_of(&conversation).await?;
        assert_eq!(persisted.last().unwrap().content, "Hello!");
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_legacy_message_frames_append_to_the_trailing_assistant() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        backend.message_lists.lock().unwrap().push_back(Ok(Vec::new()));
        let (controller, store) = harness(backend).await?;
        let conversation = ConversationId::from_raw("c1");
        seed_exchange(&store, &conversation, "Hel").await?;

        let mut view = controller.watch_view();
        controller.select_conversation(&conversation).await;
        wait_until(&mut view, |v| v.messages.len() == 2).await;

        let event = FrameDecoder::new()
            .decode(r#"{"type":"message","chunk":"lo"}"#)
            .unwrap();
        controller.apply_stream_event(event).await;
        wait_until(&mut view, |v| {
            v.messages.last().is_some_and(|m| m.content == "Hello")
        })
        .await;

        let persisted = store.messages_of(&conversation).await?;
        assert_eq!(persisted.last().unwrap().content, "Hello");
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_trailing_user_message_is_never_touched() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        backend.message_lists.lock().unwrap().push_back(Ok(Vec::new()));
        let (controller, store) = harness(backend).await?;
        let conversation = ConversationId::from_raw("c1");
        store
            .upsert_conversation(Conversation::new(conversation.clone(), "Seeded"))
            .await?;
        store
            .upsert_message(seeded_message(
                "m-user",
                &conversation,
                MessageRole::User,
                "Question",
                1_000,
            ))
            .await?;

        let mut view = controller.watch_view();
        controller.select_conversation(&conversation).await;
        wait_until(&mut view, |v| v.messages.len() == 1).await;

        controller
            .apply_stream_event(StreamEvent::StreamStart(StreamId::from_raw("s1")))
            .await;
        controller
            .apply_stream_event(StreamEvent::StreamChunk {
                chunk: "sneaky".to_string(),
                full_content: "sneaky".to_string(),
                progress: 0.5,
            })
            .await;

        // The envelope tracks the stream, the persisted row does not.
        assert_eq!(
            view.borrow().streaming.as_ref().unwrap().content,
            "sneaky"
        );
        let persisted = store.messages_of(&conversation).await?;
        assert_eq!(persisted.last().unwrap().content, "Question");
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_sending_without_a_selection_adopts_the_new_conversation() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        backend.send_results.lock().unwrap().push_back(Ok(SendMessageReply {
            message: Some(MessageBody {
                id: Some("m-reply".to_string()),
                conversation_id: Some("c77".to_string()),
                content: Some("Hi!".to_string()),
                created_at: Some("4100000000000".to_string()),
                ..MessageBody::default()
            }),
            ..SendMessageReply::default()
        }));
        let (controller, _store) = harness(backend).await?;

        let mut view = controller.watch_view();
        let message_id = controller.send("Hello").unwrap();
        wait_until(&mut view, |v| {
            v.conversation.as_ref().is_some_and(|c| c.as_str() == "c77")
                && v.messages.len() == 2
                && v.statuses.get(&message_id) == Some(&SendStatus::Sent)
        })
        .await;
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_replaces_the_failed_message_with_a_fresh_send() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        {
            let mut script = backend.send_results.lock().unwrap();
            script.push_back(Err(SendFailure::connection_refused("down")));
            script.push_back(Ok(SendMessageReply {
                message: Some(MessageBody {
                    content: Some("Recovered".to_string()),
                    created_at: Some("4100000000000".to_string()),
                    ..MessageBody::default()
                }),
                ..SendMessageReply::default()
            }));
        }
        let (controller, _store) = harness(backend).await?;

        let mut view = controller.watch_view();
        let failed_id = controller.send("Hello?").unwrap();
        wait_until(&mut view, |v| {
            v.statuses.get(&failed_id) == Some(&SendStatus::Failed) && v.messages.len() == 2
        })
        .await;

        controller.retry(&failed_id).await;
        wait_until(&mut view, |v| {
            v.messages.len() == 3
                && !v.statuses.contains_key(&failed_id)
                && v.statuses.values().any(|s| *s == SendStatus::Sent)
        })
        .await;

        let snapshot = view.borrow();
        assert!(snapshot.messages.iter().any(|m| m.content == "Recovered"));
        // The offline placeholder survives the retry.
        assert!(snapshot.messages.iter().any(|m| m.content.starts_with("⚠️")));
        drop(snapshot);
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_selecting_a_conversation_clears_ephemeral_state() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        backend.message_lists.lock().unwrap().push_back(Ok(Vec::new()));
        let (controller, store) = harness(backend).await?;
        let conversation = ConversationId::from_raw("c2");
        seed_exchange(&store, &conversation, "answer").await?;

        controller
            .apply_stream_event(StreamEvent::AiTyping(true))
            .await;
        controller
            .apply_stream_event(StreamEvent::Error("boom".to_string()))
            .await;

        let mut view = controller.watch_view();
        controller.select_conversation(&conversation).await;
        wait_until(&mut view, |v| v.messages.len() == 2).await;

        let snapshot = view.borrow();
        assert_eq!(snapshot.conversation, Some(conversation.clone()));
        assert!(!snapshot.typing);
        assert!(snapshot.banner.is_none());
        assert!(snapshot.statuses.is_empty());
        drop(snapshot);
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_selecting_a_vanished_conversation_drops_it_locally() -> ChatResult<()> {
        let backend = Arc::new(StubBackend::default());
        backend
            .message_lists
            .lock()
            .unwrap()
            .push_back(Err(SendFailure::not_found("404")));
        let (controller, store) = harness(backend).await?;
        let conversation = ConversationId::from_raw("c-stale");
        store
            .upsert_conversation(Conversation::new(conversation.clone(), "Stale"))
            .await?;

        let mut view = controller.watch_view();
        controller.select_conversation(&conversation).await;
        wait_until(&mut view, |v| {
            v.banner.as_deref() == Some("Conversation not found") && v.conversation.is_none()
        })
        .await;

        assert!(store.conversation(&conversation).await?.is_none());
        controller.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_is_safe_to_call_twice() -> ChatResult<()> {
        let (controller, _store) = harness(Arc::new(StubBackend::default())).await?;
        controller.new_conversation();
        controller.shutdown().await;
        controller.shutdown().await;
        Ok(())
    }
}
