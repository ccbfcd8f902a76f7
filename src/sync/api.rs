//! Remote chat API: wire DTOs, the backend trait, and the HTTP client.
//!
//! Every network-facing call returns `Result<T, SendFailure>` so callers
//! branch on the failure kind instead of matching error strings.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::auth::TokenProvider;
use crate::core::config::ApiConfig;
use crate::core::errors::{ChatResult, SendFailure};
use crate::core::ids::{ConversationId, MessageId};

/// Boxed future type for backend calls.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Body of `POST chat/send`.
#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    /// User-authored text.
    pub message: String,
    /// Target conversation; absent lets the server open a new one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Whether the reply should arrive over the streaming channel.
    pub stream: bool,
}

/// Nested message object inside a send reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageBody {
    /// Server-issued message id.
    #[serde(default)]
    pub id: Option<String>,
    /// Owning conversation id.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Wire role string.
    #[serde(default)]
    pub role: Option<String>,
    /// Reply content.
    #[serde(default)]
    pub content: Option<String>,
    /// Agent that produced the reply.
    #[serde(default)]
    pub agent_name: Option<String>,
    /// Upstream provider.
    #[serde(default)]
    pub provider: Option<String>,
    /// Provider display color.
    #[serde(default)]
    pub provider_color: Option<String>,
    /// Concrete model used.
    #[serde(default)]
    pub model_used: Option<String>,
    /// Confidence score.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Creation instant as an epoch-milliseconds string.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Reply of `POST chat/send`.
///
/// The backend has shipped both nested and flat layouts; the accessors
/// prefer the nested message object and fall back to the top level.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessageReply {
    /// Nested message object, when present.
    #[serde(default)]
    pub message: Option<MessageBody>,
    /// Flat conversation id fallback.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Flat agent-name fallback.
    #[serde(default)]
    pub agent_used: Option<String>,
    /// Flat provider fallback.
    #[serde(default)]
    pub provider: Option<String>,
    /// Flat provider-color fallback.
    #[serde(default)]
    pub provider_color: Option<String>,
    /// Flat model fallback.
    #[serde(default)]
    pub model_used: Option<String>,
    /// Flat confidence fallback.
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl SendMessageReply {
    /// Reply content, empty when the server sent none.
    #[must_use]
    pub fn content(&self) -> &str {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .unwrap_or_default()
    }

    /// Server-issued id of the reply message.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.id.as_deref())
    }

    /// Conversation id, nested first.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.conversation_id.as_deref())
            .or(self.conversation_id.as_deref())
    }

    /// Agent name, nested first.
    #[must_use]
    pub fn agent_name(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.agent_name.as_deref())
            .or(self.agent_used.as_deref())
    }

    /// Provider, nested first.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.provider.as_deref())
            .or(self.provider.as_deref())
    }

    /// Provider color, nested first.
    #[must_use]
    pub fn provider_color(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.provider_color.as_deref())
            .or(self.provider_color.as_deref())
    }

    /// Model, nested first.
    #[must_use]
    pub fn model_used(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.model_used.as_deref())
            .or(self.model_used.as_deref())
    }

    /// Confidence, nested first.
    #[must_use]
    pub fn confidence(&self) -> Option<f64> {
        self.message
            .as_ref()
            .and_then(|m| m.confidence)
            .or(self.confidence)
    }

    /// Reply creation instant string, when the server sent one.
    #[must_use]
    pub fn created_at(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.created_at.as_deref())
    }
}

const fn default_page() -> u32 {
    1
}

const fn default_size() -> u32 {
    20
}

/// One page of `GET chat/conversations`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationPage {
    /// Conversations on this page.
    #[serde(default)]
    pub items: Vec<RemoteConversation>,
    /// Total conversations on the server.
    #[serde(default)]
    pub total: u32,
    /// Page number, 1-based.
    #[serde(default = "default_page")]
    pub page: u32,
    /// Requested page size.
    #[serde(default = "default_size")]
    pub size: u32,
    /// Total page count.
    #[serde(default)]
    pub pages: u32,
}

/// Conversation record as the server sends it (camelCase on the wire).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConversation {
    /// Server-issued conversation id.
    pub id: String,
    /// Display title, possibly blank.
    #[serde(default)]
    pub title: String,
    /// Creation instant as an epoch-milliseconds string.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Last-update instant as an epoch-milliseconds string.
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Latest-message instant as an epoch-milliseconds string.
    #[serde(default)]
    pub last_message_at: Option<String>,
    /// Whether the thread is archived.
    #[serde(default)]
    pub is_archived: bool,
    /// Whether the thread is pinned.
    #[serde(default)]
    pub is_pinned: bool,
    /// Server-generated running summary.
    #[serde(default)]
    pub summary: Option<String>,
    /// Server-side message count.
    #[serde(default)]
    pub message_count: Option<u32>,
}

/// Message record as the server sends it (snake_case on the wire).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    /// Server-issued message id.
    pub id: String,
    /// Owning conversation, when echoed back.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Message content.
    pub content: String,
    /// Wire role string.
    pub role: String,
    /// Agent that produced the message.
    #[serde(default)]
    pub agent_name: Option<String>,
    /// Upstream provider.
    #[serde(default)]
    pub provider: Option<String>,
    /// Provider display color.
    #[serde(default)]
    pub provider_color: Option<String>,
    /// Concrete model used.
    #[serde(default)]
    pub model_used: Option<String>,
    /// Creation instant as an epoch-milliseconds string.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Body of `POST chat/conversations`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateConversationRequest {
    /// Requested title; absent lets the server pick.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Status body of the delete endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteStatus {
    /// Server-reported status string.
    #[serde(default)]
    pub status: String,
}

/// Reply of `POST …/regenerate-title`.
#[derive(Debug, Clone, Deserialize)]
pub struct TitleReply {
    /// Newly generated title.
    pub title: String,
    /// Conversation the title belongs to, when echoed back.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Remote chat API contract.
pub trait ChatBackend: Send + Sync {
    /// Submit a user message and receive the assistant reply.
    fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> ApiFuture<'_, Result<SendMessageReply, SendFailure>>;

    /// Fetch one page of the conversation list.
    fn list_conversations(
        &self,
        page: u32,
        size: u32,
    ) -> ApiFuture<'_, Result<ConversationPage, SendFailure>>;

    /// Create a conversation on the server.
    fn create_conversation(
        &self,
        title: Option<String>,
    ) -> ApiFuture<'_, Result<RemoteConversation, SendFailure>>;

    /// Fetch the authoritative message list of a conversation.
    fn messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ApiFuture<'_, Result<Vec<RemoteMessage>, SendFailure>>;

    /// Delete a conversation on the server.
    fn delete_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> ApiFuture<'_, Result<DeleteStatus, SendFailure>>;

    /// Delete one message on the server.
    fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> ApiFuture<'_, Result<DeleteStatus, SendFailure>>;

    /// Ask the server to regenerate a conversation's title.
    fn regenerate_title(
        &self,
        conversation_id: &ConversationId,
    ) -> ApiFuture<'_, Result<TitleReply, SendFailure>>;
}

/// Production backend over `reqwest`.
pub struct HttpChatBackend {
    client: Client,
    base: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpChatBackend {
    /// Build a client against the configured API base URL.
    ///
    /// # Errors
    /// Returns an error if the base URL does not parse or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &ApiConfig, tokens: Arc<dyn TokenProvider>) -> ChatResult<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        let base = Url::parse(&config.base_url)?;
        Ok(Self {
            client,
            base,
            tokens,
        })
    }

    fn endpoint<I>(&self, segments: I) -> Result<Url, SendFailure>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| SendFailure::unexpected("API base URL cannot be a base"))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, SendFailure> {
        let builder = match self.tokens.access_token().await {
            Some(token) => builder.bearer_auth(token.as_str()),
            None => builder,
        };
        let response = builder.send().await.map_err(|err| classify(&err))?;
        let response = response.error_for_status().map_err(|err| classify(&err))?;
        response.json::<T>().await.map_err(|err| classify(&err))
    }
}

impl ChatBackend for HttpChatBackend {
    fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> ApiFuture<'_, Result<SendMessageReply, SendFailure>> {
        Box::pin(async move {
            let url = self.endpoint(["chat", "send"])?;
            debug!("POST {url}");
            self.execute(self.client.post(url).json(&request)).await
        })
    }

    fn list_conversations(
        &self,
        page: u32,
        size: u32,
    ) -> ApiFuture<'_, Result<ConversationPage, SendFailure>> {
        Box::pin(async move {
            let mut url = self.endpoint(["chat", "conversations"])?;
            url.query_pairs_mut()
                .append_pair("size", &size.to_string())
                .append_pair("page", &page.to_string());
            debug!("GET {url}");
            self.execute(self.client.get(url)).await
        })
    }

    fn create_conversation(
        &self,
        title: Option<String>,
    ) -> ApiFuture<'_, Result<RemoteConversation, SendFailure>> {
        Box::pin(async move {
            let url = self.endpoint(["chat", "conversations"])?;
            debug!("POST {url}");
            let request = CreateConversationRequest { title };
            self.execute(self.client.post(url).json(&request)).await
        })
    }

    fn messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ApiFuture<'_, Result<Vec<RemoteMessage>, SendFailure>> {
        let url = self.endpoint(["chat", "conversations", conversation_id.as_str(), "messages"]);
        Box::pin(async move {
            let url = url?;
            debug!("GET {url}");
            self.execute(self.client.get(url)).await
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> ApiFuture<'_, Result<DeleteStatus, SendFailure>> {
        let url = self.endpoint(["chat", "conversations", conversation_id.as_str()]);
        Box::pin(async move {
            let url = url?;
            debug!("DELETE {url}");
            self.execute(self.client.delete(url)).await
        })
    }

    fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> ApiFuture<'_, Result<DeleteStatus, SendFailure>> {
        let url = self.endpoint([
            "chat",
            "conversations",
            conversation_id.as_str(),
            "messages",
            message_id.as_str(),
        ]);
        Box::pin(async move {
            let url = url?;
            debug!("DELETE {url}");
            self.execute(self.client.delete(url)).await
        })
    }

    fn regenerate_title(
        &self,
        conversation_id: &ConversationId,
    ) -> ApiFuture<'_, Result<TitleReply, SendFailure>> {
        let url = self.endpoint([
            "chat",
            "conversations",
            conversation_id.as_str(),
            "regenerate-title",
        ]);
        Box::pin(async move {
            let url = url?;
            debug!("POST {url}");
            self.execute(self.client.post(url)).await
        })
    }
}

/// Map a transport-layer error onto the tagged failure kinds.
fn classify(err: &reqwest::Error) -> SendFailure {
    if err.status() == Some(StatusCode::NOT_FOUND) {
        return SendFailure::not_found(err.to_string());
    }
    if err.is_timeout() {
        return SendFailure::timeout(err.to_string());
    }
    if let Some(io) = find_io_error(err) {
        match io.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                return SendFailure::connection_refused(err.to_string());
            }
            std::io::ErrorKind::TimedOut => return SendFailure::timeout(err.to_string()),
            _ => {}
        }
    }
    if chain_mentions(err, &["dns error", "failed to lookup", "Name or service not known"]) {
        return SendFailure::host_unreachable(err.to_string());
    }
    SendFailure::unexpected(err.to_string())
}

fn find_io_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a std::io::Error> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = cause.source();
    }
    None
}

fn chain_mentions(err: &(dyn std::error::Error + 'static), needles: &[&str]) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        if needles.iter().any(|needle| text.contains(needle)) {
            return true;
        }
        current = cause.source();
    }
    false
}
