//! Per-process conversation state: what is happening right now.
//!
//! Everything here is ephemeral. Persisted records live in the store; this
//! module owns only delivery statuses, the in-progress streaming reply,
//! and the snapshot view consumers render from.

pub mod controller;

pub use controller::ConversationController;

use std::collections::HashMap;

use crate::core::ids::{ConversationId, MessageId, StreamId};
use crate::core::types::ChatMessage;
use crate::transport::EmotionSignal;

/// Delivery state of one user-authored message in this process.
///
/// `Sending` resolves to `Sent` or `Failed`; a retry discards the entry
/// and starts over under a fresh message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The send is in flight.
    Sending,
    /// The server acknowledged the exchange.
    Sent,
    /// The send failed; the message can be retried.
    Failed,
}

/// Accumulating text of an in-progress assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingEnvelope {
    /// Stream turn this envelope belongs to.
    pub stream_id: StreamId,
    /// Cumulative content so far.
    pub content: String,
    /// Server-reported progress in `0.0..=1.0`.
    pub progress: f64,
}

/// Renderable snapshot of the active conversation.
///
/// Published through a `watch` channel; consumers render exclusively from
/// these snapshots and never reach into controller internals.
#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    /// Currently selected conversation, when any.
    pub conversation: Option<ConversationId>,
    /// Ordered messages of the selected conversation.
    pub messages: Vec<ChatMessage>,
    /// Delivery state of this process's sends.
    pub statuses: HashMap<MessageId, SendStatus>,
    /// In-progress assistant reply, between stream start and end.
    pub streaming: Option<StreamingEnvelope>,
    /// Whether the assistant is composing.
    pub typing: bool,
    /// Latest emotional-state signal from the backend.
    pub emotion: Option<EmotionSignal>,
    /// Whether the streaming transport is connected.
    pub connected: bool,
    /// User-facing error banner, when something went wrong.
    pub banner: Option<String>,
}
