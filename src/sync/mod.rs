//! Synchronization between the remote chat API and the local store.
//!
//! [`api`] speaks the HTTP wire format; [`coordinator`] owns the policy
//! for optimistic writes, offline fallback, and reconciliation.

pub mod api;
pub mod coordinator;

pub use api::{
    ApiFuture, ChatBackend, ConversationPage, CreateConversationRequest, DeleteStatus,
    HttpChatBackend, MessageBody, RemoteConversation, RemoteMessage, SendMessageReply,
    SendMessageRequest, TitleReply,
};
pub use coordinator::{SendOutcome, SyncCoordinator};
