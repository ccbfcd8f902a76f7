//! Interactive chat console backed by the synchronization engine.
//! Run with: `cargo run --bin companion-chat`
//!
//! Environment:
//! - `COMPANION_API_URL`: chat API base URL
//! - `COMPANION_WS_URL`: streaming endpoint (`ws://` or `wss://`)
//! - `COMPANION_DB`: `SQLite` database path
//! - `COMPANION_TOKEN`: bearer token (unset runs signed out)
//! - `COMPANION_USER`: identity announced on the streaming channel

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use companion_chat::auth::{StaticTokenProvider, TokenProvider};
use companion_chat::conversation::{ConversationController, ConversationView, SendStatus};
use companion_chat::core::config::ChatConfig;
use companion_chat::core::errors::ChatResult;
use companion_chat::core::ids::{ConversationId, MessageId};
use companion_chat::core::types::{ChatMessage, MessageRole};
use companion_chat::sync::SyncCoordinator;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting chat console v{}", env!("CARGO_PKG_VERSION"));

    let config = config_from_env();
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {e}");
        return ExitCode::from(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(run_console(config)) {
        tracing::error!("Console error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Overlay environment variables onto the default configuration.
fn config_from_env() -> ChatConfig {
    let mut config = ChatConfig::default();
    if let Ok(url) = std::env::var("COMPANION_API_URL") {
        config.api.base_url = url;
    }
    if let Ok(url) = std::env::var("COMPANION_WS_URL") {
        config.stream.url = url;
    }
    if let Ok(path) = std::env::var("COMPANION_DB") {
        config.storage.sqlite_path = path.into();
    }
    config
}

/// Assemble the engine and drive the line-oriented command loop.
async fn run_console(config: ChatConfig) -> ChatResult<()> {
    let tokens: Arc<dyn TokenProvider> = match std::env::var("COMPANION_TOKEN") {
        Ok(token) => Arc::new(StaticTokenProvider::new(token)),
        Err(_) => Arc::new(StaticTokenProvider::signed_out()),
    };
    let identity = std::env::var("COMPANION_USER").unwrap_or_else(|_| "console".to_string());

    let (coordinator, store) = SyncCoordinator::with_sqlite(config, tokens).await?;
    let coordinator = Arc::new(coordinator);
    let controller = ConversationController::new(Arc::clone(&coordinator), store);
    controller.attach_stream(&identity).await;

    let watcher = tokio::spawn(watch_updates(controller.watch_view()));

    println!("companion chat console");
    println!("commands: /new  /list  /open <id>  /delete <id>  /retry <message-id>  /quit");
    println!("anything else is sent as a chat message");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/new" => {
                controller.new_conversation();
                println!("Started a new conversation");
            }
            "/list" => list_conversations(&coordinator).await,
            _ => {
                if let Some(id) = line.strip_prefix("/open ") {
                    controller
                        .select_conversation(&ConversationId::from_raw(id.trim()))
                        .await;
                } else if let Some(id) = line.strip_prefix("/delete ") {
                    let conversation_id = ConversationId::from_raw(id.trim());
                    match controller.delete_conversation(&conversation_id).await {
                        Ok(()) => println!("Deleted {conversation_id}"),
                        Err(e) => println!("Delete failed: {e}"),
                    }
                } else if let Some(id) = line.strip_prefix("/retry ") {
                    controller.retry(&MessageId::from_raw(id.trim())).await;
                } else if line.starts_with('/') {
                    println!("Unknown command: {line}");
                } else {
                    let _ = controller.send(line);
                }
            }
        }
    }

    watcher.abort();
    controller.shutdown().await;
    println!("Bye");
    Ok(())
}

/// Refresh from the backend and print the conversation list.
async fn list_conversations(coordinator: &SyncCoordinator) {
    match coordinator.refresh_conversations().await {
        Ok(conversations) if conversations.is_empty() => println!("No conversations yet"),
        Ok(conversations) => {
            for conversation in &conversations {
                let marker = if conversation.is_pinned { "*" } else { " " };
                println!(" {marker} {}  {}", conversation.id, conversation.title);
            }
        }
        Err(e) => println!("List failed: {e}"),
    }
}

/// Consume view snapshots and print what changed.
async fn watch_updates(mut view: watch::Receiver<ConversationView>) {
    let mut shown = RenderState::default();
    while view.changed().await.is_ok() {
        let snapshot = view.borrow().clone();
        shown.render(&snapshot);
    }
}

/// What the console has already printed, so each update prints only deltas.
#[derive(Default)]
struct RenderState {
    conversation: Option<ConversationId>,
    printed_messages: usize,
    last_content: String,
    statuses: HashMap<MessageId, SendStatus>,
    banner: Option<String>,
    connected: bool,
    typing: bool,
}

impl RenderState {
    fn render(&mut self, snapshot: &ConversationView) {
        if snapshot.conversation != self.conversation {
            self.conversation = snapshot.conversation.clone();
            self.printed_messages = 0;
            self.last_content.clear();
            if let Some(id) = &self.conversation {
                println!("--- conversation {id} ---");
            }
        }

        if snapshot.connected != self.connected {
            self.connected = snapshot.connected;
            let state = if self.connected { "connected" } else { "offline" };
            println!("[stream {state}]");
        }

        self.render_messages(snapshot);
        self.render_statuses(snapshot);

        if snapshot.typing && !self.typing {
            println!("[assistant is typing]");
        }
        self.typing = snapshot.typing;

        if snapshot.banner != self.banner {
            if let Some(banner) = &snapshot.banner {
                println!("! {banner}");
            }
            self.banner.clone_from(&snapshot.banner);
        }
    }

    /// Print rows added since the last snapshot. A grown trailing message
    /// (the streaming fold rewrites it in place) is reprinted whole.
    fn render_messages(&mut self, snapshot: &ConversationView) {
        if snapshot.messages.len() > self.printed_messages {
            for message in snapshot.messages.iter().skip(self.printed_messages) {
                println!("{} {}", prompt_for(message), message.content);
            }
        } else if let Some(last) = snapshot.messages.last() {
            if snapshot.messages.len() == self.printed_messages && last.content != self.last_content
            {
                println!("{} {}", prompt_for(last), last.content);
            }
        }
        self.printed_messages = snapshot.messages.len();
        self.last_content = snapshot
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();
    }

    fn render_statuses(&mut self, snapshot: &ConversationView) {
        for (id, status) in &snapshot.statuses {
            if self.statuses.get(id) != Some(status) && *status == SendStatus::Failed {
                println!("Send failed; /retry {id}");
            }
        }
        self.statuses.clone_from(&snapshot.statuses);
    }
}

/// Console prompt for a message author.
fn prompt_for(message: &ChatMessage) -> String {
    match message.role {
        MessageRole::User => "you>".to_string(),
        MessageRole::Assistant => {
            let agent = message
                .provenance
                .agent_name
                .as_deref()
                .unwrap_or("assistant");
            format!("{agent}>")
        }
    }
}
