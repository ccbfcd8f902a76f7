//! `SQLite` implementation of the chat store.

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio::sync::broadcast;
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::core::config::StorageConfig;
use crate::core::errors::ChatResult;
use crate::core::ids::{ConversationId, MessageId};
use crate::core::types::{ChatMessage, Conversation, MessageRole, Provenance, datetime_from_millis};
use crate::store::{ChatStore, StoreChange, StoreFuture};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Schema applied on every open. `REFERENCES … ON DELETE CASCADE` needs
/// `PRAGMA foreign_keys`, which lives for the life of the connection.
const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL DEFAULT '',
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    last_message_at INTEGER,
    is_archived     INTEGER NOT NULL DEFAULT 0,
    is_pinned       INTEGER NOT NULL DEFAULT 0,
    summary         TEXT,
    message_count   INTEGER
);
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    agent_name      TEXT,
    provider        TEXT,
    provider_color  TEXT,
    model_used      TEXT,
    confidence      REAL,
    created_at      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_conversations_recency
    ON conversations (updated_at DESC);
";

const INSERT_MESSAGE: &str = "INSERT OR REPLACE INTO messages
     (id, conversation_id, role, content, agent_name, provider,
      provider_color, model_used, confidence, created_at)
 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

/// `SQLite`-backed chat store with change fan-out.
pub struct SqliteChatStore {
    conn: Connection,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteChatStore {
    /// Open (or create) the store at the configured path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(config: &StorageConfig) -> ChatResult<Self> {
        let conn = Connection::open(config.sqlite_path.clone()).await?;
        Self::initialize(conn).await
    }

    /// Open a private in-memory store (tests, ephemeral sessions).
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub async fn open_in_memory() -> ChatResult<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::initialize(conn).await
    }

    async fn initialize(conn: Connection) -> ChatResult<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { conn, changes })
    }

    fn publish(&self, change: StoreChange) {
        // An Err only means no feed is listening right now.
        if self.changes.send(change).is_err() {
            debug!("Store change dropped: no subscribers");
        }
    }
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: datetime_from_millis(row.get(2)?),
        updated_at: datetime_from_millis(row.get(3)?),
        last_message_at: row.get::<_, Option<i64>>(4)?.map(datetime_from_millis),
        is_archived: row.get(5)?,
        is_pinned: row.get(6)?,
        summary: row.get(7)?,
        message_count: row.get(8)?,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get(2)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::from_wire(&role),
        content: row.get(3)?,
        provenance: Provenance {
            agent_name: row.get(4)?,
            provider: row.get(5)?,
            provider_color: row.get(6)?,
            model_used: row.get(7)?,
            confidence: row.get::<_, Option<f64>>(8)?.map(|c| c as f32),
        },
        created_at: datetime_from_millis(row.get(9)?),
    })
}

impl ChatStore for SqliteChatStore {
    fn upsert_conversation(&self, conversation: Conversation) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    // A plain REPLACE would delete-then-insert and cascade
                    // away the conversation's messages.
                    conn.execute(
                        "INSERT INTO conversations
                             (id, title, created_at, updated_at, last_message_at,
                              is_archived, is_pinned, summary, message_count)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(id) DO UPDATE SET
                             title = excluded.title,
                             created_at = excluded.created_at,
                             updated_at = excluded.updated_at,
                             last_message_at = excluded.last_message_at,
                             is_archived = excluded.is_archived,
                             is_pinned = excluded.is_pinned,
                             summary = excluded.summary,
                             message_count = excluded.message_count",
                        rusqlite::params![
                            conversation.id,
                            conversation.title,
                            conversation.created_at.timestamp_millis(),
                            conversation.updated_at.timestamp_millis(),
                            conversation.last_message_at.map(|at| at.timestamp_millis()),
                            conversation.is_archived,
                            conversation.is_pinned,
                            conversation.summary,
                            conversation.message_count,
                        ],
                    )?;
                    Ok(())
                })
                .await?;
            self.publish(StoreChange::ConversationsChanged);
            Ok(())
        })
    }

    fn upsert_message(&self, message: ChatMessage) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let owner = message.conversation_id.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        INSERT_MESSAGE,
                        rusqlite::params![
                            message.id,
                            message.conversation_id,
                            message.role.as_str(),
                            message.content,
                            message.provenance.agent_name,
                            message.provenance.provider,
                            message.provenance.provider_color,
                            message.provenance.model_used,
                            message.provenance.confidence,
                            message.created_at.timestamp_millis(),
                        ],
                    )?;
                    Ok(())
                })
                .await?;
            self.publish(StoreChange::MessagesChanged(owner));
            Ok(())
        })
    }

    fn upsert_messages(&self, messages: Vec<ChatMessage>) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            if messages.is_empty() {
                return Ok(());
            }
            let mut touched: Vec<ConversationId> = Vec::new();
            for message in &messages {
                if !touched.contains(&message.conversation_id) {
                    touched.push(message.conversation_id.clone());
                }
            }
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    {
                        let mut stmt = tx.prepare(INSERT_MESSAGE)?;
                        for message in messages {
                            stmt.execute(rusqlite::params![
                                message.id,
                                message.conversation_id,
                                message.role.as_str(),
                                message.content,
                                message.provenance.agent_name,
                                message.provenance.provider,
                                message.provenance.provider_color,
                                message.provenance.model_used,
                                message.provenance.confidence,
                                message.created_at.timestamp_millis(),
                            ])?;
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?;
            for id in touched {
                self.publish(StoreChange::MessagesChanged(id));
            }
            Ok(())
        })
    }

    fn delete_conversation(&self, id: &ConversationId) -> StoreFuture<'_, ChatResult<()>> {
        let id = id.clone();
        Box::pin(async move {
            let sql_id = id.clone();
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "DELETE FROM conversations WHERE id = ?1",
                        rusqlite::params![sql_id],
                    )?;
                    Ok(())
                })
                .await?;
            self.publish(StoreChange::ConversationsChanged);
            self.publish(StoreChange::MessagesChanged(id));
            Ok(())
        })
    }

    fn delete_message(&self, id: &MessageId) -> StoreFuture<'_, ChatResult<()>> {
        let id = id.clone();
        Box::pin(async move {
            let owner = self
                .conn
                .call(move |conn| {
                    let owner: Option<ConversationId> = conn
                        .query_row(
                            "SELECT conversation_id FROM messages WHERE id = ?1",
                            rusqlite::params![id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if owner.is_some() {
                        conn.execute("DELETE FROM messages WHERE id = ?1", rusqlite::params![id])?;
                    }
                    Ok(owner)
                })
                .await?;
            if let Some(owner) = owner {
                self.publish(StoreChange::MessagesChanged(owner));
            }
            Ok(())
        })
    }

    fn conversation(
        &self,
        id: &ConversationId,
    ) -> StoreFuture<'_, ChatResult<Option<Conversation>>> {
        let id = id.clone();
        Box::pin(async move {
            let row = self
                .conn
                .call(move |conn| {
                    let row = conn
                        .query_row(
                            "SELECT id, title, created_at, updated_at, last_message_at,
                                    is_archived, is_pinned, summary, message_count
                             FROM conversations WHERE id = ?1",
                            rusqlite::params![id],
                            conversation_from_row,
                        )
                        .optional()?;
                    Ok(row)
                })
                .await?;
            Ok(row)
        })
    }

    fn conversations(&self) -> StoreFuture<'_, ChatResult<Vec<Conversation>>> {
        Box::pin(async move {
            let rows = self
                .conn
                .call(|conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id, title, created_at, updated_at, last_message_at,
                                is_archived, is_pinned, summary, message_count
                         FROM conversations
                         ORDER BY COALESCE(last_message_at, updated_at) DESC",
                    )?;
                    let rows = stmt
                        .query_map([], conversation_from_row)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;
            Ok(rows)
        })
    }

    fn messages_of(&self, id: &ConversationId) -> StoreFuture<'_, ChatResult<Vec<ChatMessage>>> {
        let id = id.clone();
        Box::pin(async move {
            let rows = self
                .conn
                .call(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT id, conversation_id, role, content, agent_name, provider,
                                provider_color, model_used, confidence, created_at
                         FROM messages
                         WHERE conversation_id = ?1
                         ORDER BY created_at ASC, id ASC",
                    )?;
                    let rows = stmt
                        .query_map(rusqlite::params![id], message_from_row)?
                        .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                    Ok(rows)
                })
                .await?;
            Ok(rows)
        })
    }

    fn touch_updated_at(
        &self,
        id: &ConversationId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ChatResult<()>> {
        let id = id.clone();
        let millis = at.timestamp_millis();
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "UPDATE conversations
                         SET updated_at = ?2, last_message_at = ?2
                         WHERE id = ?1",
                        rusqlite::params![id, millis],
                    )?;
                    Ok(())
                })
                .await?;
            self.publish(StoreChange::ConversationsChanged);
            Ok(())
        })
    }

    fn update_title(
        &self,
        id: &ConversationId,
        title: &str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, ChatResult<()>> {
        let id = id.clone();
        let title = title.to_string();
        let millis = at.timestamp_millis();
        Box::pin(async move {
            self.conn
                .call(move |conn| {
                    conn.execute(
                        "UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1",
                        rusqlite::params![id, title, millis],
                    )?;
                    Ok(())
                })
                .await?;
            self.publish(StoreChange::ConversationsChanged);
            Ok(())
        })
    }

    fn clear_all(&self) -> StoreFuture<'_, ChatResult<()>> {
        Box::pin(async move {
            let touched = self
                .conn
                .call(|conn| {
                    let tx = conn.transaction()?;
                    let ids = {
                        let mut stmt =
                            tx.prepare("SELECT DISTINCT conversation_id FROM messages")?;
                        stmt.query_map([], |row| row.get::<_, ConversationId>(0))?
                            .collect::<Result<Vec<_>, rusqlite::Error>>()?
                    };
                    tx.execute("DELETE FROM messages", [])?;
                    tx.execute("DELETE FROM conversations", [])?;
                    tx.commit()?;
                    Ok(ids)
                })
                .await?;
            self.publish(StoreChange::ConversationsChanged);
            for id in touched {
                self.publish(StoreChange::MessagesChanged(id));
            }
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
