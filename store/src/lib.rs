//! SQLite-backed message gateway.
//!
//! Messages are stored per conversation and listed in reverse-chronological
//! keyset pages: the page key is `(created_at_ms, seq)` where `seq` is the
//! insertion rowid, so pages stay stable while new messages are appended.
//! Writing a message id that already exists replaces the stored copy, which
//! is how late-arriving tool-invocation results reach the store.

mod sqlite_util;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, params};

use tether_engine::{Cursor, GatewayError, MessageGateway, MessagePage};
use tether_types::{ConversationId, Message, MessageId, Role, ToolInvocation};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_invocations TEXT NOT NULL DEFAULT '[]',
    created_at_ms INTEGER NOT NULL,
    UNIQUE (conversation_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_conv_created
    ON messages (conversation_id, created_at_ms, seq);
";

/// Durable message store over a single SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = sqlite_util::open_secure_db(path)?;
        Self::init(conn)
    }

    /// In-memory store; used by tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize message schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of messages stored for `conversation`.
    pub fn message_count(&self, conversation: &ConversationId) -> Result<u64, GatewayError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| GatewayError::QueryFailed(e.to_string()))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl MessageGateway for SqliteStore {
    async fn create_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<Message, GatewayError> {
        let conn = Arc::clone(&self.conn);
        let conversation = conversation.clone();
        let message = message.clone();

        tokio::task::spawn_blocking(move || {
            upsert_message(&conn, &conversation, &message)?;
            Ok(message)
        })
        .await
        .map_err(|e| GatewayError::Unavailable(e.to_string()))?
    }

    async fn list_messages(
        &self,
        conversation: &ConversationId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<MessagePage, GatewayError> {
        let key = cursor.as_ref().map(|c| parse_cursor(c)).transpose()?;
        let conn = Arc::clone(&self.conn);
        let conversation = conversation.clone();
        let limit = limit.max(1);

        tokio::task::spawn_blocking(move || query_page(&conn, &conversation, key, limit))
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?
    }
}

fn lock(conn: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>, GatewayError> {
    conn.lock()
        .map_err(|_| GatewayError::Unavailable("store mutex poisoned".to_string()))
}

fn upsert_message(
    conn: &Arc<Mutex<Connection>>,
    conversation: &ConversationId,
    message: &Message,
) -> Result<(), GatewayError> {
    let invocations = serde_json::to_string(&message.tool_invocations).map_err(|e| {
        GatewayError::WriteFailed {
            message_id: message.id.to_string(),
            reason: format!("invocations not serializable: {e}"),
        }
    })?;

    let conn = lock(conn)?;
    conn.execute(
        "INSERT INTO messages (conversation_id, message_id, role, content, tool_invocations, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (conversation_id, message_id) DO UPDATE SET
             role = excluded.role,
             content = excluded.content,
             tool_invocations = excluded.tool_invocations,
             created_at_ms = excluded.created_at_ms",
        params![
            conversation.as_str(),
            message.id.as_str(),
            message.role.as_str(),
            message.content,
            invocations,
            message.created_at.timestamp_millis(),
        ],
    )
    .map_err(|e| GatewayError::WriteFailed {
        message_id: message.id.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn query_page(
    conn: &Arc<Mutex<Connection>>,
    conversation: &ConversationId,
    key: Option<(i64, i64)>,
    limit: usize,
) -> Result<MessagePage, GatewayError> {
    let conn = lock(conn)?;
    let fetch = limit + 1;

    let map_err = |e: rusqlite::Error| GatewayError::QueryFailed(e.to_string());

    // Newest first; one extra row decides has_more.
    let mut rows: Vec<(Message, i64, i64)> = match key {
        Some((ms, seq)) => {
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, role, content, tool_invocations, created_at_ms, seq
                     FROM messages
                     WHERE conversation_id = ?1
                       AND (created_at_ms < ?2 OR (created_at_ms = ?2 AND seq < ?3))
                     ORDER BY created_at_ms DESC, seq DESC
                     LIMIT ?4",
                )
                .map_err(map_err)?;
            let mapped = stmt
                .query_map(
                    params![conversation.as_str(), ms, seq, fetch as i64],
                    decode_row,
                )
                .map_err(map_err)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, role, content, tool_invocations, created_at_ms, seq
                     FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at_ms DESC, seq DESC
                     LIMIT ?2",
                )
                .map_err(map_err)?;
            let mapped = stmt
                .query_map(params![conversation.as_str(), fetch as i64], decode_row)
                .map_err(map_err)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?
        }
    };

    let has_more = rows.len() > limit;
    rows.truncate(limit);

    let next_cursor = if has_more {
        rows.last()
            .map(|(_, ms, seq)| Cursor::new(format!("{ms}:{seq}")))
    } else {
        None
    };

    // Oldest-to-newest within the page.
    let messages: Vec<Message> = rows.into_iter().rev().map(|(message, _, _)| message).collect();

    Ok(MessagePage {
        messages,
        next_cursor,
        has_more,
    })
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Message, i64, i64)> {
    let message_id: String = row.get(0)?;
    let role: String = row.get(1)?;
    let content: String = row.get(2)?;
    let invocations: String = row.get(3)?;
    let created_at_ms: i64 = row.get(4)?;
    let seq: i64 = row.get(5)?;

    let role: Role = role.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let tool_invocations: Vec<ToolInvocation> = serde_json::from_str(&invocations).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_at = chrono::DateTime::from_timestamp_millis(created_at_ms).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(4, created_at_ms)
    })?;

    let mut message = Message::new(MessageId::new(message_id), role, content, created_at);
    message.tool_invocations = tool_invocations;
    Ok((message, created_at_ms, seq))
}

fn parse_cursor(cursor: &Cursor) -> Result<(i64, i64), GatewayError> {
    let invalid = || GatewayError::QueryFailed(format!("invalid cursor: {}", cursor.as_str()));
    let (ms, seq) = cursor.as_str().split_once(':').ok_or_else(invalid)?;
    let ms: i64 = ms.parse().map_err(|_| invalid())?;
    let seq: i64 = seq.parse().map_err(|_| invalid())?;
    Ok((ms, seq))
}
