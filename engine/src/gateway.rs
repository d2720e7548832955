//! The durable message store boundary.
//!
//! Messages are persisted per conversation and fetched in
//! reverse-chronological pages via opaque cursors. The engine never
//! inspects cursor contents; it only threads them back into the next
//! `list_messages` call.

use async_trait::async_trait;

use tether_types::{ConversationId, Message};

/// Opaque pagination cursor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of persisted history.
///
/// Pages are fetched newest-first; within a page, messages are ordered
/// oldest-to-newest. `next_cursor` continues toward older history.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Write failed for message {message_id}: {reason}")]
    WriteFailed { message_id: String, reason: String },
    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// Durable append-only message store, queried by cursor pagination.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Persist one message. Writing an id that already exists in the
    /// conversation replaces the stored copy (most-recent write wins), which
    /// is how late-arriving tool-invocation results reach the store.
    async fn create_message(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<Message, GatewayError>;

    /// Fetch one reverse-chronological page. A `None` cursor fetches the
    /// newest page.
    async fn list_messages(
        &self,
        conversation: &ConversationId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<MessagePage, GatewayError>;
}
