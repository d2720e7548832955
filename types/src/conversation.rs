//! Conversation identity and ownership.
//!
//! A conversation is a partition key for messages. The owner records which
//! entity the conversation is about (a person, a group, or the global
//! assistant) and doubles as the ambient entity handed to tool executors.

use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Person,
    Group,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationOwner {
    pub kind: OwnerKind,
    pub identifier: String,
}

impl ConversationOwner {
    #[must_use]
    pub fn person(identifier: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::Person,
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn group(identifier: impl Into<String>) -> Self {
        Self {
            kind: OwnerKind::Group,
            identifier: identifier.into(),
        }
    }

    #[must_use]
    pub fn global() -> Self {
        Self {
            kind: OwnerKind::Global,
            identifier: "global".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub owner: ConversationOwner,
}

impl Conversation {
    pub fn new(id: ConversationId, owner: ConversationOwner) -> Self {
        Self { id, owner }
    }
}
