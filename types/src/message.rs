//! The message model shared by the live buffer and the durable store.
//!
//! A [`Message`] is identified by its id within a conversation. Messages are
//! never mutated after creation except to attach late-arriving tool
//! invocation results under the same id, which is why the invocation list
//! lives on the message rather than beside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::{ToolCall, ToolResult};

/// Author role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Error for unrecognized role strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRoleError(pub String);

impl std::fmt::Display for ParseRoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown role: {}", self.0)
    }
}

impl std::error::Error for ParseRoleError {}

impl std::str::FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// Lifecycle state of a tool invocation attached to a message.
///
/// `PartialCall` exists for streams that surface argument fragments; the
/// engine only ever stores `Call` and `Result` because provider clients
/// assemble fragments before events reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationState {
    PartialCall,
    Call,
    Result,
}

/// A tool call recorded on a message, together with its eventual result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub state: InvocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl ToolInvocation {
    /// Record a freshly dispatched call (no result yet).
    #[must_use]
    pub fn from_call(call: &ToolCall) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
            state: InvocationState::Call,
            result: None,
        }
    }

    /// Attach a completed result, transitioning to [`InvocationState::Result`].
    pub fn complete(&mut self, result: &ToolResult) {
        self.state = InvocationState::Result;
        self.result = Some(result.content.clone());
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == InvocationState::Result
    }
}

/// A complete message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: Role,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at,
            tool_invocations: Vec::new(),
        }
    }

    #[must_use]
    pub fn system(id: MessageId, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::new(id, Role::System, content, created_at)
    }

    #[must_use]
    pub fn user(id: MessageId, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::new(id, Role::User, content, created_at)
    }

    #[must_use]
    pub fn assistant(id: MessageId, content: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::new(id, Role::Assistant, content, created_at)
    }

    /// Find the invocation recorded for `tool_call_id`, if any.
    pub fn invocation_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.tool_invocations
            .iter_mut()
            .find(|inv| inv.tool_call_id == tool_call_id)
    }

    /// Whether any attached invocation has reached its result state.
    #[must_use]
    pub fn has_completed_invocation(&self) -> bool {
        self.tool_invocations.iter().any(ToolInvocation::is_completed)
    }
}
