//! Core domain types for Tether - no IO, no async.
//!
//! Everything the orchestration engine, the provider clients, and the
//! message store agree on lives here: conversation and message identity,
//! the message model, tool-call wire types, and the normalized stream
//! event shape.

pub mod conversation;
pub mod message;

mod ids;

pub use conversation::{Conversation, ConversationOwner, OwnerKind};
pub use ids::{ConversationId, MessageId, UserId};
pub use message::{InvocationState, Message, ParseRoleError, Role, ToolInvocation};

use serde::{Deserialize, Serialize};

/// Definition of a tool that can be called by the model.
///
/// Follows the standard function calling schema used by OpenAI-compatible
/// chat APIs. A definition may exist without any server-side executor
/// (declarative tools that only drive the UI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (function name).
    pub name: String,
    /// A description of what the tool does, shown to the model.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: serde_json::Value,
    /// Optional human-facing name for confirmation prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            display_name: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// A tool call requested by the model.
///
/// Contains the call id (for matching with results), the tool name, and the
/// arguments as parsed JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this tool call within a session.
    pub id: String,
    /// The name of the tool being called.
    pub name: String,
    /// The arguments to pass to the tool, as parsed JSON.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The result of executing a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The id of the tool call this result is for.
    pub tool_call_id: String,
    /// The name of the tool that was called.
    pub tool_name: String,
    /// The result payload (structured on success, an error string otherwise).
    pub content: serde_json::Value,
    /// Whether the tool execution resulted in an error.
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful tool result.
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content,
            is_error: false,
        }
    }

    /// Create an error tool result.
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: serde_json::Value::String(error.into()),
            is_error: true,
        }
    }
}

/// Normalized event emitted by a model stream.
///
/// Provider clients assemble fragmented wire formats (SSE deltas, partial
/// tool-call arguments) into these events, so consumers only ever see whole
/// tool calls and clean text deltas.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content delta.
    TextDelta(String),
    /// A complete tool call, arguments fully assembled.
    ToolCall(ToolCall),
    /// Stream completed.
    Done,
    /// Stream terminated with an error.
    Error(String),
}

/// Truncate a string to `max_chars`, appending an ellipsis when shortened.
#[must_use]
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let truncated: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}\u{2026}")
}
