//! Tool catalog: names, schemas, executors, and dispatch flags.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use tether_types::{ConversationOwner, ToolDefinition, UserId};

/// Tool execution future type alias.
pub type ToolFut<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Error types for tool registration and execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Tool execution failed: {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Duplicate tool registered: {name}")]
    DuplicateTool { name: String },
}

/// Ambient context handed to tool executors: the authenticated actor and
/// the entity the conversation is about (the person or group in view).
///
/// Executors capture their own storage handles at construction; the context
/// deliberately carries identity only.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: UserId,
    pub ambient: Option<ConversationOwner>,
}

impl ToolContext {
    #[must_use]
    pub fn new(user_id: UserId, ambient: Option<ConversationOwner>) -> Self {
        Self { user_id, ambient }
    }
}

/// A server-side tool implementation.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON Schema for the tool's arguments; validated before execution.
    fn schema(&self) -> Value;
    /// Optional human-facing name for confirmation prompts.
    fn display_name(&self) -> Option<&'static str> {
        None
    }
    /// When true, every invocation in a session is distinct and dedup runs
    /// per call id. When false, only the first invocation per session
    /// executes; later calls to the same tool name are suppressed.
    fn repeatable(&self) -> bool {
        false
    }
    /// When true, the dispatcher arms the pending-action slot instead of
    /// executing; the side effect waits for explicit user confirmation.
    fn requires_confirmation(&self) -> bool {
        false
    }
    fn execute<'a>(&'a self, ctx: &'a ToolContext, args: Value) -> ToolFut<'a>;
    /// Invoked after a successful execution. Used to invalidate derived
    /// caches (e.g. recently-viewed entries for a record the tool changed).
    fn on_success(&self, _ctx: &ToolContext) {}
}

/// Catalog of invocable tools.
///
/// Schema-only definitions are declarative: they appear in the manifest
/// sent to the model but have no server-side executor, so dispatch records
/// them without executing anything.
#[derive(Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
    schema_only: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) -> Result<(), ToolError> {
        let name = executor.name().to_string();
        if self.executors.contains_key(&name) || self.is_declarative(&name) {
            return Err(ToolError::DuplicateTool { name });
        }
        self.executors.insert(name, executor);
        Ok(())
    }

    /// Register a schema-only tool definition (no executor).
    pub fn register_schema(&mut self, def: ToolDefinition) -> Result<(), ToolError> {
        let name = &def.name;
        if self.executors.contains_key(name) || self.is_declarative(name) {
            return Err(ToolError::DuplicateTool { name: name.clone() });
        }
        self.schema_only.push(def);
        Ok(())
    }

    /// Look up the executor for `name`, if it has one.
    #[must_use]
    pub fn executor(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.get(name).cloned()
    }

    /// Whether `name` is registered as a declarative (schema-only) tool.
    #[must_use]
    pub fn is_declarative(&self, name: &str) -> bool {
        self.schema_only.iter().any(|d| d.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name) || self.is_declarative(name)
    }

    /// All definitions for the model's tool manifest, sorted by name.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .executors
            .values()
            .map(|exec| {
                let mut def = ToolDefinition::new(exec.name(), exec.description(), exec.schema());
                if let Some(display_name) = exec.display_name() {
                    def = def.with_display_name(display_name);
                }
                def
            })
            .chain(self.schema_only.iter().cloned())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Registered tool names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.definitions().into_iter().map(|d| d.name).collect()
    }
}

/// Validate arguments against a JSON schema.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| ToolError::BadArgs {
        message: format!("Invalid tool schema: {e}"),
    })?;
    if let Err(err) = validator.validate(args) {
        return Err(ToolError::BadArgs {
            message: err.to_string(),
        });
    }
    Ok(())
}
