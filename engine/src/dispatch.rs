//! Tool dispatcher: at most one execution per logical trigger.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use tether_types::{ToolCall, ToolResult};

use crate::pending::PendingAction;
use crate::registry::{ToolContext, ToolExecutor, ToolRegistry, validate_args};
use crate::session::Session;

/// A running tool execution, resolved to its result.
pub type ToolTask = BoxFuture<'static, ToolResult>;

/// Why a tool-call event produced no execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The dedup tie-break: first call wins within a session.
    AlreadyInvoked,
    /// Not in the registry; logged and dropped without failing the session.
    UnknownTool,
    /// Schema-only tool with no server-side effect.
    Declarative,
}

/// Outcome of dispatching one tool-call event.
pub enum Dispatch {
    /// Execution started; resolve the task for the result. Includes calls
    /// that fail fast (validation errors, per-turn cap) - those resolve
    /// immediately to error results so the model hears about them.
    Invoked(ToolTask),
    /// Armed the pending-action slot; execution waits for confirmation.
    Deferred,
    /// Dropped without execution.
    Skipped(SkipReason),
}

/// Translate one tool-call event into at most one execution.
///
/// Dedup bookkeeping happens synchronously here, before any suspension
/// point, so the at-most-once guarantee holds no matter how executions
/// interleave afterwards.
pub fn dispatch(
    session: &mut Session,
    registry: &ToolRegistry,
    ctx: &Arc<ToolContext>,
    call: &ToolCall,
    max_calls_per_turn: usize,
) -> Dispatch {
    let Some(executor) = registry.executor(&call.name) else {
        if registry.is_declarative(&call.name) {
            tracing::debug!(tool = %call.name, "Declarative tool call recorded without execution");
            return Dispatch::Skipped(SkipReason::Declarative);
        }
        tracing::warn!(tool = %call.name, "Unknown tool requested by model; skipping");
        return Dispatch::Skipped(SkipReason::UnknownTool);
    };

    // Capped calls fail fast without consuming the dedup slot, so the
    // tool can still run in a later turn.
    if session.turn_tool_calls >= max_calls_per_turn {
        tracing::warn!(tool = %call.name, max_calls_per_turn, "Per-turn tool call cap reached");
        let result = ToolResult::error(&call.id, &call.name, "Tool call limit reached for this turn");
        return Dispatch::Invoked(core::future::ready(result).boxed());
    }

    // First call wins within a session unless the tool is repeatable, in
    // which case each distinct call id executes exactly once.
    if executor.repeatable() {
        if !session.invoked_call_ids.insert(call.id.clone()) {
            tracing::debug!(tool = %call.name, call_id = %call.id, "Duplicate call id; skipping");
            return Dispatch::Skipped(SkipReason::AlreadyInvoked);
        }
    } else if !session.invoked_tools.insert(call.name.clone()) {
        tracing::debug!(tool = %call.name, "Tool already invoked this session; skipping");
        return Dispatch::Skipped(SkipReason::AlreadyInvoked);
    }
    session.turn_tool_calls += 1;

    if executor.requires_confirmation() {
        session.pending.set(PendingAction {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            tool_call_id: call.id.clone(),
        });
        tracing::debug!(tool = %call.name, "Tool call deferred pending confirmation");
        return Dispatch::Deferred;
    }

    Dispatch::Invoked(execution_task(executor, Arc::clone(ctx), call.clone()))
}

/// Resolve the armed pending action after the user confirms or declines.
///
/// Returns the execution task on approval; a decline clears the slot and
/// executes nothing. The dedup bookkeeping already happened when the slot
/// was armed.
pub fn resolve_pending(
    session: &mut Session,
    registry: &ToolRegistry,
    ctx: &Arc<ToolContext>,
    approved: bool,
) -> Option<ToolTask> {
    let action = session.pending.take()?;
    if !approved {
        tracing::debug!(tool = %action.name, "Pending action declined");
        return None;
    }
    let Some(executor) = registry.executor(&action.name) else {
        tracing::warn!(tool = %action.name, "Pending action references unknown tool");
        return None;
    };
    let call = ToolCall::new(action.tool_call_id, action.name, action.arguments);
    Some(execution_task(executor, Arc::clone(ctx), call))
}

fn execution_task(
    executor: Arc<dyn ToolExecutor>,
    ctx: Arc<ToolContext>,
    call: ToolCall,
) -> ToolTask {
    async move {
        if let Err(e) = validate_args(&executor.schema(), &call.arguments) {
            tracing::warn!(tool = %call.name, %e, "Tool arguments failed validation");
            return ToolResult::error(call.id, call.name, e.to_string());
        }

        match executor.execute(&ctx, call.arguments.clone()).await {
            Ok(content) => {
                executor.on_success(&ctx);
                ToolResult::success(call.id, call.name, content)
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, args = %call.arguments, %e, "Tool execution failed");
                ToolResult::error(call.id, call.name, e.to_string())
            }
        }
    }
    .boxed()
}
