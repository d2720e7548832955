//! Tool dispatcher guarantees: at-most-once execution, confirmation
//! deferral, and error containment.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::json;
use tether_engine::dispatch::{Dispatch, SkipReason, dispatch, resolve_pending};
use tether_engine::{Session, ToolContext, ToolRegistry};
use tether_types::{
    Conversation, ConversationId, ConversationOwner, ToolCall, ToolDefinition, UserId,
};

use crate::common::{RecordingTool, executions};

const MAX_CALLS: usize = 16;

fn session() -> Session {
    Session::new(Conversation::new(
        ConversationId::new("c1"),
        ConversationOwner::person("p1"),
    ))
}

fn ctx() -> Arc<ToolContext> {
    Arc::new(ToolContext::new(
        UserId::new("u1"),
        Some(ConversationOwner::person("p1")),
    ))
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::new(id, name, args)
}

#[tokio::test]
async fn same_tool_twice_executes_once() {
    let tool = RecordingTool::new("create_person");
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let ctx = ctx();

    let first = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "create_person", json!({"first_name": "Ann"})),
        MAX_CALLS,
    );
    let Dispatch::Invoked(task) = first else {
        panic!("first call must execute");
    };
    let result = task.await;
    assert!(!result.is_error);

    let second = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_2", "create_person", json!({"first_name": "Bob"})),
        MAX_CALLS,
    );
    assert!(matches!(
        second,
        Dispatch::Skipped(SkipReason::AlreadyInvoked)
    ));

    // Only Ann ever reached the executor.
    assert_eq!(executions(&log), vec![json!({"first_name": "Ann"})]);
    assert!(session.was_invoked("create_person"));
}

#[tokio::test]
async fn repeatable_tool_executes_once_per_call_id() {
    let tool = RecordingTool::new("log_interaction").repeatable();
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let ctx = ctx();

    for id in ["call_1", "call_2"] {
        let outcome = dispatch(
            &mut session,
            &registry,
            &ctx,
            &call(id, "log_interaction", json!({"note": id})),
            MAX_CALLS,
        );
        let Dispatch::Invoked(task) = outcome else {
            panic!("distinct call ids must each execute");
        };
        task.await;
    }
    assert_eq!(executions(&log).len(), 2);

    // The same call id redelivered is suppressed.
    let replay = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "log_interaction", json!({})),
        MAX_CALLS,
    );
    assert!(matches!(
        replay,
        Dispatch::Skipped(SkipReason::AlreadyInvoked)
    ));
    assert_eq!(executions(&log).len(), 2);
}

#[tokio::test]
async fn unknown_tool_is_skipped_without_poisoning_the_session() {
    let tool = RecordingTool::new("create_person");
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let ctx = ctx();

    let unknown = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "no_such_tool", json!({})),
        MAX_CALLS,
    );
    assert!(matches!(unknown, Dispatch::Skipped(SkipReason::UnknownTool)));

    let known = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_2", "create_person", json!({})),
        MAX_CALLS,
    );
    let Dispatch::Invoked(task) = known else {
        panic!("known tool must still execute");
    };
    task.await;
    assert_eq!(executions(&log).len(), 1);
}

#[tokio::test]
async fn declarative_tool_records_without_executing() {
    let mut registry = ToolRegistry::default();
    registry
        .register_schema(ToolDefinition::new(
            "open_timeline",
            "Opens the timeline panel",
            json!({"type": "object"}),
        ))
        .unwrap();

    let mut session = session();
    let outcome = dispatch(
        &mut session,
        &registry,
        &ctx(),
        &call("call_1", "open_timeline", json!({})),
        MAX_CALLS,
    );
    assert!(matches!(outcome, Dispatch::Skipped(SkipReason::Declarative)));
}

#[tokio::test]
async fn confirmation_tool_defers_until_resolved() {
    let tool = RecordingTool::new("delete_person").confirmed();
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let ctx = ctx();

    let outcome = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "delete_person", json!({"id": "p1"})),
        MAX_CALLS,
    );
    assert!(matches!(outcome, Dispatch::Deferred));
    assert!(executions(&log).is_empty());

    let pending = session.pending.get().expect("slot must be armed");
    assert_eq!(pending.name, "delete_person");
    assert_eq!(pending.tool_call_id, "call_1");

    let task = resolve_pending(&mut session, &registry, &ctx, true).expect("approved task");
    let result = task.await;
    assert!(!result.is_error);
    assert_eq!(executions(&log).len(), 1);
    assert!(session.pending.get().is_none());

    // The slot was consumed; resolving again is a no-op.
    assert!(resolve_pending(&mut session, &registry, &ctx, true).is_none());
}

#[tokio::test]
async fn declined_pending_action_never_executes() {
    let tool = RecordingTool::new("delete_person").confirmed();
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let ctx = ctx();
    dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "delete_person", json!({"id": "p1"})),
        MAX_CALLS,
    );

    assert!(resolve_pending(&mut session, &registry, &ctx, false).is_none());
    assert!(executions(&log).is_empty());
    assert!(session.pending.get().is_none());
}

#[tokio::test]
async fn second_confirmation_supersedes_first() {
    let archive = RecordingTool::new("archive_person").confirmed();
    let delete = RecordingTool::new("delete_person").confirmed();
    let archive_log = archive.execution_log();
    let delete_log = delete.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(archive)).unwrap();
    registry.register(Arc::new(delete)).unwrap();

    let mut session = session();
    let ctx = ctx();
    dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "archive_person", json!({})),
        MAX_CALLS,
    );
    dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_2", "delete_person", json!({})),
        MAX_CALLS,
    );

    // Single slot, last write wins: only the delete is retrievable.
    assert_eq!(session.pending.get().unwrap().name, "delete_person");

    let task = resolve_pending(&mut session, &registry, &ctx, true).unwrap();
    task.await;
    assert!(executions(&archive_log).is_empty());
    assert_eq!(executions(&delete_log).len(), 1);
}

#[tokio::test]
async fn validation_failure_surfaces_error_result() {
    let tool = RecordingTool::new("create_person").with_schema(json!({
        "type": "object",
        "properties": {"first_name": {"type": "string"}},
        "required": ["first_name"],
    }));
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let outcome = dispatch(
        &mut session,
        &registry,
        &ctx(),
        &call("call_1", "create_person", json!({})),
        MAX_CALLS,
    );
    let Dispatch::Invoked(task) = outcome else {
        panic!("validation failures resolve through the task");
    };
    let result = task.await;
    assert!(result.is_error);
    // The executor itself was never reached.
    assert!(executions(&log).is_empty());
}

#[tokio::test]
async fn execution_failure_becomes_error_result() {
    let tool = RecordingTool::new("create_person").failing();
    let successes = tool.success_counter();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let outcome = dispatch(
        &mut session,
        &registry,
        &ctx(),
        &call("call_1", "create_person", json!({})),
        MAX_CALLS,
    );
    let Dispatch::Invoked(task) = outcome else {
        panic!("failing tool still dispatches");
    };
    let result = task.await;
    assert!(result.is_error);
    assert_eq!(successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn on_success_hook_fires_after_success() {
    let tool = RecordingTool::new("create_person");
    let successes = tool.success_counter();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let mut session = session();
    let Dispatch::Invoked(task) = dispatch(
        &mut session,
        &registry,
        &ctx(),
        &call("call_1", "create_person", json!({})),
        MAX_CALLS,
    ) else {
        panic!("must execute");
    };
    task.await;
    assert_eq!(successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_turn_cap_pre_resolves_to_errors() {
    let first = RecordingTool::new("create_person");
    let second = RecordingTool::new("create_group");
    let second_log = second.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(first)).unwrap();
    registry.register(Arc::new(second)).unwrap();

    let mut session = session();
    let ctx = ctx();

    let Dispatch::Invoked(task) = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_1", "create_person", json!({})),
        1,
    ) else {
        panic!("first call fits the cap");
    };
    task.await;

    let Dispatch::Invoked(task) = dispatch(
        &mut session,
        &registry,
        &ctx,
        &call("call_2", "create_group", json!({})),
        1,
    ) else {
        panic!("capped call still resolves, as an error");
    };
    let result = task.await;
    assert!(result.is_error);
    assert!(executions(&second_log).is_empty());
}
