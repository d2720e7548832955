//! End-to-end turn lifecycle: streaming, tool orchestration, persistence,
//! and error recovery.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use tether_engine::{
    EngineConfig, MessageGateway, SessionController, ToolRegistry, TurnPhase,
};
use tether_types::{
    Conversation, ConversationId, ConversationOwner, Message, MessageId, OwnerKind, Role,
    StreamEvent, ToolCall, UserId,
};

use crate::common::{MemoryGateway, RecordingTool, ScriptedStream, executions, init_tracing};

fn conversation() -> Conversation {
    Conversation::new(ConversationId::new("c1"), ConversationOwner::person("p1"))
}

fn controller(
    registry: ToolRegistry,
    gateway: &Arc<MemoryGateway>,
    scripts: Vec<Vec<StreamEvent>>,
) -> SessionController {
    let (controller, _) = controller_with_stream(registry, gateway, scripts);
    controller
}

fn controller_with_stream(
    registry: ToolRegistry,
    gateway: &Arc<MemoryGateway>,
    scripts: Vec<Vec<StreamEvent>>,
) -> (SessionController, Arc<ScriptedStream>) {
    init_tracing();
    let stream = Arc::new(ScriptedStream::new(scripts));
    let controller = SessionController::new(
        conversation(),
        UserId::new("u1"),
        Arc::new(registry),
        Arc::clone(gateway) as Arc<dyn MessageGateway>,
        Arc::clone(&stream) as Arc<dyn tether_engine::ModelStream>,
        EngineConfig {
            history_page_size: 2,
            ..EngineConfig::default()
        },
    );
    (controller, stream)
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCall(ToolCall::new(id, name, args))
}

#[tokio::test]
async fn turn_streams_text_and_persists_new_messages() {
    let gateway = Arc::new(MemoryGateway::new());
    let (mut controller, stream) = controller_with_stream(
        ToolRegistry::default(),
        &gateway,
        vec![vec![
            StreamEvent::TextDelta("Hello ".to_string()),
            StreamEvent::TextDelta("there".to_string()),
            StreamEvent::Done,
        ]],
    );

    let report = controller.send("hi").await.unwrap();
    // The request carried exactly the user message (no assistant skeleton).
    assert_eq!(stream.request_sizes(), vec![1]);
    assert!(report.stream_error.is_none());
    assert_eq!(controller.session().phase(), TurnPhase::Idle);

    let messages = controller.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello there");

    controller.flush_writes().await;
    let stored = gateway.stored(&ConversationId::new("c1"));
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn duplicate_create_person_executes_only_ann() {
    // The model asks for the same non-repeatable tool twice in one turn.
    let tool = RecordingTool::new("create_person");
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        registry,
        &gateway,
        vec![vec![
            tool_call("call_1", "create_person", json!({"first_name": "Ann"})),
            tool_call("call_2", "create_person", json!({"first_name": "Bob"})),
            StreamEvent::TextDelta("Created Ann.".to_string()),
            StreamEvent::Done,
        ]],
    );

    let report = controller.send("add Ann and Bob").await.unwrap();
    assert_eq!(report.executed_tools, 1);
    assert_eq!(report.skipped_tool_calls, 1);
    assert_eq!(executions(&log), vec![json!({"first_name": "Ann"})]);

    let messages = controller.messages();
    let assistant = messages.last().unwrap();
    assert_eq!(assistant.tool_invocations.len(), 1);
    assert!(assistant.tool_invocations[0].is_completed());
    assert_eq!(assistant.tool_invocations[0].args, json!({"first_name": "Ann"}));
}

#[tokio::test]
async fn dedup_set_survives_across_turns() {
    let tool = RecordingTool::new("create_person");
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        registry,
        &gateway,
        vec![
            vec![
                tool_call("call_1", "create_person", json!({"first_name": "Ann"})),
                StreamEvent::Done,
            ],
            vec![
                tool_call("call_2", "create_person", json!({"first_name": "Ann"})),
                StreamEvent::Done,
            ],
        ],
    );

    controller.send("add Ann").await.unwrap();
    let second = controller.send("add Ann again").await.unwrap();

    assert_eq!(second.skipped_tool_calls, 1);
    assert_eq!(executions(&log).len(), 1);
}

#[tokio::test]
async fn tool_failure_does_not_stop_the_turn() {
    let failing = RecordingTool::new("create_person").failing();
    let working = RecordingTool::new("create_task");
    let working_log = working.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(failing)).unwrap();
    registry.register(Arc::new(working)).unwrap();

    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        registry,
        &gateway,
        vec![vec![
            tool_call("call_1", "create_person", json!({})),
            tool_call("call_2", "create_task", json!({"title": "follow up"})),
            StreamEvent::Done,
        ]],
    );

    let report = controller.send("do both").await.unwrap();
    assert!(report.stream_error.is_none());
    assert_eq!(report.executed_tools, 2);
    assert_eq!(executions(&working_log).len(), 1);

    let messages = controller.messages();
    let assistant = messages.last().unwrap();
    let failed = assistant
        .tool_invocations
        .iter()
        .find(|inv| inv.tool_call_id == "call_1")
        .unwrap();
    assert!(failed.is_completed());
    assert_eq!(controller.session().phase(), TurnPhase::Idle);
}

#[tokio::test]
async fn stream_error_appends_synthetic_message_and_returns_to_idle() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        ToolRegistry::default(),
        &gateway,
        vec![
            vec![
                StreamEvent::TextDelta("partial".to_string()),
                StreamEvent::Error(
                    r#"API error 500: {"error": {"message": "backend exploded"}}"#.to_string(),
                ),
            ],
            vec![StreamEvent::TextDelta("recovered".to_string()), StreamEvent::Done],
        ],
    );

    let report = controller.send("hi").await.unwrap();
    assert!(report.stream_error.is_some());
    assert_eq!(controller.session().phase(), TurnPhase::Idle);

    let messages = controller.messages();
    // user + partial assistant + synthetic error message
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].content, "partial");
    let error_message = messages.last().unwrap();
    assert_eq!(error_message.role, Role::Assistant);
    assert!(error_message.content.starts_with("[Stream error]"));
    assert!(error_message.content.contains("backend exploded"));

    // Nothing from the failed turn is persisted.
    controller.flush_writes().await;
    assert!(gateway.stored(&ConversationId::new("c1")).is_empty());

    // The session still accepts input.
    let next = controller.send("try again").await.unwrap();
    assert!(next.stream_error.is_none());
}

#[tokio::test]
async fn empty_assistant_placeholder_is_dropped_on_error() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        ToolRegistry::default(),
        &gateway,
        vec![vec![StreamEvent::Error("connection reset".to_string())]],
    );

    controller.send("hi").await.unwrap();
    let messages = controller.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert!(messages[1].content.starts_with("[Stream error]"));
}

#[tokio::test]
async fn pending_confirmation_defers_until_approved() {
    let tool = RecordingTool::new("delete_person").confirmed();
    let log = tool.execution_log();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        registry,
        &gateway,
        vec![vec![
            tool_call("call_1", "delete_person", json!({"id": "p1"})),
            StreamEvent::TextDelta("This needs your confirmation.".to_string()),
            StreamEvent::Done,
        ]],
    );

    controller.send("delete p1").await.unwrap();
    assert!(executions(&log).is_empty());
    let pending = controller.pending_action().expect("slot must be armed");
    assert_eq!(pending.name, "delete_person");

    let result = controller.resolve_pending(true).await.expect("approved");
    assert!(!result.is_error);
    assert_eq!(executions(&log).len(), 1);
    assert!(controller.pending_action().is_none());

    // The invocation on the assistant message reached its result state and
    // the updated message was re-persisted.
    let messages = controller.messages();
    let assistant = messages.last().unwrap();
    assert!(assistant.tool_invocations[0].is_completed());
    let assistant_id = assistant.id.clone();
    drop(messages);

    controller.flush_writes().await;
    let stored = gateway.stored(&ConversationId::new("c1"));
    let stored_assistant = stored.iter().find(|m| m.id == assistant_id).unwrap();
    assert!(stored_assistant.tool_invocations[0].is_completed());
}

#[tokio::test]
async fn pending_action_survives_turns_until_resolved() {
    let tool = RecordingTool::new("delete_person").confirmed();
    let mut registry = ToolRegistry::default();
    registry.register(Arc::new(tool)).unwrap();

    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        registry,
        &gateway,
        vec![
            vec![
                tool_call("call_1", "delete_person", json!({"id": "p1"})),
                StreamEvent::Done,
            ],
            vec![StreamEvent::TextDelta("ok".to_string()), StreamEvent::Done],
        ],
    );

    controller.send("delete p1").await.unwrap();
    controller.send("unrelated question").await.unwrap();
    assert!(controller.pending_action().is_some());
}

#[tokio::test]
async fn persistence_failure_notifies_without_touching_the_buffer() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.set_fail_writes(true);

    let mut controller = controller(
        ToolRegistry::default(),
        &gateway,
        vec![vec![
            StreamEvent::TextDelta("hello".to_string()),
            StreamEvent::Done,
        ]],
    );

    controller.send("hi").await.unwrap();
    controller.flush_writes().await;

    let notices = controller.drain_notices();
    assert!(!notices.is_empty());
    assert!(notices[0].contains("could not be saved"));

    // The live buffer remains the visible truth.
    assert_eq!(controller.messages().len(), 2);
}

#[tokio::test]
async fn new_turn_may_start_while_writes_are_in_flight() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        ToolRegistry::default(),
        &gateway,
        vec![
            vec![StreamEvent::TextDelta("one".to_string()), StreamEvent::Done],
            vec![StreamEvent::TextDelta("two".to_string()), StreamEvent::Done],
        ],
    );

    controller.send("first").await.unwrap();
    // No flush in between: the second turn begins with writes outstanding.
    controller.send("second").await.unwrap();
    controller.flush_writes().await;

    assert_eq!(gateway.stored(&ConversationId::new("c1")).len(), 4);
}

#[tokio::test]
async fn persisted_history_merges_with_live_turn() {
    let gateway = Arc::new(MemoryGateway::new());
    let conv = ConversationId::new("c1");
    gateway
        .create_message(
            &conv,
            &Message::new(
                MessageId::new("m0"),
                Role::User,
                "old question",
                Utc.timestamp_opt(1_000, 0).unwrap(),
            ),
        )
        .await
        .unwrap();
    gateway
        .create_message(
            &conv,
            &Message::new(
                MessageId::new("m1"),
                Role::Assistant,
                "old answer",
                Utc.timestamp_opt(2_000, 0).unwrap(),
            ),
        )
        .await
        .unwrap();

    let mut controller = controller(
        ToolRegistry::default(),
        &gateway,
        vec![vec![
            StreamEvent::TextDelta("fresh answer".to_string()),
            StreamEvent::Done,
        ]],
    );

    controller.fetch_history_page().await.unwrap();
    controller.send("new question").await.unwrap();

    let contents: Vec<&str> = controller
        .messages()
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        contents,
        vec!["old question", "old answer", "new question", "fresh answer"]
    );

    // Redelivering the page converges to the same sequence.
    controller.fetch_history_page().await.unwrap();
    assert_eq!(controller.messages().len(), 4);
}

#[tokio::test]
async fn sending_touches_the_recency_cache() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut controller = controller(
        ToolRegistry::default(),
        &gateway,
        vec![vec![StreamEvent::Done]],
    );

    assert!(controller.recently_viewed().is_empty());
    controller.send("hi").await.unwrap();

    let recent = controller.recently_viewed();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].kind, OwnerKind::Person);
    assert_eq!(recent[0].identifier, "p1");
}
