//! Stream session controller: the full lifecycle of one user turn.
//!
//! The controller owns a [`Session`] and drives it through
//! `Idle -> Streaming -> Finishing -> Idle`. Stream events are consumed as
//! an explicit loop over the event channel; tool executions run
//! concurrently in a [`FuturesUnordered`] so unrelated tools are never
//! serialized against each other, while tool-call *events* are still
//! dispatched in exactly the order the model emitted them.

use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use tether_providers::ChatClient;
use tether_types::{
    Conversation, ConversationOwner, Message, MessageId, OwnerKind, StreamEvent, ToolCall,
    ToolDefinition, ToolInvocation, ToolResult, UserId,
};

use crate::config::EngineConfig;
use crate::dispatch::{self, Dispatch, SkipReason, ToolTask};
use crate::errors::format_stream_error;
use crate::gateway::{GatewayError, MessageGateway};
use crate::pending::PendingAction;
use crate::recency::RecencyCache;
use crate::reconcile::HistoryPaginator;
use crate::registry::{ToolContext, ToolRegistry};
use crate::session::{Session, TurnPhase};

/// The model-stream boundary: opens one turn's event stream.
///
/// Implemented by the production chat client and by scripted streams in
/// tests. The engine depends only on event ordering and shape.
pub trait ModelStream: Send + Sync {
    fn open(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<StreamEvent>;
}

impl ModelStream for ChatClient {
    fn open(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
    ) -> mpsc::Receiver<StreamEvent> {
        self.open_stream(messages, tools)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("A turn is already in progress")]
    Busy,
}

/// Summary of one completed turn.
#[derive(Debug)]
pub struct TurnReport {
    pub assistant_message_id: MessageId,
    /// Executions started (including fail-fast validation errors).
    pub executed_tools: usize,
    /// Tool-call events dropped without execution.
    pub skipped_tool_calls: usize,
    /// Set when the stream failed; the error is also in the live buffer.
    pub stream_error: Option<String>,
}

pub struct SessionController {
    session: Session,
    registry: Arc<ToolRegistry>,
    gateway: Arc<dyn MessageGateway>,
    stream: Arc<dyn ModelStream>,
    tool_ctx: Arc<ToolContext>,
    config: EngineConfig,
    paginator: HistoryPaginator,
    recency: RecencyCache<ConversationOwner>,
    /// In-flight persistence writes. A new turn may begin while these run;
    /// they are never cancelled.
    pending_writes: Vec<JoinHandle<()>>,
    notice_tx: mpsc::UnboundedSender<String>,
    notice_rx: mpsc::UnboundedReceiver<String>,
}

impl SessionController {
    #[must_use]
    pub fn new(
        conversation: Conversation,
        user_id: UserId,
        registry: Arc<ToolRegistry>,
        gateway: Arc<dyn MessageGateway>,
        stream: Arc<dyn ModelStream>,
        config: EngineConfig,
    ) -> Self {
        let ambient = match conversation.owner.kind {
            OwnerKind::Global => None,
            OwnerKind::Person | OwnerKind::Group => Some(conversation.owner.clone()),
        };
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        Self {
            paginator: HistoryPaginator::new(config.history_page_size),
            recency: RecencyCache::new(config.recency_capacity),
            session: Session::new(conversation),
            registry,
            gateway,
            stream,
            tool_ctx: Arc::new(ToolContext::new(user_id, ambient)),
            config,
            pending_writes: Vec::new(),
            notice_tx,
            notice_rx,
        }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The displayed message sequence.
    #[must_use]
    pub fn messages(&self) -> Vec<&Message> {
        self.session.reconciler.ordered()
    }

    #[must_use]
    pub fn pending_action(&self) -> Option<&PendingAction> {
        self.session.pending.get()
    }

    /// Conversation owners touched by recent turns, most recent first.
    #[must_use]
    pub fn recently_viewed(&self) -> &[ConversationOwner] {
        self.recency.recent()
    }

    /// Non-blocking user-facing notices (persistence failures and the like).
    pub fn drain_notices(&mut self) -> Vec<String> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notice_rx.try_recv() {
            notices.push(notice);
        }
        notices
    }

    /// Whether an older history page can be requested right now.
    #[must_use]
    pub fn has_more_history(&self) -> bool {
        self.paginator.has_next_page()
    }

    /// Fetch the next history page (newest first) and merge it into the
    /// live buffer. Driven by proximity-to-top scroll signals; calls while
    /// a fetch is in flight are no-ops.
    pub async fn fetch_history_page(&mut self) -> Result<usize, GatewayError> {
        let Session {
            conversation,
            reconciler,
            ..
        } = &mut self.session;
        self.paginator
            .fetch_next_page(self.gateway.as_ref(), &conversation.id, reconciler)
            .await
    }

    /// Submit user input and drive the turn to completion.
    pub async fn send(&mut self, text: impl Into<String>) -> Result<TurnReport, TurnError> {
        if self.session.phase() != TurnPhase::Idle {
            return Err(TurnError::Busy);
        }
        self.session.begin_turn();
        self.recency.touch(self.session.conversation.owner.clone());

        // Optimistic local append; the user sees their message immediately.
        let user_id = new_message_id();
        self.session
            .reconciler
            .upsert(Message::user(user_id.clone(), text, Utc::now()));
        self.session.turn_messages.push(user_id);

        let request_messages = self.session.reconciler.ordered_owned();
        let tools = self.registry.definitions();
        let mut events = self.stream.open(request_messages, tools);

        // The in-progress assistant message; deltas accumulate into it via
        // the reconciler so redeliveries converge on the same entry.
        let assistant_id = new_message_id();
        self.session
            .reconciler
            .upsert(Message::assistant(assistant_id.clone(), "", Utc::now()));
        self.session.turn_messages.push(assistant_id.clone());

        let mut report = TurnReport {
            assistant_message_id: assistant_id.clone(),
            executed_tools: 0,
            skipped_tool_calls: 0,
            stream_error: None,
        };
        let mut tools_in_flight: FuturesUnordered<ToolTask> = FuturesUnordered::new();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(StreamEvent::TextDelta(delta)) => {
                        self.session
                            .reconciler
                            .update(&assistant_id, |m| m.content.push_str(&delta));
                    }
                    Some(StreamEvent::ToolCall(call)) => {
                        self.handle_tool_call(&assistant_id, &call, &mut tools_in_flight, &mut report);
                    }
                    Some(StreamEvent::Done) => break,
                    Some(StreamEvent::Error(e)) => {
                        report.stream_error = Some(e);
                        break;
                    }
                    None => {
                        report.stream_error =
                            Some("Stream closed before completion".to_string());
                        break;
                    }
                },
                Some(result) = tools_in_flight.next(), if !tools_in_flight.is_empty() => {
                    self.attach_tool_result(&assistant_id, &result);
                }
            }
        }

        // Executions already started are not aborted by stream end or
        // stream failure; drain them so their results land on the message.
        while let Some(result) = tools_in_flight.next().await {
            self.attach_tool_result(&assistant_id, &result);
        }

        if let Some(error) = report.stream_error.clone() {
            self.fail_turn(&assistant_id, &error);
            return Ok(report);
        }

        self.session.phase = TurnPhase::Finishing;
        self.submit_turn_messages();
        self.session.finish_turn();
        Ok(report)
    }

    /// Resolve the armed pending action. Approved actions execute through
    /// the dispatcher's deferred path; the result is attached to the
    /// message that recorded the invocation and persisted.
    pub async fn resolve_pending(&mut self, approved: bool) -> Option<ToolResult> {
        let task =
            dispatch::resolve_pending(&mut self.session, &self.registry, &self.tool_ctx, approved)?;
        let result = task.await;

        if let Some(message_id) = self
            .session
            .reconciler
            .find_invocation_message(&result.tool_call_id)
        {
            self.session.reconciler.update(&message_id, |m| {
                if let Some(inv) = m.invocation_mut(&result.tool_call_id) {
                    inv.complete(&result);
                }
            });
            if let Some(message) = self.session.reconciler.get(&message_id).cloned() {
                self.submit_write(message);
            }
        }
        Some(result)
    }

    /// Await all outstanding persistence writes (tests, shutdown).
    pub async fn flush_writes(&mut self) {
        for handle in self.pending_writes.drain(..) {
            let _ = handle.await;
        }
    }

    fn handle_tool_call(
        &mut self,
        assistant_id: &MessageId,
        call: &ToolCall,
        tools_in_flight: &mut FuturesUnordered<ToolTask>,
        report: &mut TurnReport,
    ) {
        let outcome = dispatch::dispatch(
            &mut self.session,
            &self.registry,
            &self.tool_ctx,
            call,
            self.config.max_tool_calls_per_turn,
        );
        match outcome {
            Dispatch::Invoked(task) => {
                self.record_invocation(assistant_id, call);
                tools_in_flight.push(task);
                report.executed_tools += 1;
            }
            Dispatch::Deferred => {
                self.record_invocation(assistant_id, call);
            }
            Dispatch::Skipped(reason) => {
                if reason == SkipReason::Declarative {
                    self.record_invocation(assistant_id, call);
                }
                report.skipped_tool_calls += 1;
            }
        }
    }

    fn record_invocation(&mut self, assistant_id: &MessageId, call: &ToolCall) {
        self.session.reconciler.update(assistant_id, |m| {
            m.tool_invocations.push(ToolInvocation::from_call(call));
        });
    }

    fn attach_tool_result(&mut self, assistant_id: &MessageId, result: &ToolResult) {
        let attached = self.session.reconciler.update(assistant_id, |m| {
            if let Some(inv) = m.invocation_mut(&result.tool_call_id) {
                inv.complete(result);
            }
        });
        if !attached {
            tracing::warn!(
                call_id = %result.tool_call_id,
                "Tool result arrived for a message no longer in the buffer"
            );
        }
    }

    /// Error path: append a synthetic assistant message carrying the error
    /// and return to idle. Nothing from this turn is persisted and already
    /// executed tools are not rolled back.
    fn fail_turn(&mut self, assistant_id: &MessageId, error: &str) {
        let drop_placeholder = self
            .session
            .reconciler
            .get(assistant_id)
            .is_some_and(|m| m.content.is_empty() && m.tool_invocations.is_empty());
        if drop_placeholder {
            self.session.reconciler.remove(assistant_id);
        }

        tracing::error!(%error, "Model stream failed");
        self.session.reconciler.upsert(Message::assistant(
            new_message_id(),
            format_stream_error(&self.config.model, error),
            Utc::now(),
        ));
        self.session.finish_turn();
    }

    /// Submit every message produced this turn to the gateway,
    /// fire-and-forget relative to the caller.
    fn submit_turn_messages(&mut self) {
        for id in self.session.turn_messages.clone() {
            if let Some(message) = self.session.reconciler.get(&id).cloned() {
                self.submit_write(message);
            }
        }
    }

    fn submit_write(&mut self, message: Message) {
        let gateway = Arc::clone(&self.gateway);
        let conversation = self.session.conversation.id.clone();
        let notice_tx = self.notice_tx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = gateway.create_message(&conversation, &message).await {
                tracing::warn!(message_id = %message.id, %e, "Failed to persist message");
                let _ = notice_tx.send(format!("Message could not be saved: {e}"));
            }
        });
        self.pending_writes.push(handle);
    }
}

fn new_message_id() -> MessageId {
    MessageId::new(Uuid::new_v4().to_string())
}
