//! Per-session orchestration state.

use std::collections::HashSet;

use tether_types::{Conversation, MessageId};

use crate::pending::PendingSlot;
use crate::reconcile::Reconciler;

/// Turn lifecycle: `Idle -> Streaming -> Finishing -> Idle`.
///
/// Errors are terminal per turn and return to `Idle`; the session always
/// accepts new input afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    Finishing,
}

/// One active conversation's in-memory orchestration state.
///
/// The dedup sets and the pending slot are explicit per-session fields
/// rather than ambient state, so their scope is exactly one conversation
/// and they can be tested in isolation.
#[derive(Debug)]
pub struct Session {
    pub conversation: Conversation,
    pub(crate) phase: TurnPhase,
    /// Tool names invoked this session. First call wins for tools that are
    /// not repeatable; the set survives across turns.
    pub(crate) invoked_tools: HashSet<String>,
    /// Call ids invoked this session (repeatable tools dedup per call).
    pub(crate) invoked_call_ids: HashSet<String>,
    /// Confirmation slot; persists across turns until resolved.
    pub pending: PendingSlot,
    /// Live identity-keyed message buffer.
    pub reconciler: Reconciler,
    /// Messages produced in the current turn, submitted for persistence
    /// when the turn finishes. Cleared per turn.
    pub(crate) turn_messages: Vec<MessageId>,
    /// Tool calls accepted this turn (cap enforcement).
    pub(crate) turn_tool_calls: usize,
}

impl Session {
    #[must_use]
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            phase: TurnPhase::Idle,
            invoked_tools: HashSet::new(),
            invoked_call_ids: HashSet::new(),
            pending: PendingSlot::default(),
            reconciler: Reconciler::default(),
            turn_messages: Vec::new(),
            turn_tool_calls: 0,
        }
    }

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// Whether `tool_name` has already produced an execution this session.
    #[must_use]
    pub fn was_invoked(&self, tool_name: &str) -> bool {
        self.invoked_tools.contains(tool_name)
    }

    pub(crate) fn begin_turn(&mut self) {
        self.phase = TurnPhase::Streaming;
        self.turn_messages.clear();
        self.turn_tool_calls = 0;
    }

    /// Clear per-turn bookkeeping. The dedup sets and the pending slot are
    /// session-scoped and survive.
    pub(crate) fn finish_turn(&mut self) {
        self.phase = TurnPhase::Idle;
        self.turn_messages.clear();
    }
}
