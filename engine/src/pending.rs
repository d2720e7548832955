//! Single-slot tracker for a tool call awaiting user confirmation.

use serde_json::Value;

/// A tool call whose side effect waits for explicit user confirmation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PendingAction {
    pub name: String,
    pub arguments: Value,
    pub tool_call_id: String,
}

/// At most one live pending action per session.
///
/// Setting overwrites any existing pending action - last write wins, no
/// queue and no history. Consumers read the current value and clear it
/// after resolving through the dispatcher's deferred path. If the user
/// never resolves it, the slot stays populated until overwritten or the
/// session ends.
#[derive(Debug, Default)]
pub struct PendingSlot {
    current: Option<PendingAction>,
}

impl PendingSlot {
    /// Arm the slot. Returns the displaced action when an unresolved one
    /// was overwritten, so callers can surface the supersede.
    pub fn set(&mut self, action: PendingAction) -> Option<PendingAction> {
        let displaced = self.current.replace(action);
        if let Some(displaced) = &displaced {
            tracing::warn!(
                tool = %displaced.name,
                "Pending action superseded before it was resolved"
            );
        }
        displaced
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    #[must_use]
    pub fn get(&self) -> Option<&PendingAction> {
        self.current.as_ref()
    }

    pub fn take(&mut self) -> Option<PendingAction> {
        self.current.take()
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.current.is_some()
    }
}
