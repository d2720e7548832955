//! Message reconciliation: merging live and persisted messages into one
//! gap-free, duplicate-free, chronologically ordered sequence.

use std::collections::HashMap;

use tether_types::{ConversationId, Message, MessageId};

use crate::gateway::{Cursor, GatewayError, MessageGateway};

#[derive(Debug, Clone)]
struct Slot {
    message: Message,
    /// First-arrival sequence number; the stable tie-break for equal
    /// timestamps. Redelivery of an id keeps its original position.
    arrival: u64,
}

/// Identity-keyed merge of message batches.
///
/// Each upsert is last-write-wins per id, and the displayed order is
/// derived by sorting on `(created_at, first arrival)`. That makes the
/// merge idempotent and delivery-order independent: redelivering a page,
/// or receiving the live copy of a message before its persisted
/// counterpart (or vice versa), converges to the same sequence.
#[derive(Debug, Default)]
pub struct Reconciler {
    slots: HashMap<MessageId, Slot>,
    next_arrival: u64,
}

impl Reconciler {
    /// Insert or replace the message with this id.
    pub fn upsert(&mut self, message: Message) {
        match self.slots.get_mut(&message.id) {
            Some(slot) => slot.message = message,
            None => {
                let arrival = self.next_arrival;
                self.next_arrival += 1;
                self.slots
                    .insert(message.id.clone(), Slot { message, arrival });
            }
        }
    }

    /// Merge a batch (a fetched page or a burst of live appends).
    pub fn merge(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.upsert(message);
        }
    }

    /// Edit a buffered message in place (streaming deltas, attaching
    /// results). Returns false when the id is unknown.
    pub fn update<F: FnOnce(&mut Message)>(&mut self, id: &MessageId, edit: F) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) => {
                edit(&mut slot.message);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        self.slots.remove(id).map(|slot| slot.message)
    }

    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.slots.get(id).map(|slot| &slot.message)
    }

    /// The message currently carrying the invocation for `tool_call_id`.
    #[must_use]
    pub fn find_invocation_message(&self, tool_call_id: &str) -> Option<MessageId> {
        self.slots
            .values()
            .find(|slot| {
                slot.message
                    .tool_invocations
                    .iter()
                    .any(|inv| inv.tool_call_id == tool_call_id)
            })
            .map(|slot| slot.message.id.clone())
    }

    /// The displayed sequence: `created_at` ascending, ties broken by
    /// first arrival.
    #[must_use]
    pub fn ordered(&self) -> Vec<&Message> {
        let mut slots: Vec<&Slot> = self.slots.values().collect();
        slots.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then(a.arrival.cmp(&b.arrival))
        });
        slots.into_iter().map(|slot| &slot.message).collect()
    }

    #[must_use]
    pub fn ordered_owned(&self) -> Vec<Message> {
        self.ordered().into_iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Drives cursor pagination of persisted history.
///
/// Fetching is suppressed while a fetch is already in flight, so
/// scroll-driven signals can fire as often as they like without issuing
/// overlapping page requests for the same conversation.
#[derive(Debug)]
pub struct HistoryPaginator {
    cursor: Option<Cursor>,
    has_more: bool,
    in_flight: bool,
    page_size: usize,
}

impl HistoryPaginator {
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            cursor: None,
            has_more: true,
            in_flight: false,
            page_size: page_size.max(1),
        }
    }

    /// Whether another (older) page can be requested right now.
    #[must_use]
    pub fn has_next_page(&self) -> bool {
        self.has_more && !self.in_flight
    }

    /// Fetch the next older page and merge it into the reconciler.
    ///
    /// No-op returning `Ok(0)` when history is exhausted or a fetch is
    /// already in flight. Returns the number of messages merged.
    pub async fn fetch_next_page(
        &mut self,
        gateway: &dyn MessageGateway,
        conversation: &ConversationId,
        reconciler: &mut Reconciler,
    ) -> Result<usize, GatewayError> {
        if !self.has_next_page() {
            return Ok(0);
        }

        self.in_flight = true;
        let result = gateway
            .list_messages(conversation, self.cursor.clone(), self.page_size)
            .await;
        self.in_flight = false;

        let page = result?;
        self.cursor = page.next_cursor;
        self.has_more = page.has_more && self.cursor.is_some();

        let merged = page.messages.len();
        reconciler.merge(page.messages);
        Ok(merged)
    }
}
