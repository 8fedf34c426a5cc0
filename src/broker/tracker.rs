//! In-flight delivery tracking
//!
//! A message moves into the tracker at the moment it is handed to a consumer
//! and leaves it either on ACK or when the redelivery scan finds it older
//! than the ACK timeout. Timestamps are milliseconds since the UNIX epoch,
//! supplied by the caller so scans can be driven deterministically.

use std::collections::HashMap;
use std::time::Duration;

use crate::broker::message::Message;

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: Message,
    pub dispatched_at: i64,
}

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    pending: HashMap<String, PendingMessage>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `message` was dispatched at `now_ms`.
    pub fn track(&mut self, message: Message, now_ms: i64) {
        self.pending.insert(
            message.id.clone(),
            PendingMessage {
                message,
                dispatched_at: now_ms,
            },
        );
    }

    /// Remove a dispatched message. `None` for unknown or already removed ids.
    pub fn untrack(&mut self, message_id: &str) -> Option<Message> {
        self.pending.remove(message_id).map(|p| p.message)
    }

    /// Remove and return every entry dispatched more than `timeout` before
    /// `now_ms`, oldest dispatch first.
    pub fn scan_expired(&mut self, now_ms: i64, timeout: Duration) -> Vec<Message> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let expired_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.dispatched_at) > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired: Vec<PendingMessage> = expired_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        expired.sort_by_key(|p| p.dispatched_at);
        expired.into_iter().map(|p| p.message).collect()
    }

    pub fn get(&self, message_id: &str) -> Option<&PendingMessage> {
        self.pending.get(message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
