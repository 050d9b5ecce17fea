//! Status transitions that arrive out of band.
//!
//! Delivery and read signals may target a conversation that has not been
//! materialized yet. [`PendingUpdates`] holds them until it is, and
//! [`ReadReceiptSchedule`] holds simulated read receipts until they are due.

use std::collections::HashMap;

use clinichat_proto::message::{MessageKey, ParticipantId, Timestamp};

/// A single status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The channel accepted the identified message.
    Delivered(MessageKey),
    /// The identified message was read by its receiver.
    Read(MessageKey),
    /// Every message from the counterpart was read locally.
    ConversationRead,
}

/// Updates waiting for their conversation to exist, per counterpart.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdates {
    by_counterpart: HashMap<ParticipantId, Vec<StatusUpdate>>,
}

impl PendingUpdates {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `update` for `counterpart`, preserving arrival order.
    pub fn push(&mut self, counterpart: &ParticipantId, update: StatusUpdate) {
        self.by_counterpart
            .entry(counterpart.clone())
            .or_default()
            .push(update);
    }

    /// Removes and returns everything buffered for `counterpart`.
    pub fn take(&mut self, counterpart: &ParticipantId) -> Vec<StatusUpdate> {
        self.by_counterpart.remove(counterpart).unwrap_or_default()
    }

    /// Number of buffered updates for `counterpart`.
    #[must_use]
    pub fn pending_for(&self, counterpart: &ParticipantId) -> usize {
        self.by_counterpart.get(counterpart).map_or(0, Vec::len)
    }

    /// Total number of buffered updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_counterpart.values().map(Vec::len).sum()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_counterpart.is_empty()
    }
}

/// A simulated read receipt waiting for its due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledReceipt {
    /// When the receipt becomes effective.
    pub due: Timestamp,
    /// Conversation the message belongs to.
    pub counterpart: ParticipantId,
    /// The outbound message to mark read.
    pub key: MessageKey,
}

/// Simulated read receipts for outbound messages, ordered by due time.
#[derive(Debug, Clone, Default)]
pub struct ReadReceiptSchedule {
    queue: Vec<ScheduledReceipt>,
}

impl ReadReceiptSchedule {
    /// Creates an empty schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a receipt.
    pub fn schedule(&mut self, receipt: ScheduledReceipt) {
        let at = self.queue.partition_point(|r| r.due <= receipt.due);
        self.queue.insert(at, receipt);
    }

    /// Removes and returns every receipt due at or before `now`.
    pub fn due(&mut self, now: Timestamp) -> Vec<ScheduledReceipt> {
        let split = self.queue.partition_point(|r| r.due <= now);
        self.queue.drain(..split).collect()
    }

    /// Number of receipts not yet due.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no receipt is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
