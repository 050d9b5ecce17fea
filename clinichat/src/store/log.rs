//! A single conversation's canonical message sequence.

use std::ops::Range;

use clinichat_proto::message::{Message, MessageKey, ParticipantId, Timestamp};

use crate::sync::merge::{canonical_order, merge_with_window};

/// What [`MessageLog::insert`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The message was new and now occupies its own slot.
    Added,
    /// The message duplicated an existing one and enriched it.
    Merged,
    /// The message duplicated an existing one and changed nothing.
    Unchanged,
}

impl InsertOutcome {
    /// Whether a new message entered the log.
    #[must_use]
    pub const fn is_added(self) -> bool {
        matches!(self, Self::Added)
    }

    /// Whether the log changed at all.
    #[must_use]
    pub const fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Canonically ordered, duplicate-free messages with one counterpart.
///
/// The sequence always equals `dedup` of everything folded in since the log
/// was built, whatever order it arrived in. Every instance is kept next to
/// the canonical view, because a late arrival can move the anchor of its
/// group and split off members the old anchor had absorbed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageLog {
    messages: Vec<Message>,
    instances: Vec<Message>,
    hydrated: bool,
}

impl MessageLog {
    /// Creates an empty, unhydrated log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from arbitrary messages, collapsing duplicates.
    #[must_use]
    pub fn from_messages(messages: &[Message], window_ms: u64) -> Self {
        let mut instances = messages.to_vec();
        instances.sort_by(canonical_order);
        instances.dedup();
        Self {
            messages: merge_with_window(&instances, &[], window_ms),
            instances,
            hydrated: false,
        }
    }

    /// Folds one message into the log.
    ///
    /// Only messages with the same sender, receiver and body are regrouped.
    /// A message that lands before an existing anchor becomes the new anchor,
    /// and later instances outside its window start groups of their own.
    pub fn insert(&mut self, msg: Message, window_ms: u64) -> InsertOutcome {
        let before: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| same_content(m, &msg))
            .cloned()
            .collect();

        if !self.record_instance(&msg) {
            return InsertOutcome::Unchanged;
        }
        let group: Vec<Message> = self
            .instances
            .iter()
            .filter(|m| same_content(m, &msg))
            .cloned()
            .collect();
        let after = merge_with_window(&group, &[], window_ms);

        let outcome = if after.len() > before.len() {
            InsertOutcome::Added
        } else if after == before {
            return InsertOutcome::Unchanged;
        } else {
            InsertOutcome::Merged
        };

        self.messages.retain(|m| !same_content(m, &msg));
        for anchor in after {
            let at = self
                .messages
                .partition_point(|m| canonical_order(m, &anchor).is_lt());
            self.messages.insert(at, anchor);
        }
        outcome
    }

    /// Merges a fetched history into the log and marks it hydrated.
    ///
    /// Returns how many messages the log gained.
    pub fn hydrate(&mut self, history: &[Message], window_ms: u64) -> usize {
        let before = self.messages.len();
        for msg in history {
            self.record_instance(msg);
        }
        self.messages = merge_with_window(&self.instances, &[], window_ms);
        self.hydrated = true;
        self.messages.len().saturating_sub(before)
    }

    /// The canonical sequence, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent message.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether history has been fetched into this log this session.
    #[must_use]
    pub const fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Records that history has been fetched.
    pub const fn set_hydrated(&mut self) {
        self.hydrated = true;
    }

    /// Messages written by `counterpart` that have not been read.
    #[must_use]
    pub fn unread_from(&self, counterpart: &ParticipantId) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender_id == *counterpart && !m.read)
            .count()
    }

    /// Marks every message written by `counterpart` as read.
    ///
    /// Returns how many messages changed.
    pub fn mark_read_from(&mut self, counterpart: &ParticipantId) -> usize {
        for instance in self.instances.iter_mut().filter(|m| m.sender_id == *counterpart) {
            instance.mark_read();
        }
        self.messages
            .iter_mut()
            .filter(|m| m.sender_id == *counterpart)
            .map(Message::mark_read)
            .filter(|changed| *changed)
            .count()
    }

    /// Marks the message identified by `key` as delivered.
    ///
    /// Returns `false` when no such message exists or it already was.
    pub fn mark_delivered(&mut self, key: &MessageKey, window_ms: u64) -> bool {
        self.update_by_key(key, window_ms, Message::mark_delivered)
    }

    /// Marks the message identified by `key` as read.
    pub fn mark_read(&mut self, key: &MessageKey, window_ms: u64) -> bool {
        self.update_by_key(key, window_ms, Message::mark_read)
    }

    /// Looks up the message `key` refers to.
    #[must_use]
    pub fn find(&self, key: &MessageKey, window_ms: u64) -> Option<&Message> {
        let range = self.window_range(key.timestamp, window_ms);
        self.messages[range]
            .iter()
            .find(|m| key_matches(m, key, window_ms))
    }

    /// Applies `update` to the anchor `key` refers to and to every instance
    /// of its group.
    fn update_by_key(
        &mut self,
        key: &MessageKey,
        window_ms: u64,
        update: fn(&mut Message) -> bool,
    ) -> bool {
        let range = self.window_range(key.timestamp, window_ms);
        let Some(anchor) = self.messages[range]
            .iter_mut()
            .find(|m| key_matches(m, key, window_ms))
        else {
            return false;
        };
        let changed = update(anchor);
        let anchor = anchor.clone();
        for member in self.instances.iter_mut().filter(|m| {
            same_content(m, &anchor)
                && m.timestamp >= anchor.timestamp
                && m.timestamp.abs_diff(anchor.timestamp) < window_ms
        }) {
            update(member);
        }
        changed
    }

    /// Adds `msg` to the instances in canonical position.
    ///
    /// Returns `false` when an identical instance is already present.
    fn record_instance(&mut self, msg: &Message) -> bool {
        let at = self
            .instances
            .partition_point(|m| canonical_order(m, msg).is_lt());
        if self.instances.get(at) == Some(msg) {
            return false;
        }
        self.instances.insert(at, msg.clone());
        true
    }

    /// Index range of messages strictly closer than the window to `ts`.
    fn window_range(&self, ts: Timestamp, window_ms: u64) -> Range<usize> {
        let start = self
            .messages
            .partition_point(|m| m.timestamp < ts && m.timestamp.abs_diff(ts) >= window_ms);
        let end = self
            .messages
            .partition_point(|m| m.timestamp <= ts || m.timestamp.abs_diff(ts) < window_ms);
        start..end
    }
}

fn same_content(a: &Message, b: &Message) -> bool {
    a.sender_id == b.sender_id && a.receiver_id == b.receiver_id && a.body == b.body
}

fn key_matches(m: &Message, key: &MessageKey, window_ms: u64) -> bool {
    m.sender_id == key.sender_id
        && m.receiver_id == key.receiver_id
        && m.body == key.body
        && m.timestamp.abs_diff(key.timestamp) < window_ms
}
