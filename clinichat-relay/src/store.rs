//! In-memory message archive.
//!
//! The [`MessageArchive`] keeps every routed message per conversation pair,
//! whether or not the recipient was connected. It answers history, roster
//! and unread queries and records read marks.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use clinichat_proto::api::UnreadCounts;
use clinichat_proto::message::{Message, ParticipantId, Timestamp};
use tokio::sync::RwLock;

/// Default maximum number of archived messages per conversation before
/// FIFO eviction.
pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Unordered pair of participants, stored smaller id first.
type PairKey = (ParticipantId, ParticipantId);

fn pair_key(a: &ParticipantId, b: &ParticipantId) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Per-conversation message archive with FIFO eviction.
///
/// Thread-safe via [`RwLock`]. Archived messages carry a server id and are
/// marked delivered: the backend accepted them.
pub struct MessageArchive {
    conversations: RwLock<HashMap<PairKey, Vec<Message>>>,
    next_id: AtomicU64,
    max_history: usize,
}

impl Default for MessageArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageArchive {
    /// Creates an empty archive with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty archive keeping at most `max_history` messages per
    /// conversation.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_history,
        }
    }

    /// Archives a message from `from` to `to`, returning the stored copy.
    pub async fn append(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        body: &str,
        timestamp: Timestamp,
    ) -> Message {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = Message::new(from.clone(), to.clone(), body, timestamp);
        message.delivered = true;
        message.id = Some(format!("m-{id}"));

        let mut conversations = self.conversations.write().await;
        let log = conversations.entry(pair_key(from, to)).or_default();
        log.push(message.clone());
        if log.len() > self.max_history {
            let overflow = log.len() - self.max_history;
            log.drain(..overflow);
        }
        drop(conversations);
        message
    }

    /// All archived messages between `a` and `b`, oldest first.
    pub async fn history(&self, a: &ParticipantId, b: &ParticipantId) -> Vec<Message> {
        let conversations = self.conversations.read().await;
        conversations
            .get(&pair_key(a, b))
            .cloned()
            .unwrap_or_default()
    }

    /// Every participant `me` has exchanged at least one message with.
    pub async fn counterparts(&self, me: &ParticipantId) -> BTreeSet<ParticipantId> {
        let conversations = self.conversations.read().await;
        conversations
            .keys()
            .filter_map(|(a, b)| {
                if a == me {
                    Some(b.clone())
                } else if b == me {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Number of unread messages addressed to `me`, per sender.
    ///
    /// Senders with nothing unread are omitted.
    pub async fn unread_counts(&self, me: &ParticipantId) -> UnreadCounts {
        let conversations = self.conversations.read().await;
        let mut counts = UnreadCounts::new();
        for message in conversations.values().flatten() {
            if &message.receiver_id == me && !message.read {
                *counts.entry(message.sender_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Marks every message from `counterpart` to `me` as read, returning the
    /// number of messages that changed.
    pub async fn mark_read(&self, me: &ParticipantId, counterpart: &ParticipantId) -> u32 {
        let mut conversations = self.conversations.write().await;
        let Some(log) = conversations.get_mut(&pair_key(me, counterpart)) else {
            return 0;
        };
        let marked = log
            .iter_mut()
            .filter(|m| &m.receiver_id == me && &m.sender_id == counterpart)
            .map(Message::mark_read)
            .filter(|changed| *changed)
            .count();
        drop(conversations);
        u32::try_from(marked).unwrap_or(u32::MAX)
    }
}
