//! Bounded record of inbound messages already folded into a store.
//!
//! The push channel may redeliver a message after a reconnect. The ledger
//! remembers the keys of the most recent inbound messages so a redelivery
//! is recognised before it reaches the unread counter.

use std::collections::{HashSet, VecDeque};

use clinichat_proto::message::MessageKey;

/// Default number of keys retained.
pub const DEFAULT_LEDGER_CAPACITY: usize = 100;

/// FIFO-evicting set of encoded [`MessageKey`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedLedger {
    order: VecDeque<String>,
    index: HashSet<String>,
    capacity: usize,
}

impl Default for ProcessedLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl ProcessedLedger {
    /// Creates an empty ledger holding at most `capacity` keys.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            index: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Rebuilds a ledger from persisted entries, oldest first.
    ///
    /// Only the newest `capacity` entries are kept.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = String>, capacity: usize) -> Self {
        let mut ledger = Self::new(capacity);
        for entry in entries {
            ledger.record_encoded(entry);
        }
        ledger
    }

    /// Whether `key` has been processed recently.
    #[must_use]
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.index.contains(&key.encode())
    }

    /// Records `key` as processed. Returns `false` if it already was.
    pub fn record(&mut self, key: &MessageKey) -> bool {
        self.record_encoded(key.encode())
    }

    fn record_encoded(&mut self, encoded: String) -> bool {
        if self.index.contains(&encoded) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.index.remove(&evicted);
        }
        self.index.insert(encoded.clone());
        self.order.push_back(encoded);
        true
    }

    /// Encoded entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }

    /// Number of keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of keys held.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
