//! Per-counterpart message logs for one universe.
//!
//! [`ConversationStore`] indexes a [`MessageLog`] by counterpart. Logs are
//! created lazily the first time a counterpart is referenced and are only
//! dropped together with the whole store.

pub mod log;

use std::collections::{BTreeMap, HashMap};

use clinichat_proto::message::{COALESCE_WINDOW_MS, Message, ParticipantId};

pub use self::log::{InsertOutcome, MessageLog};

/// All conversations of one identity in one universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStore {
    logs: HashMap<ParticipantId, MessageLog>,
    window_ms: u64,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(COALESCE_WINDOW_MS)
    }
}

impl ConversationStore {
    /// Creates an empty store using the given coalescing window.
    #[must_use]
    pub fn new(window_ms: u64) -> Self {
        Self {
            logs: HashMap::new(),
            window_ms,
        }
    }

    /// Rebuilds a store from persisted history.
    ///
    /// Each sequence is deduplicated on the way in; counterparts listed in
    /// `hydrated` are marked as already fetched.
    #[must_use]
    pub fn from_history(
        history: &BTreeMap<ParticipantId, Vec<Message>>,
        hydrated: &[ParticipantId],
        window_ms: u64,
    ) -> Self {
        let mut logs: HashMap<ParticipantId, MessageLog> = history
            .iter()
            .map(|(counterpart, messages)| {
                (
                    counterpart.clone(),
                    MessageLog::from_messages(messages, window_ms),
                )
            })
            .collect();
        for counterpart in hydrated {
            logs.entry(counterpart.clone()).or_default().set_hydrated();
        }
        Self { logs, window_ms }
    }

    /// The coalescing window in milliseconds.
    #[must_use]
    pub const fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// The log for `counterpart`, if it has been materialized.
    #[must_use]
    pub fn log(&self, counterpart: &ParticipantId) -> Option<&MessageLog> {
        self.logs.get(counterpart)
    }

    /// Mutable access to an existing log.
    pub fn log_mut(&mut self, counterpart: &ParticipantId) -> Option<&mut MessageLog> {
        self.logs.get_mut(counterpart)
    }

    /// Returns the log for `counterpart`, creating it if needed.
    ///
    /// The flag is `true` when the log did not exist before this call.
    pub fn materialize(&mut self, counterpart: &ParticipantId) -> (&mut MessageLog, bool) {
        let created = !self.logs.contains_key(counterpart);
        let log = self.logs.entry(counterpart.clone()).or_default();
        (log, created)
    }

    /// Whether `counterpart` has a log.
    #[must_use]
    pub fn contains(&self, counterpart: &ParticipantId) -> bool {
        self.logs.contains_key(counterpart)
    }

    /// Folds `msg` into the conversation with `counterpart`.
    pub fn insert(&mut self, counterpart: &ParticipantId, msg: Message) -> InsertOutcome {
        let window_ms = self.window_ms;
        self.materialize(counterpart).0.insert(msg, window_ms)
    }

    /// Merges fetched history into the conversation with `counterpart`.
    ///
    /// Returns how many messages the conversation gained.
    pub fn hydrate(&mut self, counterpart: &ParticipantId, history: &[Message]) -> usize {
        let window_ms = self.window_ms;
        self.materialize(counterpart).0.hydrate(history, window_ms)
    }

    /// Whether history for `counterpart` was already fetched.
    #[must_use]
    pub fn is_hydrated(&self, counterpart: &ParticipantId) -> bool {
        self.logs.get(counterpart).is_some_and(MessageLog::is_hydrated)
    }

    /// Unread messages from `counterpart`, zero for unknown counterparts.
    #[must_use]
    pub fn unread_from(&self, counterpart: &ParticipantId) -> usize {
        self.logs
            .get(counterpart)
            .map_or(0, |log| log.unread_from(counterpart))
    }

    /// Iterates over every materialized conversation.
    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &MessageLog)> {
        self.logs.iter()
    }

    /// Number of materialized conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    /// Whether no conversation has been materialized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Every conversation's messages, keyed by counterpart.
    #[must_use]
    pub fn to_history(&self) -> BTreeMap<ParticipantId, Vec<Message>> {
        self.logs
            .iter()
            .map(|(counterpart, log)| (counterpart.clone(), log.messages().to_vec()))
            .collect()
    }

    /// Counterparts whose history was fetched, sorted.
    #[must_use]
    pub fn hydrated_counterparts(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<ParticipantId> = self
            .logs
            .iter()
            .filter(|(_, log)| log.is_hydrated())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
