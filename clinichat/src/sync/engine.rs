//! The per-universe synchronization engine.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use clinichat_proto::api::RosterEntry;
use clinichat_proto::message::{DeliveryState, Message, ParticipantId, validate_body};
use clinichat_proto::push::InboundEvent;
use clinichat_proto::scope::Universe;

use super::ledger::ProcessedLedger;
use super::status::{PendingUpdates, ReadReceiptSchedule, ScheduledReceipt, StatusUpdate};
use super::{IngestOutcome, SyncConfig, SyncError, SyncEvent};
use crate::clock::{Clock, SystemClock};
use crate::gateway::Gateway;
use crate::persist::{Namespace, PersistedState, SessionPersistence};
use crate::rank::{ConversationSummary, rank};
use crate::store::{ConversationStore, InsertOutcome};

/// Keeps the conversations of one identity in one universe in sync.
///
/// Live events go through [`ingest`](Self::ingest), local sends through
/// [`record_outbound`](Self::record_outbound), and fetched history through
/// [`open_conversation`](Self::open_conversation). Every mutation ends with
/// a snapshot to session storage; a failing snapshot is logged and the
/// in-memory state stays authoritative.
pub struct ConversationSync<G, P, C = SystemClock> {
    me: ParticipantId,
    universe: Universe,
    gateway: G,
    persistence: P,
    clock: C,
    config: SyncConfig,
    store: ConversationStore,
    unread: HashMap<ParticipantId, usize>,
    ledger: ProcessedLedger,
    pending: PendingUpdates,
    receipts: ReadReceiptSchedule,
    roster: Vec<RosterEntry>,
    foreground: Option<ParticipantId>,
    events: broadcast::Sender<SyncEvent>,
}

impl<G: Gateway, P: SessionPersistence, C: Clock> ConversationSync<G, P, C> {
    /// Creates an empty engine. Call [`restore`](Self::restore) to pick up
    /// a previous session.
    pub fn new(
        me: ParticipantId,
        universe: Universe,
        gateway: G,
        persistence: P,
        clock: C,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            me,
            universe,
            gateway,
            persistence,
            clock,
            store: ConversationStore::new(config.coalesce_window_ms),
            unread: HashMap::new(),
            ledger: ProcessedLedger::new(config.ledger_capacity),
            pending: PendingUpdates::new(),
            receipts: ReadReceiptSchedule::new(),
            roster: Vec::new(),
            foreground: None,
            events,
            config,
        }
    }

    /// Storage namespace of this engine.
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.me.clone(), self.universe)
    }

    /// Reloads the persisted session of this identity and universe.
    ///
    /// Records of any other identity are purged first. Unread counters are
    /// recomputed from the restored messages rather than trusted.
    /// Returns the number of conversations restored.
    pub fn restore(&mut self) -> usize {
        match self.persistence.purge_except(&self.me) {
            Ok(0) => {}
            Ok(removed) => info!(identity = %self.me, removed, "purged foreign session records"),
            Err(err) => warn!(identity = %self.me, error = %err, "session purge failed"),
        }

        let namespace = self.namespace();
        let state = self.persistence.restore(&namespace);
        self.store = ConversationStore::from_history(
            &state.history,
            &state.hydrated,
            self.config.coalesce_window_ms,
        );
        self.ledger =
            ProcessedLedger::from_entries(state.processed_message_ledger, self.config.ledger_capacity);
        self.pending = PendingUpdates::new();
        self.receipts = ReadReceiptSchedule::new();
        self.foreground = None;

        self.unread = self
            .store
            .iter()
            .map(|(cp, log)| (cp.clone(), log.unread_from(cp)))
            .collect();
        for (cp, cached) in &state.unread_counts {
            let actual = self.unread.get(cp).copied().unwrap_or(0);
            if *cached != actual {
                debug!(counterpart = %cp, cached, actual, "stale cached unread count replaced");
            }
        }

        info!(
            namespace = %namespace,
            conversations = self.store.len(),
            ledger = self.ledger.len(),
            "session restored"
        );
        self.emit(SyncEvent::ConversationsChanged);
        self.store.len()
    }

    /// Records a message the local participant is about to send.
    ///
    /// The message enters the log in the `Sent` state; the caller reports
    /// channel acceptance with [`StatusUpdate::Delivered`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Invalid`] for an empty or oversized body and
    /// [`SyncError::WrongUniverse`] if `to` is not reachable from this
    /// engine.
    pub fn record_outbound(&mut self, to: &ParticipantId, body: &str) -> Result<Message, SyncError> {
        validate_body(body)?;
        self.check_universe(to)?;

        let msg = Message::new(self.me.clone(), to.clone(), body, self.clock.now());
        let outcome = self.insert(to, msg.clone());
        debug!(to = %to, ?outcome, "outbound message recorded");
        self.persist();
        Ok(msg)
    }

    /// Folds a live push event into the store.
    ///
    /// Malformed events, events addressed to someone else, and events from
    /// the other universe are discarded. An event already present in the
    /// processed ledger changes nothing.
    ///
    /// An event without a server timestamp is stamped with the local clock,
    /// so its ledger key is new on every redelivery. Such a redelivery is
    /// only collapsed when it lands within the coalescing window of the
    /// first copy; later ones are stored as a new message.
    pub fn ingest(&mut self, event: InboundEvent) -> IngestOutcome {
        let (Some(sender), Some(body)) = (event.sender_id, event.body) else {
            warn!(universe = %self.universe, "discarding inbound event without sender or body");
            return IngestOutcome::Malformed;
        };
        if sender.is_empty() || validate_body(&body).is_err() {
            warn!(sender = %sender, "discarding inbound event with invalid content");
            return IngestOutcome::Malformed;
        }

        let receiver = event.receiver_id.unwrap_or_else(|| self.me.clone());
        if sender == receiver || (sender != self.me && receiver != self.me) {
            warn!(sender = %sender, receiver = %receiver, "inbound event not addressed to us");
            return IngestOutcome::Foreign;
        }
        let counterpart = if sender == self.me {
            receiver.clone()
        } else {
            sender.clone()
        };
        if Universe::for_pair(&self.me, &counterpart) != self.universe {
            debug!(counterpart = %counterpart, universe = %self.universe, "inbound event for the other universe");
            return IngestOutcome::Foreign;
        }

        let timestamp = event.timestamp.unwrap_or_else(|| self.clock.now());
        let mut msg = Message::new(sender, receiver, body, timestamp);
        msg.delivered = true;
        if msg.sender_id != self.me && self.foreground.as_ref() == Some(&counterpart) {
            msg.read = true;
        }

        let key = msg.key();
        if self.ledger.contains(&key) {
            debug!(key = %key, "inbound event already processed");
            return IngestOutcome::Duplicate;
        }
        self.ledger.record(&key);

        let outcome = self.insert(&counterpart, msg);
        self.persist();
        match outcome {
            InsertOutcome::Added => IngestOutcome::Added,
            InsertOutcome::Merged => IngestOutcome::Merged,
            InsertOutcome::Unchanged => IngestOutcome::Duplicate,
        }
    }

    /// Marks every message from `counterpart` as read.
    ///
    /// Returns the number of messages that changed. Unknown counterparts
    /// are left alone.
    pub fn mark_as_read(&mut self, counterpart: &ParticipantId) -> usize {
        let Some(log) = self.store.log_mut(counterpart) else {
            return 0;
        };
        let marked = log.mark_read_from(counterpart);
        self.refresh_unread(counterpart);
        if marked > 0 {
            debug!(counterpart = %counterpart, marked, "conversation marked read");
            self.emit(SyncEvent::ConversationsChanged);
            self.persist();
        }
        marked
    }

    /// Applies a delivery or read update to a conversation.
    ///
    /// Updates for a conversation that does not exist yet are buffered and
    /// applied when it is first created. Returns whether anything changed.
    pub fn apply_status(&mut self, counterpart: &ParticipantId, update: StatusUpdate) -> bool {
        if !self.store.contains(counterpart) {
            debug!(counterpart = %counterpart, ?update, "buffering status update");
            self.pending.push(counterpart, update);
            return false;
        }
        let changed = self.apply_update(counterpart, update);
        if changed {
            self.emit(SyncEvent::ConversationsChanged);
            self.persist();
        }
        changed
    }

    /// Applies every simulated read receipt that has come due.
    ///
    /// Returns the number of messages marked read.
    pub fn tick(&mut self) -> usize {
        let due = self.receipts.due(self.clock.now());
        let mut applied = 0;
        for receipt in due {
            if self.apply_update(&receipt.counterpart, StatusUpdate::Read(receipt.key)) {
                applied += 1;
            }
        }
        if applied > 0 {
            self.emit(SyncEvent::ConversationsChanged);
            self.persist();
        }
        applied
    }

    /// Brings `counterpart` to the foreground.
    ///
    /// Fetches its history once per session, merges it with what is already
    /// held, and marks the conversation read locally and on the backend.
    /// Gateway failures are logged and leave the local state usable.
    pub async fn open_conversation(&mut self, counterpart: &ParticipantId) -> &[Message] {
        self.foreground = Some(counterpart.clone());
        self.materialize(counterpart);

        if !self.store.is_hydrated(counterpart) {
            match self.gateway.fetch_history(&self.me, counterpart).await {
                Ok(history) => {
                    self.hydrate_with(counterpart, history);
                }
                Err(err) => {
                    warn!(counterpart = %counterpart, error = %err, "history fetch failed, showing local messages only");
                }
            }
        }

        self.mark_as_read(counterpart);
        match self.gateway.mark_conversation_read(&self.me, counterpart).await {
            Ok(marked) => debug!(counterpart = %counterpart, marked, "backend marked conversation read"),
            Err(err) => warn!(counterpart = %counterpart, error = %err, "backend mark-read failed"),
        }
        self.messages(counterpart)
    }

    /// Sends the foreground conversation to the background.
    pub fn close_conversation(&mut self) -> Option<ParticipantId> {
        self.foreground.take()
    }

    /// Merges fetched history into a conversation and marks it hydrated.
    ///
    /// Messages that do not belong to the conversation are dropped.
    /// Returns the number of messages the conversation gained.
    pub fn hydrate_with(&mut self, counterpart: &ParticipantId, history: Vec<Message>) -> usize {
        let total = history.len();
        let relevant: Vec<Message> = history
            .into_iter()
            .filter(|m| {
                (m.sender_id == self.me && m.receiver_id == *counterpart)
                    || (m.sender_id == *counterpart && m.receiver_id == self.me)
            })
            .collect();
        if relevant.len() < total {
            warn!(
                counterpart = %counterpart,
                dropped = total - relevant.len(),
                "history contained messages of other conversations"
            );
        }

        self.materialize(counterpart);
        let added = self.store.hydrate(counterpart, &relevant);
        self.refresh_unread(counterpart);
        info!(counterpart = %counterpart, fetched = total, added, "history merged");
        self.emit(SyncEvent::HistoryLoaded {
            counterpart: counterpart.clone(),
            added,
        });
        self.emit(SyncEvent::ConversationsChanged);
        self.persist();
        added
    }

    /// Fetches the roster of this universe.
    ///
    /// Every listed counterpart gets a conversation. On failure the previous
    /// roster is kept.
    pub async fn refresh_roster(&mut self) -> &[RosterEntry] {
        match self.gateway.fetch_roster(self.universe, &self.me).await {
            Ok(entries) => {
                let entries: Vec<RosterEntry> = entries
                    .into_iter()
                    .filter(|e| {
                        e.id != self.me && Universe::for_pair(&self.me, &e.id) == self.universe
                    })
                    .collect();
                for entry in &entries {
                    self.materialize(&entry.id);
                }
                debug!(universe = %self.universe, entries = entries.len(), "roster refreshed");
                self.roster = entries;
                self.emit(SyncEvent::ConversationsChanged);
                self.persist();
            }
            Err(err) => {
                warn!(universe = %self.universe, error = %err, "roster fetch failed, keeping previous roster");
            }
        }
        &self.roster
    }

    /// Compares local unread counters with the backend's.
    ///
    /// A server count of zero marks the conversation read locally. Any other
    /// disagreement is logged and the local count stays. Returns the number
    /// of conversations corrected.
    pub async fn reconcile_unread(&mut self) -> usize {
        let counts = match self.gateway.fetch_unread_counts(&self.me).await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(error = %err, "unread count fetch failed");
                return 0;
            }
        };

        let mut corrected = 0;
        for (counterpart, server) in counts {
            if Universe::for_pair(&self.me, &counterpart) != self.universe {
                continue;
            }
            let local = self.unread_count(&counterpart);
            if server == 0 && local > 0 {
                self.mark_as_read(&counterpart);
                corrected += 1;
            } else if usize::try_from(server).ok() != Some(local) {
                debug!(counterpart = %counterpart, server, local, "unread counts disagree, keeping local");
            }
        }
        corrected
    }

    /// The ranked conversation list.
    #[must_use]
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        rank(&self.roster, &self.store, &self.unread)
    }

    /// Messages of one conversation in canonical order.
    #[must_use]
    pub fn messages(&self, counterpart: &ParticipantId) -> &[Message] {
        self.store
            .log(counterpart)
            .map_or(&[], |log| log.messages())
    }

    /// Unread counter of one conversation.
    #[must_use]
    pub fn unread_count(&self, counterpart: &ParticipantId) -> usize {
        self.unread.get(counterpart).copied().unwrap_or(0)
    }

    /// All unread counters.
    #[must_use]
    pub const fn unread_counts(&self) -> &HashMap<ParticipantId, usize> {
        &self.unread
    }

    /// The local participant.
    #[must_use]
    pub const fn me(&self) -> &ParticipantId {
        &self.me
    }

    /// The universe this engine serves.
    #[must_use]
    pub const fn universe(&self) -> Universe {
        self.universe
    }

    /// The conversation currently in the foreground.
    #[must_use]
    pub const fn foreground(&self) -> Option<&ParticipantId> {
        self.foreground.as_ref()
    }

    /// Last roster fetched.
    #[must_use]
    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    /// The message store.
    #[must_use]
    pub const fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// The processed-message ledger.
    #[must_use]
    pub const fn ledger(&self) -> &ProcessedLedger {
        &self.ledger
    }

    /// Status updates waiting for their conversation.
    #[must_use]
    pub const fn pending_updates(&self) -> &PendingUpdates {
        &self.pending
    }

    /// Read receipts not yet due.
    #[must_use]
    pub fn scheduled_receipts(&self) -> usize {
        self.receipts.len()
    }

    /// Subscribes to engine notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// The record [`restore`](Self::restore) would rebuild this state from.
    #[must_use]
    pub fn snapshot_state(&self) -> PersistedState {
        PersistedState {
            history: self.store.to_history(),
            unread_counts: self
                .unread
                .iter()
                .map(|(cp, n)| (cp.clone(), *n))
                .collect(),
            processed_message_ledger: self.ledger.entries(),
            hydrated: self.store.hydrated_counterparts(),
        }
    }

    fn check_universe(&self, counterpart: &ParticipantId) -> Result<(), SyncError> {
        if counterpart == &self.me || Universe::for_pair(&self.me, counterpart) != self.universe {
            return Err(SyncError::WrongUniverse {
                counterpart: counterpart.clone(),
                universe: self.universe,
            });
        }
        Ok(())
    }

    fn insert(&mut self, counterpart: &ParticipantId, msg: Message) -> InsertOutcome {
        let created = !self.store.contains(counterpart);
        let outcome = self.store.insert(counterpart, msg.clone());
        if created {
            self.flush_pending(counterpart);
        }
        if outcome.is_added() {
            self.emit(SyncEvent::MessageAdded {
                counterpart: counterpart.clone(),
                message: msg,
            });
        }
        self.refresh_unread(counterpart);
        if outcome.changed() || created {
            self.emit(SyncEvent::ConversationsChanged);
        }
        outcome
    }

    fn materialize(&mut self, counterpart: &ParticipantId) {
        let (_, created) = self.store.materialize(counterpart);
        if created {
            self.flush_pending(counterpart);
        }
        self.refresh_unread(counterpart);
    }

    fn flush_pending(&mut self, counterpart: &ParticipantId) {
        for update in self.pending.take(counterpart) {
            self.apply_update(counterpart, update);
        }
    }

    fn apply_update(&mut self, counterpart: &ParticipantId, update: StatusUpdate) -> bool {
        let window = self.store.window_ms();
        let Some(log) = self.store.log_mut(counterpart) else {
            return false;
        };
        let (changed, key) = match update {
            StatusUpdate::Delivered(key) => (log.mark_delivered(&key, window), Some(key)),
            StatusUpdate::Read(key) => (log.mark_read(&key, window), Some(key)),
            StatusUpdate::ConversationRead => (log.mark_read_from(counterpart) > 0, None),
        };
        if !changed {
            return false;
        }

        if let Some(key) = key {
            let state = log
                .find(&key, window)
                .map(|m| DeliveryState::of(m, &self.me));
            if let Some(state) = state {
                if state == DeliveryState::Delivered
                    && let Some(delay) = self.config.read_receipt_delay
                {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    self.receipts.schedule(ScheduledReceipt {
                        due: self.clock.now().saturating_add(delay_ms),
                        counterpart: counterpart.clone(),
                        key: key.clone(),
                    });
                }
                self.emit(SyncEvent::StatusChanged {
                    counterpart: counterpart.clone(),
                    key,
                    state,
                });
            }
        }
        self.refresh_unread(counterpart);
        true
    }

    fn refresh_unread(&mut self, counterpart: &ParticipantId) {
        let count = self.store.unread_from(counterpart);
        let previous = self.unread.insert(counterpart.clone(), count);
        if previous.unwrap_or(0) != count {
            self.emit(SyncEvent::UnreadChanged {
                counterpart: counterpart.clone(),
                unread: count,
            });
        }
    }

    fn persist(&self) {
        let namespace = self.namespace();
        if let Err(err) = self.persistence.snapshot(&namespace, &self.snapshot_state()) {
            warn!(namespace = %namespace, error = %err, "session snapshot failed");
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
