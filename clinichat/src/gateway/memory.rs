//! Scripted in-memory [`Gateway`] for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use clinichat_proto::api::{RosterEntry, UnreadCounts};
use clinichat_proto::message::{Message, ParticipantId};
use clinichat_proto::scope::Universe;

use super::{Gateway, GatewayError};

#[derive(Debug, Default)]
struct Responses {
    history: HashMap<(ParticipantId, ParticipantId), Vec<Message>>,
    roster: HashMap<(Universe, ParticipantId), Vec<RosterEntry>>,
    unread: HashMap<ParticipantId, UnreadCounts>,
    marked_read: Vec<(ParticipantId, ParticipantId)>,
}

/// [`Gateway`] answering from preloaded data.
///
/// Unknown keys answer with empty results. When failing, every call returns
/// [`GatewayError::Unavailable`].
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    responses: Mutex<Responses>,
    failing: AtomicBool,
    history_calls: AtomicUsize,
}

impl InMemoryGateway {
    /// Creates a gateway with no data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the history returned for `(self_id, counterpart)`.
    pub fn set_history(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
        messages: Vec<Message>,
    ) {
        self.responses
            .lock()
            .history
            .insert((self_id.clone(), counterpart.clone()), messages);
    }

    /// Sets the roster returned for `self_id` in `universe`.
    pub fn set_roster(&self, universe: Universe, self_id: &ParticipantId, roster: Vec<RosterEntry>) {
        self.responses
            .lock()
            .roster
            .insert((universe, self_id.clone()), roster);
    }

    /// Sets the unread counters returned for `self_id`.
    pub fn set_unread(&self, self_id: &ParticipantId, counts: UnreadCounts) {
        self.responses.lock().unread.insert(self_id.clone(), counts);
    }

    /// Makes every call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// How many history fetches were attempted.
    #[must_use]
    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    /// Conversations the backend was told were read, in call order.
    #[must_use]
    pub fn marked_read(&self) -> Vec<(ParticipantId, ParticipantId)> {
        self.responses.lock().marked_read.clone()
    }

    fn check(&self) -> Result<(), GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(GatewayError::Unavailable("backend offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Gateway for InMemoryGateway {
    async fn fetch_history(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> Result<Vec<Message>, GatewayError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .responses
            .lock()
            .history
            .get(&(self_id.clone(), counterpart.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_roster(
        &self,
        universe: Universe,
        self_id: &ParticipantId,
    ) -> Result<Vec<RosterEntry>, GatewayError> {
        self.check()?;
        Ok(self
            .responses
            .lock()
            .roster
            .get(&(universe, self_id.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_unread_counts(
        &self,
        self_id: &ParticipantId,
    ) -> Result<UnreadCounts, GatewayError> {
        self.check()?;
        Ok(self
            .responses
            .lock()
            .unread
            .get(self_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_conversation_read(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> Result<u32, GatewayError> {
        self.check()?;
        let mut responses = self.responses.lock();
        responses
            .marked_read
            .push((self_id.clone(), counterpart.clone()));
        let counts = responses.unread.entry(self_id.clone()).or_default();
        Ok(counts.remove(counterpart).unwrap_or(0))
    }
}
