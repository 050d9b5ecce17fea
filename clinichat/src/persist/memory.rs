//! In-process session storage.
//!
//! Records are held as serialized JSON strings, so a snapshot/restore cycle
//! goes through the same encoding as the on-disk adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use clinichat_proto::message::ParticipantId;

use super::{Namespace, PersistError, PersistedState, SessionPersistence};

/// [`SessionPersistence`] backed by a `HashMap`.
///
/// Can be switched into a failing mode to exercise storage-full paths.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    records: Mutex<HashMap<Namespace, String>>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Raw serialized record under `namespace`.
    #[must_use]
    pub fn raw(&self, namespace: &Namespace) -> Option<String> {
        self.records.lock().get(namespace).cloned()
    }

    /// Stores a raw record, bypassing serialization.
    pub fn put_raw(&self, namespace: Namespace, raw: impl Into<String>) {
        self.records.lock().insert(namespace, raw.into());
    }

    /// Sorted keys of every stored record.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().keys().map(Namespace::key).collect();
        keys.sort();
        keys
    }
}

impl SessionPersistence for MemoryPersistence {
    fn snapshot(&self, namespace: &Namespace, state: &PersistedState) -> Result<(), PersistError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Unavailable("quota exceeded".to_string()));
        }
        let raw = serde_json::to_string(state)?;
        self.records.lock().insert(namespace.clone(), raw);
        Ok(())
    }

    fn load(&self, namespace: &Namespace) -> Result<Option<PersistedState>, PersistError> {
        let Some(raw) = self.raw(namespace) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn purge_except(&self, identity: &ParticipantId) -> Result<usize, PersistError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|ns, _| ns.identity == *identity);
        Ok(before - records.len())
    }
}
