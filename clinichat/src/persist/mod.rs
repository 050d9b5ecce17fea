//! Session-scoped mirror of the synchronization state.
//!
//! Defines the [`SessionPersistence`] port plus two adapters:
//! - [`memory::MemoryPersistence`] keeps serialized records in process
//!   memory (tests, ephemeral sessions)
//! - [`file::FilePersistence`] writes one JSON file per namespace
//!
//! Records are keyed by a [`Namespace`] of `(identity, universe)`. Data under
//! one identity's namespace is never read on behalf of another.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use clinichat_proto::message::{Message, ParticipantId};
use clinichat_proto::scope::Universe;

/// Errors that can occur while reading or writing session storage.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The storage backend refused the operation.
    #[error("session storage unavailable: {0}")]
    Unavailable(String),

    /// A filesystem operation failed.
    #[error("session storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be serialized or deserialized.
    #[error("session record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage key of one `(identity, universe)` record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The signed-in participant owning the record.
    pub identity: ParticipantId,
    /// The conversation universe the record belongs to.
    pub universe: Universe,
}

impl Namespace {
    /// Creates a namespace.
    #[must_use]
    pub const fn new(identity: ParticipantId, universe: Universe) -> Self {
        Self { identity, universe }
    }

    /// Flat key form, `<identity>.<universe>`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.identity, self.universe)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// The serialized record stored per namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    /// Messages per counterpart, canonical order.
    #[serde(default)]
    pub history: BTreeMap<ParticipantId, Vec<Message>>,
    /// Cached unread counters per counterpart.
    #[serde(default)]
    pub unread_counts: BTreeMap<ParticipantId, usize>,
    /// Encoded ledger keys, oldest first.
    #[serde(default)]
    pub processed_message_ledger: Vec<String>,
    /// Counterparts whose history was already fetched this session.
    #[serde(default)]
    pub hydrated: Vec<ParticipantId>,
}

/// Port for session-scoped storage of [`PersistedState`] records.
pub trait SessionPersistence: Send + Sync {
    /// Writes `state` under `namespace`, replacing any previous record.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the record cannot be serialized or stored.
    fn snapshot(&self, namespace: &Namespace, state: &PersistedState) -> Result<(), PersistError>;

    /// Reads the record under `namespace`, `None` when nothing is stored.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the record exists but cannot be read or
    /// deserialized.
    fn load(&self, namespace: &Namespace) -> Result<Option<PersistedState>, PersistError>;

    /// Deletes every record not owned by `identity`.
    ///
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError`] if the storage cannot be enumerated.
    fn purge_except(&self, identity: &ParticipantId) -> Result<usize, PersistError>;

    /// Reads the record under `namespace`, falling back to an empty state.
    ///
    /// Missing and unreadable records both yield the default; the latter is
    /// logged.
    fn restore(&self, namespace: &Namespace) -> PersistedState {
        match self.load(namespace) {
            Ok(Some(state)) => state,
            Ok(None) => PersistedState::default(),
            Err(err) => {
                tracing::warn!(
                    namespace = %namespace,
                    error = %err,
                    "session record unreadable, starting empty"
                );
                PersistedState::default()
            }
        }
    }
}

impl<P: SessionPersistence + ?Sized> SessionPersistence for std::sync::Arc<P> {
    fn snapshot(&self, namespace: &Namespace, state: &PersistedState) -> Result<(), PersistError> {
        (**self).snapshot(namespace, state)
    }

    fn load(&self, namespace: &Namespace) -> Result<Option<PersistedState>, PersistError> {
        (**self).load(namespace)
    }

    fn purge_except(&self, identity: &ParticipantId) -> Result<usize, PersistError> {
        (**self).purge_except(identity)
    }
}
