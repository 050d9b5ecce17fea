//! REST collaborator DTOs and route layout.
//!
//! History, roster, unread-count and mark-read endpoints all speak JSON.
//! Participant ids are used verbatim as path segments, so they are expected
//! to be URL-safe slugs (guest ids always are).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::ParticipantId;
use crate::scope::Universe;

/// One counterpart the local participant may talk to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Counterpart identifier.
    pub id: ParticipantId,
    /// Human-readable name shown in the conversation list.
    pub display_name: String,
}

impl RosterEntry {
    /// Creates a roster entry.
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Server-side unread counters, keyed by counterpart.
pub type UnreadCounts = BTreeMap<ParticipantId, u32>;

/// Response body of the mark-conversation-read endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    /// Number of messages that changed from unread to read.
    pub marked: u32,
}

/// `GET`: prior messages between `self_id` and `counterpart`, oldest first.
#[must_use]
pub fn history_path(self_id: &ParticipantId, counterpart: &ParticipantId) -> String {
    format!("/api/history/{self_id}/{counterpart}")
}

/// `GET`: counterparts of `self_id` within `universe`.
#[must_use]
pub fn roster_path(universe: Universe, self_id: &ParticipantId) -> String {
    format!("/api/roster/{universe}/{self_id}")
}

/// `GET`: unread counters of `self_id`.
#[must_use]
pub fn unread_path(self_id: &ParticipantId) -> String {
    format!("/api/unread/{self_id}")
}

/// `POST`: mark every message from `counterpart` to `self_id` as read.
#[must_use]
pub fn mark_read_path(self_id: &ParticipantId, counterpart: &ParticipantId) -> String {
    format!("/api/read/{self_id}/{counterpart}")
}
