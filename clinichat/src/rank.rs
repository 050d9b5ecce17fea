//! Ordering of the conversation list.
//!
//! [`rank`] is a pure function of its inputs: conversations with unread
//! messages come first, then more recent activity, then display name.
//! Every roster entry appears in the output even when it has no messages.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use clinichat_proto::api::RosterEntry;
use clinichat_proto::message::{Message, ParticipantId};

use crate::store::ConversationStore;

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The other party.
    pub counterpart_id: ParticipantId,
    /// Name shown for the other party.
    pub display_name: String,
    /// Messages from the other party not yet read.
    pub unread_count: usize,
    /// Most recent message in either direction.
    pub last_message: Option<Message>,
}

/// Builds the ordered conversation list.
///
/// Counterparts present in `store` but missing from `roster` are listed
/// under their id. Unread counts come from `unread`, falling back to the
/// store for counterparts the map does not cover.
#[must_use]
pub fn rank(
    roster: &[RosterEntry],
    store: &ConversationStore,
    unread: &HashMap<ParticipantId, usize>,
) -> Vec<ConversationSummary> {
    let mut seen: HashSet<&ParticipantId> = HashSet::new();
    let mut rows: Vec<ConversationSummary> = Vec::with_capacity(roster.len() + store.len());

    let from_roster = roster.iter().map(|e| (&e.id, e.display_name.as_str()));
    let from_store = store.iter().map(|(id, _)| (id, id.as_str()));

    for (id, name) in from_roster.chain(from_store) {
        if !seen.insert(id) {
            continue;
        }
        rows.push(ConversationSummary {
            counterpart_id: id.clone(),
            display_name: name.to_string(),
            unread_count: unread
                .get(id)
                .copied()
                .unwrap_or_else(|| store.unread_from(id)),
            last_message: store.log(id).and_then(|log| log.last()).cloned(),
        });
    }

    rows.sort_by(compare);
    rows
}

fn compare(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    let a_unread = a.unread_count > 0;
    let b_unread = b.unread_count > 0;
    b_unread
        .cmp(&a_unread)
        .then_with(|| match (&a.last_message, &b.last_message) {
            (Some(x), Some(y)) => y.timestamp.cmp(&x.timestamp),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.counterpart_id.cmp(&b.counterpart_id))
}
