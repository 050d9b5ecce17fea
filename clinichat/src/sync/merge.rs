//! Pure deduplicating merge of message sequences.
//!
//! History fetched over REST and messages pushed live describe overlapping
//! sets of the same conversation. [`merge`] folds both into one canonical
//! sequence: sorted ascending by timestamp, with semantic duplicates
//! collapsed into a single instance.
//!
//! ## Coalescing rule
//!
//! Messages with equal sender, receiver and body whose timestamps differ by
//! less than the coalescing window are one message. Within each such group
//! the earliest instance is the *anchor*: it keeps its timestamp and absorbs
//! the richer status (`delivered`/`read` true wins) and the server id of
//! every later duplicate. A message further than the window from the current
//! anchor starts a new group, so surviving anchors of the same triple are
//! always at least one window apart. That spacing is what makes the merge
//! idempotent: running it on its own output finds nothing to collapse.
//!
//! The result depends only on the multiset of inputs, never on which side
//! a message arrived from, so `merge(a, b) == merge(b, a)`.

use std::cmp::Ordering;
use std::collections::HashMap;

use clinichat_proto::message::{COALESCE_WINDOW_MS, Message, ParticipantId};

/// Merges history and live messages with the default 1 s coalescing window.
#[must_use]
pub fn merge(history: &[Message], live: &[Message]) -> Vec<Message> {
    merge_with_window(history, live, COALESCE_WINDOW_MS)
}

/// Removes semantic duplicates from a single sequence.
///
/// Equivalent to `merge(messages, &[])`.
#[must_use]
pub fn dedup(messages: &[Message]) -> Vec<Message> {
    merge(messages, &[])
}

/// Merges two sequences with an explicit coalescing window in milliseconds.
#[must_use]
pub fn merge_with_window(history: &[Message], live: &[Message], window_ms: u64) -> Vec<Message> {
    let mut all: Vec<Message> = history.iter().chain(live).cloned().collect();
    all.sort_by(canonical_order);
    coalesce_sorted(all, window_ms)
}

/// Total order used for every canonical sequence.
///
/// Timestamp first; ties broken by content so the order never depends on
/// input order. Among exact duplicates the richer status sorts first.
pub(crate) fn canonical_order(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.sender_id.cmp(&b.sender_id))
        .then_with(|| a.receiver_id.cmp(&b.receiver_id))
        .then_with(|| a.body.cmp(&b.body))
        .then_with(|| b.status_rank().cmp(&a.status_rank()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Collapses duplicates in an already canonically sorted sequence.
fn coalesce_sorted(sorted: Vec<Message>, window_ms: u64) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(sorted.len());
    // Index in `out` of the latest anchor for each triple. Because input is
    // sorted by timestamp, only the latest anchor can be within the window.
    let mut anchors: HashMap<(ParticipantId, ParticipantId, String), usize> = HashMap::new();

    for msg in sorted {
        let triple = (
            msg.sender_id.clone(),
            msg.receiver_id.clone(),
            msg.body.clone(),
        );

        if let Some(&idx) = anchors.get(&triple)
            && out[idx].timestamp.abs_diff(msg.timestamp) < window_ms
        {
            out[idx].absorb(&msg);
            continue;
        }

        anchors.insert(triple, out.len());
        out.push(msg);
    }

    out
}
