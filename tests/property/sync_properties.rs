#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests of the merge pipeline and session persistence.
//!
//! Uses proptest to verify:
//! 1. Merging is idempotent and independent of which side a message came from.
//! 2. Merging with nothing equals deduplication.
//! 3. Near-duplicates collapse and never lose status.
//! 4. Folding messages into a log one at a time, in any order, equals
//!    deduplicating them in one pass.
//! 5. Replaying any inbound event leaves unread counters unchanged.
//! 6. A session snapshot survives a restore unchanged.

use std::collections::BTreeSet;
use std::sync::Arc;

use clinichat::clock::ManualClock;
use clinichat::gateway::memory::InMemoryGateway;
use clinichat::persist::memory::MemoryPersistence;
use clinichat::store::MessageLog;
use clinichat::sync::{ConversationSync, IngestOutcome, SyncConfig, dedup, merge};
use clinichat_proto::message::{COALESCE_WINDOW_MS, Message, ParticipantId, Timestamp};
use clinichat_proto::push::InboundEvent;
use clinichat_proto::scope::Universe;
use proptest::prelude::*;

const ME: &str = "dr-me";

/// Counterparts drawn from a small pool so that collisions are common.
fn arb_counterpart() -> impl Strategy<Value = ParticipantId> {
    prop_oneof![
        Just(ParticipantId::new("dr-a")),
        Just(ParticipantId::new("dr-b")),
        Just(ParticipantId::new("dr-c")),
    ]
}

/// Messages of one conversation pair with small bodies and clustered
/// timestamps, in either direction.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        any::<bool>(),
        prop_oneof![Just("hi"), Just("ok"), Just("see you")],
        0u64..5_000,
        any::<bool>(),
        any::<bool>(),
        proptest::option::of("[a-z0-9]{4}"),
    )
        .prop_map(|(outbound, body, ts, delivered, read, id)| {
            let (me, other) = (ParticipantId::new(ME), ParticipantId::new("dr-a"));
            let (from, to) = if outbound { (me, other) } else { (other, me) };
            let mut msg = Message::new(from, to, body, Timestamp::from_millis(ts));
            msg.delivered = delivered;
            msg.read = read;
            msg.id = id;
            msg
        })
}

fn arb_messages() -> impl Strategy<Value = Vec<Message>> {
    proptest::collection::vec(arb_message(), 0..24)
}

/// Inbound events addressed to `ME` from the counterpart pool.
fn arb_inbound() -> impl Strategy<Value = Vec<InboundEvent>> {
    proptest::collection::vec(
        (
            arb_counterpart(),
            prop_oneof![Just("hello"), Just("x-ray?"), Just("thanks")],
            0u64..10_000,
        )
            .prop_map(|(from, body, ts)| {
                InboundEvent::new(from, body)
                    .to(ParticipantId::new(ME))
                    .at(Timestamp::from_millis(ts))
            }),
        1..20,
    )
}

/// The same messages in generation order and in a shuffled order.
fn arb_shuffled_messages() -> impl Strategy<Value = (Vec<Message>, Vec<Message>)> {
    arb_messages().prop_flat_map(|x| (Just(x.clone()), Just(x).prop_shuffle()))
}

const PUSH_BODIES: [&str; 2] = ["ok", "on my way"];

/// (body, timestamp) of pushes from `dr-a`, pairwise distinct so every push
/// has its own ledger key, in a random arrival order.
fn arb_distinct_pushes() -> impl Strategy<Value = Vec<(usize, u64)>> {
    proptest::collection::btree_set((0..PUSH_BODIES.len(), 0u64..4_000), 1..40)
        .prop_map(|keys: BTreeSet<(usize, u64)>| keys.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

type Engine = ConversationSync<Arc<InMemoryGateway>, Arc<MemoryPersistence>, ManualClock>;

fn engine(persistence: &Arc<MemoryPersistence>) -> Engine {
    ConversationSync::new(
        ParticipantId::new(ME),
        Universe::Internal,
        Arc::new(InMemoryGateway::new()),
        Arc::clone(persistence),
        ManualClock::new(Timestamp::from_millis(20_000)),
        SyncConfig::default(),
    )
}

proptest! {
    #[test]
    fn merge_is_idempotent(x in arb_messages()) {
        let once = merge(&x, &[]);
        prop_assert_eq!(merge(&once, &[]), once.clone());
        prop_assert_eq!(merge(&once, &once), once);
    }

    #[test]
    fn merge_with_empty_is_dedup(x in arb_messages()) {
        prop_assert_eq!(merge(&x, &[]), dedup(&x));
    }

    #[test]
    fn merge_ignores_which_side_a_message_came_from(a in arb_messages(), b in arb_messages()) {
        prop_assert_eq!(merge(&a, &b), merge(&b, &a));
    }

    #[test]
    fn merged_output_is_sorted(a in arb_messages(), b in arb_messages()) {
        let merged = merge(&a, &b);
        prop_assert!(merged.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn near_duplicates_collapse_with_richer_status(
        base in 0u64..1_000_000,
        offset in 0u64..COALESCE_WINDOW_MS,
        first_read in any::<bool>(),
        second_read in any::<bool>(),
    ) {
        let mut first = Message::new(
            ParticipantId::new("guest-1"),
            ParticipantId::new(ME),
            "Hello",
            Timestamp::from_millis(base),
        );
        first.read = first_read;
        let mut second = first.clone();
        second.timestamp = Timestamp::from_millis(base + offset);
        second.read = second_read;
        second.delivered = true;

        let merged = merge(&[first], &[second]);
        prop_assert_eq!(merged.len(), 1);
        prop_assert_eq!(merged[0].read, first_read || second_read);
        prop_assert!(merged[0].delivered);
        prop_assert_eq!(merged[0].timestamp, Timestamp::from_millis(base));
    }

    #[test]
    fn incremental_log_equals_dedup_in_any_order((original, shuffled) in arb_shuffled_messages()) {
        let mut log = MessageLog::new();
        for msg in shuffled {
            log.insert(msg, COALESCE_WINDOW_MS);
        }
        let expected = dedup(&original);
        prop_assert_eq!(log.messages(), expected.as_slice());
    }

    #[test]
    fn ingest_in_any_order_equals_dedup(pushes in arb_distinct_pushes()) {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut engine = engine(&persistence);
        let counterpart = ParticipantId::new("dr-a");
        let received: Vec<Message> = pushes
            .iter()
            .map(|&(body, ts)| {
                let mut msg = Message::new(
                    counterpart.clone(),
                    ParticipantId::new(ME),
                    PUSH_BODIES[body],
                    Timestamp::from_millis(ts),
                );
                msg.delivered = true;
                msg
            })
            .collect();

        for msg in &received {
            let outcome = engine.ingest(
                InboundEvent::new(msg.sender_id.clone(), msg.body.clone())
                    .to(ParticipantId::new(ME))
                    .at(msg.timestamp),
            );
            prop_assert_ne!(outcome, IngestOutcome::Malformed);
        }
        let expected = dedup(&received);
        prop_assert_eq!(engine.messages(&counterpart), expected.as_slice());
        prop_assert_eq!(engine.unread_count(&counterpart), expected.len());
    }

    #[test]
    fn replaying_inbound_events_never_changes_unread(events in arb_inbound()) {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut engine = engine(&persistence);
        for event in &events {
            engine.ingest(event.clone());
        }
        let before = engine.unread_counts().clone();
        let messages = engine.snapshot_state().history;

        for event in events {
            engine.ingest(event);
        }
        prop_assert_eq!(engine.unread_counts(), &before);
        prop_assert_eq!(engine.snapshot_state().history, messages);
    }

    #[test]
    fn mark_as_read_always_leaves_zero(events in arb_inbound(), target in arb_counterpart()) {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut engine = engine(&persistence);
        for event in events {
            engine.ingest(event);
        }
        let before = engine.unread_count(&target);
        let marked = engine.mark_as_read(&target);
        prop_assert_eq!(marked, before);
        prop_assert_eq!(engine.unread_count(&target), 0);
        prop_assert_eq!(engine.mark_as_read(&target), 0);
    }

    #[test]
    fn snapshot_survives_restore(events in arb_inbound(), read in proptest::option::of(arb_counterpart())) {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut original = engine(&persistence);
        for event in events {
            original.ingest(event);
        }
        if let Some(counterpart) = read {
            original.mark_as_read(&counterpart);
        }

        let mut restored = engine(&persistence);
        restored.restore();
        prop_assert_eq!(restored.snapshot_state(), original.snapshot_state());
        prop_assert_eq!(restored.unread_counts(), original.unread_counts());
    }
}
