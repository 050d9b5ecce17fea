#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Page-reload behaviour: sessions written to disk and picked up again by a
//! fresh engine.

use std::sync::Arc;

use clinichat::clock::ManualClock;
use clinichat::gateway::memory::InMemoryGateway;
use clinichat::persist::file::FilePersistence;
use clinichat::persist::{Namespace, SessionPersistence};
use clinichat::sync::{ConversationSync, IngestOutcome, SyncConfig};
use clinichat_proto::message::{Message, ParticipantId, Timestamp};
use clinichat_proto::push::InboundEvent;
use clinichat_proto::scope::Universe;

type Engine = ConversationSync<Arc<InMemoryGateway>, FilePersistence, ManualClock>;

const T0: u64 = 1_700_000_000_000;

fn id(s: &str) -> ParticipantId {
    ParticipantId::new(s)
}

fn open_engine(dir: &std::path::Path, me: &str, universe: Universe, gateway: &Arc<InMemoryGateway>) -> Engine {
    let mut engine = ConversationSync::new(
        id(me),
        universe,
        Arc::clone(gateway),
        FilePersistence::new(dir).unwrap(),
        ManualClock::new(Timestamp::from_millis(T0 + 3_600_000)),
        SyncConfig::default(),
    );
    engine.restore();
    engine
}

fn push(from: &str, to: &str, body: &str, ts: u64) -> InboundEvent {
    InboundEvent::new(id(from), body)
        .to(id(to))
        .at(Timestamp::from_millis(ts))
}

#[tokio::test]
async fn reload_restores_messages_and_unread_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());

    let before = {
        let mut engine = open_engine(dir.path(), "dr-a", Universe::Guest, &gateway);
        engine.ingest(push("guest-1", "dr-a", "Hello", T0));
        engine.ingest(push("guest-1", "dr-a", "Anyone there?", T0 + 5_000));
        engine.ingest(push("guest-2", "dr-a", "Appointment?", T0 + 9_000));
        engine.mark_as_read(&id("guest-2"));
        engine.record_outbound(&id("guest-2"), "Tuesday works").unwrap();
        engine.snapshot_state()
    };

    let mut engine = open_engine(dir.path(), "dr-a", Universe::Guest, &gateway);
    assert_eq!(engine.snapshot_state(), before);
    assert_eq!(engine.unread_count(&id("guest-1")), 2);
    assert_eq!(engine.unread_count(&id("guest-2")), 0);

    // The push channel redelivers the last message after reconnecting.
    assert_eq!(
        engine.ingest(push("guest-1", "dr-a", "Anyone there?", T0 + 5_000)),
        IngestOutcome::Duplicate
    );
    assert_eq!(engine.unread_count(&id("guest-1")), 2);
    assert_eq!(engine.messages(&id("guest-1")).len(), 2);
}

#[tokio::test]
async fn fetched_history_is_not_fetched_again_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let mut old = Message::new(id("dr-b"), id("dr-a"), "chart is ready", Timestamp::from_millis(T0));
    old.delivered = true;
    old.id = Some("m-7".into());
    gateway.set_history(&id("dr-a"), &id("dr-b"), vec![old]);

    {
        let mut engine = open_engine(dir.path(), "dr-a", Universe::Internal, &gateway);
        assert_eq!(engine.open_conversation(&id("dr-b")).await.len(), 1);
    }
    assert_eq!(gateway.history_calls(), 1);

    let mut engine = open_engine(dir.path(), "dr-a", Universe::Internal, &gateway);
    assert_eq!(engine.open_conversation(&id("dr-b")).await.len(), 1);
    assert_eq!(gateway.history_calls(), 1);
    assert!(engine.messages(&id("dr-b"))[0].read);
}

#[tokio::test]
async fn new_identity_purges_the_previous_one() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());

    {
        let mut guest = open_engine(dir.path(), "guest-1", Universe::Guest, &gateway);
        guest.record_outbound(&id("dr-a"), "hi").unwrap();
    }
    let storage = FilePersistence::new(dir.path()).unwrap();
    let guest_ns = Namespace::new(id("guest-1"), Universe::Guest);
    assert!(storage.path_for(&guest_ns).exists());

    let staff = open_engine(dir.path(), "dr-a", Universe::Guest, &gateway);
    assert!(!storage.path_for(&guest_ns).exists());
    assert!(staff.messages(&id("guest-1")).is_empty());
    assert!(storage.load(&guest_ns).unwrap().is_none());
}

#[tokio::test]
async fn universes_of_one_identity_are_stored_apart() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());

    {
        let mut guests = open_engine(dir.path(), "dr-a", Universe::Guest, &gateway);
        let mut staff = open_engine(dir.path(), "dr-a", Universe::Internal, &gateway);
        guests.ingest(push("guest-1", "dr-a", "hello", T0));
        staff.ingest(push("dr-b", "dr-a", "meeting", T0));
    }

    let guests = open_engine(dir.path(), "dr-a", Universe::Guest, &gateway);
    let staff = open_engine(dir.path(), "dr-a", Universe::Internal, &gateway);
    assert_eq!(guests.unread_count(&id("guest-1")), 1);
    assert!(guests.messages(&id("dr-b")).is_empty());
    assert_eq!(staff.unread_count(&id("dr-b")), 1);
    assert!(staff.messages(&id("guest-1")).is_empty());
}

#[tokio::test]
async fn corrupt_record_starts_an_empty_session() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());
    let storage = FilePersistence::new(dir.path()).unwrap();
    let ns = Namespace::new(id("dr-a"), Universe::Guest);
    std::fs::write(storage.path_for(&ns), b"{ not json").unwrap();

    let mut engine = open_engine(dir.path(), "dr-a", Universe::Guest, &gateway);
    assert!(engine.conversations().is_empty());

    // The next mutation overwrites the broken record.
    engine.ingest(push("guest-1", "dr-a", "hello", T0));
    assert!(storage.load(&ns).unwrap().is_some());
}

#[tokio::test]
async fn lookalike_identities_never_share_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(InMemoryGateway::new());

    {
        let mut dotted = open_engine(dir.path(), "dr.a", Universe::Internal, &gateway);
        dotted.ingest(push("dr-b", "dr.a", "private note", T0));
    }
    let storage = FilePersistence::new(dir.path()).unwrap();
    assert_eq!(storage.purge_except(&id("dr_a")).unwrap(), 1);

    let underscored = open_engine(dir.path(), "dr_a", Universe::Internal, &gateway);
    assert!(underscored.conversations().is_empty());
    assert!(underscored.messages(&id("dr-b")).is_empty());
    assert!(
        storage
            .load(&Namespace::new(id("dr.a"), Universe::Internal))
            .unwrap()
            .is_none()
    );
}
