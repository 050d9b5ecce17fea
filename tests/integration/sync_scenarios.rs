#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end synchronization scenarios against in-process fakes.
//!
//! Engines run with an in-memory gateway, in-memory session storage and a
//! manual clock; the client-level tests drive a loopback push channel.

use std::sync::Arc;
use std::time::Duration;

use clinichat::channel::loopback::{LoopbackConnector, LoopbackRemote};
use clinichat::client::Client;
use clinichat::clock::ManualClock;
use clinichat::connection::{ConnectionEvent, ConnectionManager};
use clinichat::gateway::memory::InMemoryGateway;
use clinichat::persist::memory::MemoryPersistence;
use clinichat::sync::{ConversationSync, IngestOutcome, StatusUpdate, SyncConfig, SyncEvent};
use clinichat_proto::api::RosterEntry;
use clinichat_proto::message::{DeliveryState, Message, ParticipantId, Timestamp};
use clinichat_proto::push::{Credential, InboundEvent};
use clinichat_proto::scope::Universe;
use tokio::sync::mpsc;

type Engine = ConversationSync<Arc<InMemoryGateway>, Arc<MemoryPersistence>, ManualClock>;

const T0: u64 = 1_700_000_000_000;

fn id(s: &str) -> ParticipantId {
    ParticipantId::new(s)
}

fn engine(
    me: &str,
    universe: Universe,
    gateway: &Arc<InMemoryGateway>,
    persistence: &Arc<MemoryPersistence>,
    clock: &ManualClock,
) -> Engine {
    ConversationSync::new(
        id(me),
        universe,
        Arc::clone(gateway),
        Arc::clone(persistence),
        clock.clone(),
        SyncConfig::default(),
    )
}

fn push(from: &str, to: &str, body: &str, ts: u64) -> InboundEvent {
    InboundEvent::new(id(from), body)
        .to(id(to))
        .at(Timestamp::from_millis(ts))
}

#[tokio::test]
async fn guest_hello_is_unread_until_the_consultant_opens_it() {
    let gateway = Arc::new(InMemoryGateway::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));
    let mut consultant = engine("dr-a", Universe::Guest, &gateway, &persistence, &clock);

    assert_eq!(
        consultant.ingest(push("guest-x", "dr-a", "Hello", T0)),
        IngestOutcome::Added
    );
    assert_eq!(consultant.unread_count(&id("guest-x")), 1);

    let messages = consultant.open_conversation(&id("guest-x")).await.to_vec();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].read);
    assert_eq!(consultant.unread_count(&id("guest-x")), 0);
    assert_eq!(gateway.marked_read(), vec![(id("dr-a"), id("guest-x"))]);
}

#[tokio::test]
async fn repeated_short_replies_arriving_out_of_order_keep_their_count() {
    let gateway = Arc::new(InMemoryGateway::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0 + 10_000));
    let mut consultant = engine("dr-a", Universe::Guest, &gateway, &persistence, &clock);

    // "ok" at 0, 0.8s and 1.6s is two messages: 0 absorbs 0.8, 1.6 stands alone.
    for offset in [1_600, 800, 0] {
        consultant.ingest(push("guest-x", "dr-a", "ok", T0 + offset));
    }
    let stamps: Vec<u64> = consultant
        .messages(&id("guest-x"))
        .iter()
        .map(|m| m.timestamp.as_millis() - T0)
        .collect();
    assert_eq!(stamps, vec![0, 1_600]);
    assert_eq!(consultant.unread_count(&id("guest-x")), 2);
}

#[tokio::test]
async fn unstamped_redelivery_collapses_only_within_the_window() {
    let gateway = Arc::new(InMemoryGateway::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));
    let mut consultant = engine("dr-a", Universe::Guest, &gateway, &persistence, &clock);
    let unstamped = || InboundEvent::new(id("guest-x"), "Hello");

    assert_eq!(consultant.ingest(unstamped()), IngestOutcome::Added);
    clock.advance(Duration::from_millis(300));
    assert_eq!(consultant.ingest(unstamped()), IngestOutcome::Duplicate);
    assert_eq!(consultant.unread_count(&id("guest-x")), 1);

    clock.advance(Duration::from_millis(1_500));
    assert_eq!(consultant.ingest(unstamped()), IngestOutcome::Added);
    assert_eq!(consultant.unread_count(&id("guest-x")), 2);
}

#[tokio::test]
async fn history_and_live_copies_of_one_message_collapse() {
    let gateway = Arc::new(InMemoryGateway::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));

    // The server copy carries an id and a timestamp 500ms off the push copy.
    let mut archived = Message::new(id("guest-x"), id("dr-a"), "Hello", Timestamp::from_millis(T0 + 500));
    archived.delivered = true;
    archived.id = Some("m-1".into());
    gateway.set_history(&id("dr-a"), &id("guest-x"), vec![archived]);
    let mut consultant = engine("dr-a", Universe::Guest, &gateway, &persistence, &clock);

    consultant.ingest(push("guest-x", "dr-a", "Hello", T0));
    let messages = consultant.open_conversation(&id("guest-x")).await.to_vec();

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_deref(), Some("m-1"));
    assert!(messages[0].read);
}

#[tokio::test]
async fn late_history_after_navigating_away_is_still_merged() {
    let gateway = Arc::new(InMemoryGateway::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));
    let mut consultant = engine("dr-a", Universe::Guest, &gateway, &persistence, &clock);

    consultant.ingest(push("guest-x", "dr-a", "second", T0 + 10_000));
    let mut earlier = Message::new(id("guest-x"), id("dr-a"), "first", Timestamp::from_millis(T0));
    earlier.delivered = true;

    let added = consultant.hydrate_with(&id("guest-x"), vec![earlier]);
    assert_eq!(added, 1);
    let bodies: Vec<_> = consultant
        .messages(&id("guest-x"))
        .iter()
        .map(|m| m.body.as_str())
        .collect();
    assert_eq!(bodies, ["first", "second"]);
    assert_eq!(consultant.unread_count(&id("guest-x")), 2);
}

#[tokio::test]
async fn conversation_list_ranks_unread_then_recency() {
    let gateway = Arc::new(InMemoryGateway::new());
    gateway.set_roster(
        Universe::Internal,
        &id("dr-me"),
        vec![
            RosterEntry::new(id("dr-a"), "A"),
            RosterEntry::new(id("dr-b"), "B"),
            RosterEntry::new(id("dr-c"), "C"),
            RosterEntry::new(id("dr-d"), "D"),
        ],
    );
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));
    let mut me = engine("dr-me", Universe::Internal, &gateway, &persistence, &clock);
    me.refresh_roster().await;

    let t0 = T0;
    let t1 = T0 + 60_000;
    let t2 = T0 + 120_000;
    me.ingest(push("dr-a", "dr-me", "a1", t1 - 5_000));
    me.ingest(push("dr-a", "dr-me", "a2", t1));
    me.ingest(push("dr-b", "dr-me", "b1", t2));
    me.mark_as_read(&id("dr-b"));
    me.ingest(push("dr-c", "dr-me", "c1", t0));

    let order: Vec<_> = me
        .conversations()
        .into_iter()
        .map(|c| (c.counterpart_id.to_string(), c.unread_count))
        .collect();
    assert_eq!(
        order,
        [
            ("dr-a".to_string(), 2),
            ("dr-c".to_string(), 1),
            ("dr-b".to_string(), 0),
            ("dr-d".to_string(), 0),
        ]
    );
}

#[tokio::test]
async fn outbound_message_walks_sent_delivered_read() {
    let gateway = Arc::new(InMemoryGateway::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));
    let mut guest = engine("guest-x", Universe::Guest, &gateway, &persistence, &clock);
    let mut events = guest.subscribe();

    let msg = guest.record_outbound(&id("dr-a"), "my tooth hurts").unwrap();
    let me = id("guest-x");
    assert_eq!(DeliveryState::of(&guest.messages(&id("dr-a"))[0], &me), DeliveryState::Sent);

    assert!(guest.apply_status(&id("dr-a"), StatusUpdate::Delivered(msg.key())));
    assert_eq!(
        DeliveryState::of(&guest.messages(&id("dr-a"))[0], &me),
        DeliveryState::Delivered
    );

    clock.advance(Duration::from_secs(1));
    assert_eq!(guest.tick(), 0);
    clock.advance(Duration::from_secs(2));
    assert_eq!(guest.tick(), 1);
    assert_eq!(DeliveryState::of(&guest.messages(&id("dr-a"))[0], &me), DeliveryState::Read);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::StatusChanged { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(states, [DeliveryState::Delivered, DeliveryState::Read]);
}

// --- Client over a loopback channel ---

struct Harness {
    client: Client<LoopbackConnector, Arc<InMemoryGateway>, Arc<MemoryPersistence>, ManualClock>,
    events: mpsc::Receiver<ConnectionEvent>,
    remotes: mpsc::UnboundedReceiver<LoopbackRemote>,
}

fn staff_client(persistence: &Arc<MemoryPersistence>) -> Harness {
    let gateway = Arc::new(InMemoryGateway::new());
    let clock = ManualClock::new(Timestamp::from_millis(T0));
    let (connector, remotes) = LoopbackConnector::new(16);
    let (connection, events) = ConnectionManager::new(connector, 16);
    let engines = Universe::ALL
        .into_iter()
        .map(|u| engine("dr-a", u, &gateway, persistence, &clock));
    let client = Client::new(
        id("dr-a"),
        Credential::Token("dr-a".into()),
        connection,
        engines,
    );
    Harness {
        client,
        events,
        remotes,
    }
}

impl Harness {
    async fn deliver(&mut self, remote: &LoopbackRemote, event: InboundEvent) -> IngestOutcome {
        remote.inject(event).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("no connection event")
            .unwrap();
        self.client.handle_connection_event(event).unwrap()
    }
}

#[tokio::test]
async fn one_connection_feeds_both_universes() {
    let persistence = Arc::new(MemoryPersistence::new());
    let mut h = staff_client(&persistence);
    h.client.start().await;
    h.client.connect().await.unwrap();
    let remote = h.remotes.recv().await.unwrap();

    h.deliver(&remote, push("guest-x", "dr-a", "hi doctor", T0)).await;
    h.deliver(&remote, push("dr-b", "dr-a", "lunch?", T0 + 1)).await;

    let guest_side = h.client.engine(Universe::Guest).unwrap();
    let staff_side = h.client.engine(Universe::Internal).unwrap();
    assert_eq!(guest_side.unread_count(&id("guest-x")), 1);
    assert!(guest_side.messages(&id("dr-b")).is_empty());
    assert_eq!(staff_side.unread_count(&id("dr-b")), 1);
    assert!(staff_side.messages(&id("guest-x")).is_empty());
    assert_eq!(
        persistence.keys(),
        ["dr-a.guest".to_string(), "dr-a.internal".to_string()]
    );
}

#[tokio::test]
async fn redelivery_after_reconnect_does_not_count_twice() {
    let persistence = Arc::new(MemoryPersistence::new());
    let mut h = staff_client(&persistence);
    h.client.connect().await.unwrap();
    let remote = h.remotes.recv().await.unwrap();

    let hello = push("guest-x", "dr-a", "Hello", T0);
    assert_eq!(h.deliver(&remote, hello.clone()).await, IngestOutcome::Added);

    drop(remote);
    let closed = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
        .await
        .expect("no close event")
        .unwrap();
    assert!(matches!(closed, ConnectionEvent::Closed { .. }));
    assert!(h.client.handle_connection_event(closed).is_none());
    assert!(!h.client.is_connected());

    assert!(h.client.connect().await.unwrap());
    let remote = h.remotes.recv().await.unwrap();
    assert_eq!(h.deliver(&remote, hello).await, IngestOutcome::Duplicate);

    let guest_side = h.client.engine(Universe::Guest).unwrap();
    assert_eq!(guest_side.unread_count(&id("guest-x")), 1);
    assert_eq!(guest_side.messages(&id("guest-x")).len(), 1);
}

#[tokio::test]
async fn reply_reaches_the_channel_and_is_delivered() {
    let persistence = Arc::new(MemoryPersistence::new());
    let mut h = staff_client(&persistence);
    h.client.connect().await.unwrap();
    let mut remote = h.remotes.recv().await.unwrap();

    h.deliver(&remote, push("guest-x", "dr-a", "Hello", T0)).await;
    h.client.open_conversation(&id("guest-x")).await.unwrap();
    let sent = h.client.send(&id("guest-x"), "How can I help?").await.unwrap();

    let wire = remote.next_sent().await.unwrap();
    assert_eq!(wire.receiver_id, Some(id("guest-x")));
    assert_eq!(wire.body.as_deref(), Some("How can I help?"));

    let guest_side = h.client.engine(Universe::Guest).unwrap();
    let stored = guest_side
        .messages(&id("guest-x"))
        .iter()
        .find(|m| m.key() == sent.key())
        .unwrap();
    assert_eq!(DeliveryState::of(stored, &id("dr-a")), DeliveryState::Delivered);
    assert_eq!(guest_side.unread_count(&id("guest-x")), 0);
}
