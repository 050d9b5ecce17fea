#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Full stack against an in-process backend: two clients over real
//! WebSockets and HTTP.

use std::sync::Arc;
use std::time::Duration;

use clinichat::channel::relay::{RelayConnector, RelaySettings};
use clinichat::client::{Client, universes_for};
use clinichat::clock::SystemClock;
use clinichat::connection::{ConnectionEvent, ConnectionManager};
use clinichat::gateway::Gateway;
use clinichat::gateway::http::HttpGateway;
use clinichat::persist::memory::MemoryPersistence;
use clinichat::sync::{ConversationSync, IngestOutcome, SyncConfig};
use clinichat_proto::message::{DeliveryState, ParticipantId};
use clinichat_proto::push::Credential;
use clinichat_proto::scope::Universe;
use clinichat_relay::config::StaffAccount;
use clinichat_relay::relay::{RelayState, start_server_with_state};
use tokio::sync::mpsc;

type TestClient = Client<RelayConnector, Arc<HttpGateway>, Arc<MemoryPersistence>, SystemClock>;

fn id(s: &str) -> ParticipantId {
    ParticipantId::new(s)
}

struct Backend {
    addr: std::net::SocketAddr,
    state: Arc<RelayState>,
}

async fn backend() -> Backend {
    let state = Arc::new(RelayState::with_staff(vec![
        StaffAccount::new("dr-a", "Dr. A", "tok-a"),
        StaffAccount::new("dr-b", "Dr. B", "tok-b"),
    ]));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    Backend { addr, state }
}

fn gateway(backend: &Backend, token: Option<&str>) -> Arc<HttpGateway> {
    Arc::new(
        HttpGateway::new(
            &format!("http://{}/", backend.addr),
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap(),
    )
}

async fn client(
    backend: &Backend,
    identity: &str,
    credential: Credential,
) -> (TestClient, mpsc::Receiver<ConnectionEvent>) {
    let token = match &credential {
        Credential::Token(t) => Some(t.as_str()),
        Credential::Guest(_) => None,
    };
    let gateway = gateway(backend, token);
    let persistence = Arc::new(MemoryPersistence::new());
    let connector = RelayConnector::new(format!("ws://{}/ws", backend.addr), RelaySettings::default());
    let (connection, events) = ConnectionManager::new(connector, 64);

    let me = id(identity);
    let engines = universes_for(&me).iter().map(|&u| {
        ConversationSync::new(
            me.clone(),
            u,
            Arc::clone(&gateway),
            Arc::clone(&persistence),
            SystemClock,
            SyncConfig::default(),
        )
    });
    let mut client = Client::new(me.clone(), credential, connection, engines);
    assert!(client.connect().await.unwrap());
    client.start().await;
    (client, events)
}

async fn next_inbound(client: &mut TestClient, events: &mut mpsc::Receiver<ConnectionEvent>) -> IngestOutcome {
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no inbound event")
        .unwrap();
    client.handle_connection_event(event).unwrap()
}

#[tokio::test]
async fn guest_and_consultant_converse_through_the_backend() {
    let backend = backend().await;
    let (mut guest, _guest_events) =
        client(&backend, "guest-1", Credential::Guest(id("guest-1"))).await;
    let (mut doctor, mut doctor_events) =
        client(&backend, "dr-a", Credential::Token("tok-a".into())).await;

    // The guest sees every consultant before anyone wrote.
    let roster: Vec<_> = guest
        .conversations(Universe::Guest)
        .into_iter()
        .map(|c| c.display_name)
        .collect();
    assert_eq!(roster, ["Dr. A", "Dr. B"]);

    guest.send(&id("dr-a"), "Hello").await.unwrap();
    assert_eq!(next_inbound(&mut doctor, &mut doctor_events).await, IngestOutcome::Added);
    let guest_side = doctor.engine(Universe::Guest).unwrap();
    assert_eq!(guest_side.unread_count(&id("guest-1")), 1);
    assert_eq!(
        backend.state.archive.unread_counts(&id("dr-a")).await.get(&id("guest-1")),
        Some(&1)
    );

    // Opening merges the archived copy with the pushed one and reports the read.
    let opened = doctor.open_conversation(&id("guest-1")).await.unwrap();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].id.is_some());
    assert!(opened[0].read);
    assert!(backend.state.archive.unread_counts(&id("dr-a")).await.is_empty());

    // The guest's history now shows the message as read.
    let mine = guest.open_conversation(&id("dr-a")).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(DeliveryState::of(&mine[0], &id("guest-1")), DeliveryState::Read);
}

#[tokio::test]
async fn staff_chat_stays_in_the_internal_universe() {
    let backend = backend().await;
    let (mut a, _a_events) = client(&backend, "dr-a", Credential::Token("tok-a".into())).await;
    let (mut b, mut b_events) = client(&backend, "dr-b", Credential::Token("tok-b".into())).await;

    a.send(&id("dr-b"), "x-ray results are in").await.unwrap();
    assert_eq!(next_inbound(&mut b, &mut b_events).await, IngestOutcome::Added);

    assert_eq!(
        b.engine(Universe::Internal).unwrap().unread_count(&id("dr-a")),
        1
    );
    assert!(b.engine(Universe::Guest).unwrap().messages(&id("dr-a")).is_empty());
    let internal: Vec<_> = b
        .conversations(Universe::Internal)
        .into_iter()
        .map(|c| c.counterpart_id)
        .collect();
    assert_eq!(internal, [id("dr-a")]);
}

#[tokio::test]
async fn offline_recipient_finds_the_guest_in_its_roster() {
    let backend = backend().await;
    let (mut guest, _events) = client(&backend, "guest-7", Credential::Guest(id("guest-7"))).await;
    guest.send(&id("dr-b"), "are you open saturday?").await.unwrap();

    // Wait until the backend archived it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while backend.state.archive.unread_counts(&id("dr-b")).await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "message never archived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (doctor, _doctor_events) = client(&backend, "dr-b", Credential::Token("tok-b".into())).await;
    let rows = doctor.conversations(Universe::Guest);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].counterpart_id, id("guest-7"));
}

#[tokio::test]
async fn staff_endpoints_require_the_owners_token() {
    let backend = backend().await;
    let anonymous = gateway(&backend, None);
    let wrong = gateway(&backend, Some("tok-b"));
    let right = gateway(&backend, Some("tok-a"));

    assert!(anonymous.fetch_unread_counts(&id("dr-a")).await.is_err());
    assert!(wrong.fetch_unread_counts(&id("dr-a")).await.is_err());
    assert!(right.fetch_unread_counts(&id("dr-a")).await.unwrap().is_empty());
    // Guest endpoints are open.
    assert!(anonymous.fetch_history(&id("guest-1"), &id("dr-a")).await.unwrap().is_empty());
}
