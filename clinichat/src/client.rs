//! Client coordinator: one push connection, one engine per universe.
//!
//! [`Client`] owns the [`ConnectionManager`] and a [`ConversationSync`] for
//! every universe the signed-in identity can reach. Inbound events are routed
//! to the engine of their universe; outbound sends are recorded by the engine
//! before they are handed to the channel.
//!
//! [`spawn_client`] moves a client onto a background task and talks to it
//! through [`ClientCommand`] / [`ClientUpdate`] channels:
//!
//! ```text
//! CLI (main task)  ←── ClientUpdate ───  client task
//!                  ─── ClientCommand →
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use clinichat_proto::message::{Message, ParticipantId};
use clinichat_proto::push::{Credential, InboundEvent};
use clinichat_proto::scope::Universe;

use crate::channel::{ChannelError, Connector};
use crate::clock::{Clock, SystemClock};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::gateway::Gateway;
use crate::persist::SessionPersistence;
use crate::rank::ConversationSummary;
use crate::sync::{ConversationSync, IngestOutcome, StatusUpdate, SyncError, SyncEvent};

/// Errors returned by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The synchronization engine rejected the action.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The push channel failed.
    #[error("push channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The identity has no access to the counterpart's universe.
    #[error("{identity} cannot reach {universe} conversations")]
    Unreachable {
        /// The signed-in identity.
        identity: ParticipantId,
        /// The universe that was asked for.
        universe: Universe,
    },
}

/// Universes reachable by `identity`.
///
/// Guests only ever talk to staff, which is guest-universe traffic. Staff see
/// both universes.
#[must_use]
pub fn universes_for(identity: &ParticipantId) -> &'static [Universe] {
    if identity.is_guest() {
        &[Universe::Guest]
    } else {
        &Universe::ALL
    }
}

/// A signed-in client.
pub struct Client<C: Connector, G, P, K = SystemClock> {
    identity: ParticipantId,
    credential: Credential,
    connection: ConnectionManager<C>,
    engines: BTreeMap<Universe, ConversationSync<G, P, K>>,
}

impl<C, G, P, K> Client<C, G, P, K>
where
    C: Connector,
    G: Gateway,
    P: SessionPersistence,
    K: Clock,
{
    /// Assembles a client from its parts.
    ///
    /// Engines are keyed by their universe; a later engine for the same
    /// universe replaces an earlier one.
    pub fn new(
        identity: ParticipantId,
        credential: Credential,
        connection: ConnectionManager<C>,
        engines: impl IntoIterator<Item = ConversationSync<G, P, K>>,
    ) -> Self {
        let engines = engines
            .into_iter()
            .map(|engine| (engine.universe(), engine))
            .collect();
        Self {
            identity,
            credential,
            connection,
            engines,
        }
    }

    /// The signed-in participant.
    #[must_use]
    pub const fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    /// Universes this client has an engine for.
    pub fn universes(&self) -> impl Iterator<Item = Universe> + '_ {
        self.engines.keys().copied()
    }

    /// The engine of `universe`.
    #[must_use]
    pub fn engine(&self, universe: Universe) -> Option<&ConversationSync<G, P, K>> {
        self.engines.get(&universe)
    }

    /// Whether the push channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    /// Restores every engine's session and loads rosters and unread counts.
    pub async fn start(&mut self) {
        for engine in self.engines.values_mut() {
            engine.restore();
            engine.refresh_roster().await;
            engine.reconcile_unread().await;
        }
        tracing::info!(
            identity = %self.identity,
            universes = self.engines.len(),
            "client started"
        );
    }

    /// Opens the push channel, or re-opens it after a failure.
    ///
    /// # Errors
    ///
    /// Returns the connector's [`ChannelError`] if the channel cannot be
    /// opened.
    pub async fn connect(&mut self) -> Result<bool, ChannelError> {
        self.connection.open(self.credential.clone()).await
    }

    /// Records and sends a message.
    ///
    /// The message stays in the `Sent` state when the channel refuses it;
    /// there is no offline queue.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Sync`] if the message is rejected before
    /// sending and [`ClientError::Channel`] if the channel refused it.
    pub async fn send(&mut self, to: &ParticipantId, body: &str) -> Result<Message, ClientError> {
        let universe = self.universe_of(to)?;
        let msg = self.engine_or_err(universe)?.record_outbound(to, body)?;

        self.connection.send(to, body).await?;
        let engine = self.engine_or_err(universe)?;
        engine.apply_status(to, StatusUpdate::Delivered(msg.key()));
        Ok(msg)
    }

    /// Routes one event of the connection stream.
    ///
    /// Returns what the engine did with an inbound message, `None` for
    /// lifecycle events.
    pub fn handle_connection_event(&mut self, event: ConnectionEvent) -> Option<IngestOutcome> {
        match event {
            ConnectionEvent::Inbound(inbound) => Some(self.route_inbound(inbound)),
            ConnectionEvent::Closed { reason } => {
                tracing::warn!(identity = %self.identity, reason = %reason, "push channel closed");
                None
            }
        }
    }

    /// Brings a conversation to the foreground.
    ///
    /// The foreground conversation of every other universe is closed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unreachable`] if the identity cannot reach the
    /// counterpart's universe.
    pub async fn open_conversation(
        &mut self,
        counterpart: &ParticipantId,
    ) -> Result<Vec<Message>, ClientError> {
        let universe = self.universe_of(counterpart)?;
        for (u, engine) in &mut self.engines {
            if *u != universe {
                engine.close_conversation();
            }
        }
        let engine = self.engine_or_err(universe)?;
        Ok(engine.open_conversation(counterpart).await.to_vec())
    }

    /// Sends the foreground conversation to the background.
    pub fn close_conversation(&mut self) {
        for engine in self.engines.values_mut() {
            engine.close_conversation();
        }
    }

    /// The ranked conversation list of `universe`.
    #[must_use]
    pub fn conversations(&self, universe: Universe) -> Vec<ConversationSummary> {
        self.engines
            .get(&universe)
            .map(ConversationSync::conversations)
            .unwrap_or_default()
    }

    /// Refreshes rosters and unread counts of every universe.
    pub async fn refresh(&mut self) {
        for engine in self.engines.values_mut() {
            engine.refresh_roster().await;
            engine.reconcile_unread().await;
        }
    }

    /// Applies due read receipts in every universe.
    pub fn tick(&mut self) -> usize {
        self.engines.values_mut().map(ConversationSync::tick).sum()
    }

    /// Closes the push channel.
    pub async fn shutdown(&mut self) {
        self.connection.close().await;
    }

    fn route_inbound(&mut self, event: InboundEvent) -> IngestOutcome {
        let counterpart = match (&event.sender_id, &event.receiver_id) {
            (Some(sender), Some(receiver)) if *sender == self.identity => receiver.clone(),
            (Some(sender), _) => sender.clone(),
            (None, _) => {
                tracing::warn!(identity = %self.identity, "discarding inbound event without sender");
                return IngestOutcome::Malformed;
            }
        };
        let universe = Universe::for_pair(&self.identity, &counterpart);
        match self.engines.get_mut(&universe) {
            Some(engine) => engine.ingest(event),
            None => {
                tracing::warn!(counterpart = %counterpart, universe = %universe, "no engine for inbound event");
                IngestOutcome::Foreign
            }
        }
    }

    fn universe_of(&self, counterpart: &ParticipantId) -> Result<Universe, ClientError> {
        let universe = Universe::for_pair(&self.identity, counterpart);
        if self.engines.contains_key(&universe) {
            Ok(universe)
        } else {
            Err(ClientError::Unreachable {
                identity: self.identity.clone(),
                universe,
            })
        }
    }

    fn engine_or_err(
        &mut self,
        universe: Universe,
    ) -> Result<&mut ConversationSync<G, P, K>, ClientError> {
        self.engines
            .get_mut(&universe)
            .ok_or_else(|| ClientError::Unreachable {
                identity: self.identity.clone(),
                universe,
            })
    }
}

/// Commands sent from the CLI to the client task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Send a message.
    Send {
        /// Addressee.
        to: ParticipantId,
        /// Message text.
        body: String,
    },
    /// Bring a conversation to the foreground.
    Open {
        /// The conversation.
        counterpart: ParticipantId,
    },
    /// Send the foreground conversation to the background.
    Close,
    /// Report the ranked conversation list.
    List {
        /// Universe to list.
        universe: Universe,
    },
    /// Refresh rosters and unread counts.
    Refresh,
    /// Re-open the push channel.
    Reconnect,
    /// Stop the client task.
    Shutdown,
}

/// Updates sent from the client task to the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    /// An engine notification.
    Sync {
        /// Universe of the engine.
        universe: Universe,
        /// The notification.
        event: SyncEvent,
    },
    /// Answer to [`ClientCommand::List`].
    Conversations {
        /// The listed universe.
        universe: Universe,
        /// Ranked conversations.
        conversations: Vec<ConversationSummary>,
    },
    /// Answer to [`ClientCommand::Open`].
    Opened {
        /// The conversation.
        counterpart: ParticipantId,
        /// Its messages, oldest first.
        messages: Vec<Message>,
    },
    /// The push channel opened or dropped.
    Connection {
        /// Whether the channel is open now.
        connected: bool,
        /// Human-readable detail.
        detail: String,
    },
    /// A command failed.
    Error(String),
}

/// Moves `client` onto a background task.
///
/// The task drives the client from three sources: commands, the connection
/// event stream, and a `tick_interval` timer applying due read receipts.
/// Engine notifications are forwarded as [`ClientUpdate::Sync`].
pub fn spawn_client<C, G, P, K>(
    client: Client<C, G, P, K>,
    connection_events: mpsc::Receiver<ConnectionEvent>,
    tick_interval: Duration,
    capacity: usize,
) -> (
    mpsc::Sender<ClientCommand>,
    mpsc::Receiver<ClientUpdate>,
    JoinHandle<()>,
)
where
    C: Connector + 'static,
    G: Gateway + 'static,
    P: SessionPersistence + 'static,
    K: Clock + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let (update_tx, update_rx) = mpsc::channel(capacity);

    for (universe, engine) in &client.engines {
        tokio::spawn(sync_event_forwarder(
            *universe,
            engine.subscribe(),
            update_tx.clone(),
        ));
    }

    let handle = tokio::spawn(run_client(
        client,
        connection_events,
        cmd_rx,
        update_tx,
        tick_interval,
    ));
    (cmd_tx, update_rx, handle)
}

async fn run_client<C, G, P, K>(
    mut client: Client<C, G, P, K>,
    mut connection_events: mpsc::Receiver<ConnectionEvent>,
    mut commands: mpsc::Receiver<ClientCommand>,
    updates: mpsc::Sender<ClientUpdate>,
    tick_interval: Duration,
) where
    C: Connector,
    G: Gateway,
    P: SessionPersistence,
    K: Clock,
{
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if command == ClientCommand::Shutdown {
                    break;
                }
                if let Some(update) = handle_command(&mut client, command).await
                    && updates.send(update).await.is_err()
                {
                    break;
                }
            }
            Some(event) = connection_events.recv() => {
                if let ConnectionEvent::Closed { reason } = &event {
                    let _ = updates
                        .send(ClientUpdate::Connection {
                            connected: false,
                            detail: reason.clone(),
                        })
                        .await;
                }
                client.handle_connection_event(event);
            }
            _ = ticker.tick() => {
                client.tick();
            }
        }
    }

    client.shutdown().await;
    tracing::info!(identity = %client.identity(), "client task stopped");
}

async fn handle_command<C, G, P, K>(
    client: &mut Client<C, G, P, K>,
    command: ClientCommand,
) -> Option<ClientUpdate>
where
    C: Connector,
    G: Gateway,
    P: SessionPersistence,
    K: Clock,
{
    match command {
        ClientCommand::Send { to, body } => match client.send(&to, &body).await {
            Ok(_) => None,
            Err(e) => Some(ClientUpdate::Error(format!("send to {to} failed: {e}"))),
        },
        ClientCommand::Open { counterpart } => {
            match client.open_conversation(&counterpart).await {
                Ok(messages) => Some(ClientUpdate::Opened {
                    counterpart,
                    messages,
                }),
                Err(e) => Some(ClientUpdate::Error(e.to_string())),
            }
        }
        ClientCommand::Close => {
            client.close_conversation();
            None
        }
        ClientCommand::List { universe } => Some(ClientUpdate::Conversations {
            universe,
            conversations: client.conversations(universe),
        }),
        ClientCommand::Refresh => {
            client.refresh().await;
            None
        }
        ClientCommand::Reconnect => match client.connect().await {
            Ok(_) => Some(ClientUpdate::Connection {
                connected: true,
                detail: "push channel open".to_string(),
            }),
            Err(e) => Some(ClientUpdate::Connection {
                connected: false,
                detail: e.to_string(),
            }),
        },
        ClientCommand::Shutdown => None,
    }
}

/// Background task: forward engine notifications to the CLI.
async fn sync_event_forwarder(
    universe: Universe,
    mut events: broadcast::Receiver<SyncEvent>,
    updates: mpsc::Sender<ClientUpdate>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if updates
                    .send(ClientUpdate::Sync { universe, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(universe = %universe, skipped, "sync event forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
