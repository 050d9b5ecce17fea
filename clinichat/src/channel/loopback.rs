//! Loopback push channel for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels in place of a backend.
//! [`LoopbackChannel::create_pair`] wires two participants to each other;
//! [`LoopbackChannel::detached`] returns a channel plus a [`LoopbackRemote`]
//! through which a test plays the backend's part.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use clinichat_proto::message::ParticipantId;
use clinichat_proto::push::{Credential, InboundEvent};

use super::{ChannelError, Connector, PushChannel};

/// In-process push channel backed by `tokio::sync::mpsc`.
///
/// Outbound sends arrive on the far side as [`InboundEvent`]s carrying the
/// local id as sender and the addressee as receiver.
pub struct LoopbackChannel {
    local_id: ParticipantId,
    tx: mpsc::Sender<InboundEvent>,
    rx: Mutex<mpsc::Receiver<InboundEvent>>,
    closed: AtomicBool,
}

impl LoopbackChannel {
    /// Creates two channels connected to each other.
    pub fn create_pair(id_a: ParticipantId, id_b: ParticipantId, buffer: usize) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(buffer);
        let (tx_b, rx_b) = mpsc::channel(buffer);
        (Self::wire(id_a, tx_b, rx_a), Self::wire(id_b, tx_a, rx_b))
    }

    /// Creates a channel whose far side is driven by the returned remote.
    pub fn detached(local_id: ParticipantId, buffer: usize) -> (Self, LoopbackRemote) {
        let (sent_tx, sent_rx) = mpsc::channel(buffer);
        let (inject_tx, inject_rx) = mpsc::channel(buffer);
        let remote = LoopbackRemote {
            local_id: local_id.clone(),
            inject: inject_tx,
            sent: sent_rx,
        };
        (Self::wire(local_id, sent_tx, inject_rx), remote)
    }

    fn wire(
        local_id: ParticipantId,
        tx: mpsc::Sender<InboundEvent>,
        rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

impl PushChannel for LoopbackChannel {
    fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    async fn send(&self, to: &ParticipantId, body: &str) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }
        let event = InboundEvent::new(self.local_id.clone(), body).to(to.clone());
        self.tx
            .send(event)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<InboundEvent, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(ChannelError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // A pending recv holds the lock; it observes the flag on its next call.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

/// The backend side of a detached [`LoopbackChannel`].
///
/// Dropping the remote closes the channel from the backend's side.
pub struct LoopbackRemote {
    local_id: ParticipantId,
    inject: mpsc::Sender<InboundEvent>,
    sent: mpsc::Receiver<InboundEvent>,
}

impl LoopbackRemote {
    /// The participant the channel belongs to.
    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Pushes an inbound event to the channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionClosed`] if the channel was dropped
    /// or closed.
    pub async fn inject(&self, event: InboundEvent) -> Result<(), ChannelError> {
        self.inject
            .send(event)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Waits for the next message the channel sent.
    pub async fn next_sent(&mut self) -> Option<InboundEvent> {
        self.sent.recv().await
    }
}

/// [`Connector`] producing detached loopback channels.
///
/// Each successful connect hands its [`LoopbackRemote`] out through the
/// receiver returned by [`LoopbackConnector::new`].
pub struct LoopbackConnector {
    buffer: usize,
    remotes: mpsc::UnboundedSender<LoopbackRemote>,
    refuse: AtomicBool,
}

impl LoopbackConnector {
    /// Creates a connector and the stream of remotes it produces.
    #[must_use]
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<LoopbackRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            buffer,
            remotes: tx,
            refuse: AtomicBool::new(false),
        };
        (connector, rx)
    }

    /// Makes subsequent connects fail as if the backend were down.
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Connector for LoopbackConnector {
    type Channel = LoopbackChannel;

    async fn connect(&self, credential: &Credential) -> Result<LoopbackChannel, ChannelError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::Unreachable("loopback".to_string()));
        }
        let local_id = match credential {
            Credential::Guest(id) => id.clone(),
            Credential::Token(token) => ParticipantId::new(token.as_str()),
        };
        let (channel, remote) = LoopbackChannel::detached(local_id, self.buffer);
        self.remotes
            .send(remote)
            .map_err(|_| ChannelError::ConnectionClosed)?;
        Ok(channel)
    }
}
