//! Owner of the single live push channel of a signed-in identity.
//!
//! [`ConnectionManager`] opens at most one channel at a time, pumps its
//! inbound events into an mpsc stream of [`ConnectionEvent`]s, and is the
//! only component that sends through it. It never reconnects on its own:
//! after a transport failure the stream yields [`ConnectionEvent::Closed`]
//! and the caller decides when to call [`ConnectionManager::open`] again.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use clinichat_proto::message::ParticipantId;
use clinichat_proto::push::{Credential, InboundEvent};

use crate::channel::{ChannelError, Connector, PushChannel};

/// Events emitted on the connection stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// An event arrived on the push channel.
    Inbound(InboundEvent),
    /// The channel dropped. Nothing more arrives until it is re-opened.
    Closed {
        /// Why the channel ended.
        reason: String,
    },
}

struct Active<Ch> {
    credential: Credential,
    channel: Arc<Ch>,
    pump: JoinHandle<()>,
}

/// Opens, holds and closes the push channel.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    active: Option<Active<C::Channel>>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager with no open channel.
    ///
    /// Returns the manager and the receiving end of its event stream.
    #[must_use]
    pub fn new(connector: C, buffer: usize) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let manager = Self {
            connector,
            active: None,
            events: tx,
        };
        (manager, rx)
    }

    /// Opens a channel for `credential`.
    ///
    /// Returns `Ok(false)` without doing anything if a live channel for the
    /// same credential already exists. A dead channel, or one opened for a
    /// different credential, is released first.
    ///
    /// # Errors
    ///
    /// Returns the connector's [`ChannelError`] if the channel cannot be
    /// opened.
    pub async fn open(&mut self, credential: Credential) -> Result<bool, ChannelError> {
        if let Some(active) = &self.active
            && active.credential == credential
            && active.channel.is_open()
        {
            tracing::debug!(kind = credential.kind(), "push channel already open");
            return Ok(false);
        }
        self.close().await;

        let channel = Arc::new(self.connector.connect(&credential).await?);
        let pump = tokio::spawn(pump(Arc::clone(&channel), self.events.clone()));
        tracing::info!(participant = %channel.local_id(), "push channel opened");

        self.active = Some(Active {
            credential,
            channel,
            pump,
        });
        Ok(true)
    }

    /// Hands a message to the open channel.
    ///
    /// A failed send tears the channel down.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::ConnectionClosed`] if no channel is open, or
    /// the channel's error if it refused the message.
    pub async fn send(&mut self, to: &ParticipantId, body: &str) -> Result<(), ChannelError> {
        let Some(active) = &self.active else {
            return Err(ChannelError::ConnectionClosed);
        };
        let result = active.channel.send(to, body).await;
        if let Err(err) = &result {
            tracing::warn!(to = %to, error = %err, "send failed, closing push channel");
            self.close().await;
        }
        result
    }

    /// Releases the channel, if any. Returns whether one was open.
    pub async fn close(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.pump.abort();
        active.channel.close().await;
        tracing::info!(participant = %active.channel.local_id(), "push channel closed");
        true
    }

    /// Whether a live channel is held.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.channel.is_open() && !a.pump.is_finished())
    }

    /// The participant the open channel belongs to.
    #[must_use]
    pub fn identity(&self) -> Option<&ParticipantId> {
        self.active.as_ref().map(|a| a.channel.local_id())
    }
}

/// Background task: forwards inbound events until the channel fails.
async fn pump<Ch: PushChannel>(channel: Arc<Ch>, events: mpsc::Sender<ConnectionEvent>) {
    loop {
        match channel.recv().await {
            Ok(event) => {
                if events.send(ConnectionEvent::Inbound(event)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "push channel dropped");
                let _ = events
                    .send(ConnectionEvent::Closed {
                        reason: err.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}
