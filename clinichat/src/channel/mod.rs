//! Push channel abstraction.
//!
//! Defines the [`PushChannel`] trait every live transport satisfies and the
//! [`Connector`] trait that opens one for a credential. Implementations:
//! - [`loopback::LoopbackChannel`]: in-process channels for tests
//! - [`relay::RelayChannel`]: WebSocket connection to the clinic backend
//!
//! A channel carries `(counterpart, body)` sends outward and
//! [`InboundEvent`]s inward. It offers no delivery acknowledgement beyond
//! accepting a send.

pub mod loopback;
pub mod relay;

use std::future::Future;

use clinichat_proto::codec::CodecError;
use clinichat_proto::message::ParticipantId;
use clinichat_proto::push::{Credential, InboundEvent};

/// Errors that can occur on a push channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel has been closed by either side.
    #[error("connection closed")]
    ConnectionClosed,

    /// Connecting or identifying did not finish in time.
    #[error("push channel operation timed out")]
    Timeout,

    /// The backend could not be reached at all.
    #[error("backend {0} is unreachable")]
    Unreachable(String),

    /// The backend refused the credential or the request.
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// A frame could not be encoded or decoded.
    #[error("frame codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("push channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live, bidirectional push connection owned by one participant.
pub trait PushChannel: Send + Sync {
    /// The participant this connection was opened for.
    fn local_id(&self) -> &ParticipantId;

    /// Hands a message to the channel. Fire-and-forget.
    ///
    /// `Ok` means the channel accepted the message, nothing more.
    fn send(
        &self,
        to: &ParticipantId,
        body: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Waits for the next inbound event, in channel delivery order.
    fn recv(&self) -> impl Future<Output = Result<InboundEvent, ChannelError>> + Send;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Releases the channel. Further sends fail with
    /// [`ChannelError::ConnectionClosed`].
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens push channels.
pub trait Connector: Send + Sync {
    /// The channel type produced.
    type Channel: PushChannel + 'static;

    /// Opens a channel authenticated with `credential`.
    fn connect(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Self::Channel, ChannelError>> + Send;
}
