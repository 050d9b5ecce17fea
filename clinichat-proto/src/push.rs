//! Push channel wire types.
//!
//! Frames travel as postcard-encoded WebSocket binary messages between a
//! client and the backend. The client identifies itself once per connection;
//! afterwards it sends `Send` frames and receives `Inbound` frames.

use serde::{Deserialize, Serialize};

use crate::message::{ParticipantId, Timestamp};

/// How a connection proves who it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credential {
    /// Session token issued to an authenticated staff member.
    Token(String),
    /// Locally minted guest identifier (no authentication).
    Guest(ParticipantId),
}

impl Credential {
    /// Short label for logs. Never includes the token itself.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Guest(_) => "guest",
        }
    }
}

/// An inbound message event as delivered by the push channel.
///
/// Every field is optional on the wire. Events missing a sender or a body
/// are malformed and are discarded by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Who sent the message.
    pub sender_id: Option<ParticipantId>,
    /// Message text.
    pub body: Option<String>,
    /// Addressee; the local participant when absent.
    pub receiver_id: Option<ParticipantId>,
    /// Server timestamp; receipt time when absent.
    pub timestamp: Option<Timestamp>,
}

impl InboundEvent {
    /// Creates a well-formed event with the mandatory fields.
    pub fn new(sender_id: ParticipantId, body: impl Into<String>) -> Self {
        Self {
            sender_id: Some(sender_id),
            body: Some(body.into()),
            receiver_id: None,
            timestamp: None,
        }
    }

    /// Sets the addressee.
    #[must_use]
    pub fn to(mut self, receiver_id: ParticipantId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    /// Sets the server timestamp.
    #[must_use]
    pub const fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Frames exchanged over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushFrame {
    /// Client identifies the connection. Must be the first frame sent.
    Identify {
        /// Proof of identity.
        credential: Credential,
    },

    /// Server accepted the identification.
    Identified {
        /// The participant the connection now belongs to.
        participant: ParticipantId,
    },

    /// Client sends a message to a counterpart. Fire-and-forget.
    Send {
        /// Addressee.
        to: ParticipantId,
        /// Message text.
        body: String,
    },

    /// Server pushes a message to the client.
    Inbound(InboundEvent),

    /// Server reports an error condition.
    Error {
        /// Human-readable error description.
        reason: String,
    },
}
