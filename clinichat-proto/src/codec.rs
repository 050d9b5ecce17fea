//! Serialization and deserialization for push channel frames.
//!
//! Frames are encoded with postcard. WebSocket preserves message boundaries,
//! so no length prefix is added.

use crate::push::PushFrame;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a [`PushFrame`] into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode(frame: &PushFrame) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`PushFrame`] from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode(bytes: &[u8]) -> Result<PushFrame, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ParticipantId, Timestamp};
    use crate::push::{Credential, InboundEvent};

    #[test]
    fn identify_with_token_round_trip() {
        let frame = PushFrame::Identify {
            credential: Credential::Token("s3cret".into()),
        };
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn inbound_with_missing_fields_round_trip() {
        let frame = PushFrame::Inbound(InboundEvent {
            sender_id: None,
            body: Some("orphan".into()),
            receiver_id: None,
            timestamp: None,
        });
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn inbound_full_round_trip() {
        let frame = PushFrame::Inbound(
            InboundEvent::new(ParticipantId::new("guest-1"), "Hello")
                .to(ParticipantId::new("dr-a"))
                .at(Timestamp::from_millis(36_000_000)),
        );
        let decoded = decode(&encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_input_is_error() {
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn garbage_input_is_error() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
