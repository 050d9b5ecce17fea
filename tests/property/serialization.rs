//! Property-based wire format tests.
//!
//! Uses proptest to verify:
//! 1. Any push frame survives encode → decode.
//! 2. Random bytes never cause a panic in `decode` (returns `Err` gracefully).
//! 3. Messages survive the JSON form used by the history endpoint and the
//!    session snapshot, including the camelCase field names.

use clinichat_proto::codec;
use clinichat_proto::message::{Message, ParticipantId, Timestamp};
use clinichat_proto::push::{Credential, InboundEvent, PushFrame};
use proptest::prelude::*;

/// Strategy for participant ids, mixing staff slugs and guest ids.
fn arb_participant() -> impl Strategy<Value = ParticipantId> {
    prop_oneof![
        "[a-z]{1,8}-[a-z]{1,8}".prop_map(ParticipantId::new),
        "[0-9a-f]{8}".prop_map(|s| ParticipantId::new(format!("guest-{s}"))),
    ]
}

/// Strategy for arbitrary messages with arbitrary status flags.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        arb_participant(),
        arb_participant(),
        "[^\x00]{1,256}",
        any::<u64>(),
        any::<bool>(),
        any::<bool>(),
        proptest::option::of("[a-z0-9]{1,12}"),
    )
        .prop_map(|(sender, receiver, body, ts, delivered, read, id)| Message {
            sender_id: sender,
            receiver_id: receiver,
            body,
            timestamp: Timestamp::from_millis(ts),
            delivered,
            read,
            id,
        })
}

/// Strategy for inbound events, including malformed ones.
fn arb_inbound() -> impl Strategy<Value = InboundEvent> {
    (
        proptest::option::of(arb_participant()),
        proptest::option::of("[^\x00]{0,128}"),
        proptest::option::of(arb_participant()),
        proptest::option::of(any::<u64>().prop_map(Timestamp::from_millis)),
    )
        .prop_map(|(sender_id, body, receiver_id, timestamp)| InboundEvent {
            sender_id,
            body,
            receiver_id,
            timestamp,
        })
}

/// Strategy for every push frame variant.
fn arb_frame() -> impl Strategy<Value = PushFrame> {
    prop_oneof![
        ".{0,64}".prop_map(|t| PushFrame::Identify {
            credential: Credential::Token(t)
        }),
        arb_participant().prop_map(|p| PushFrame::Identify {
            credential: Credential::Guest(p)
        }),
        arb_participant().prop_map(|participant| PushFrame::Identified { participant }),
        (arb_participant(), "[^\x00]{1,256}").prop_map(|(to, body)| PushFrame::Send { to, body }),
        arb_inbound().prop_map(PushFrame::Inbound),
        ".*".prop_map(|reason| PushFrame::Error { reason }),
    ]
}

proptest! {
    /// Any push frame survives an encode → decode round-trip.
    #[test]
    fn push_frame_round_trip(frame in arb_frame()) {
        let bytes = codec::encode(&frame).expect("encode should succeed");
        let decoded = codec::decode(&bytes).expect("decode should succeed");
        prop_assert_eq!(frame, decoded);
    }

    /// Random bytes never cause a panic when decoded.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
    }

    /// Messages survive the JSON representation used by REST and snapshots.
    #[test]
    fn message_json_round_trip(msg in arb_message()) {
        let json = serde_json::to_string(&msg).expect("serialize should succeed");
        prop_assert!(json.contains("\"senderId\""));
        let decoded: Message = serde_json::from_str(&json).expect("deserialize should succeed");
        prop_assert_eq!(msg, decoded);
    }
}

/// History payloads from older backends omit the status flags and id.
#[test]
fn message_json_defaults_missing_status() {
    let json = r#"{"senderId":"guest-1","receiverId":"dr-a","body":"Hi","timestamp":5}"#;
    let msg: Message = serde_json::from_str(json).unwrap();
    assert!(!msg.delivered);
    assert!(!msg.read);
    assert!(msg.id.is_none());
}
