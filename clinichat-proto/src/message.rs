//! Message model shared by the synchronization engine and the backend.
//!
//! Message identity is logical: two messages are the same message when
//! sender, receiver and body match and their timestamps fall within the
//! coalescing window. The optional server id never participates in identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message body size in bytes (64 KB).
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Two otherwise-equal messages closer than this are one message.
pub const COALESCE_WINDOW_MS: u64 = 1000;

/// Prefix carried by every locally minted guest identifier.
pub const GUEST_PREFIX: &str = "guest-";

/// Identifies a chat participant: an authenticated staff member or a guest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Creates a participant identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh anonymous guest identifier (`guest-<uuid v7>`).
    #[must_use]
    pub fn mint_guest() -> Self {
        Self(format!("{GUEST_PREFIX}{}", Uuid::now_v7()))
    }

    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted for an anonymous visitor.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.0.starts_with(GUEST_PREFIX)
    }

    /// Whether the identifier is empty (never valid on the wire).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Millisecond-precision wall-clock instant (UNIX epoch based).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two instants in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Returns this instant shifted forward by `millis`, saturating.
    #[must_use]
    pub const fn saturating_add(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Error returned when a message body fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message body is empty.
    #[error("message body is empty")]
    Empty,
    /// Message body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Checks that a body is non-empty and within [`MAX_BODY_SIZE`].
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for an empty (or whitespace-only)
/// body and [`ValidationError::TooLarge`] when it exceeds the size limit.
pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if body.len() > MAX_BODY_SIZE {
        return Err(ValidationError::TooLarge {
            size: body.len(),
            max: MAX_BODY_SIZE,
        });
    }
    Ok(())
}

/// A single one-to-one chat message.
///
/// Immutable apart from `delivered` and `read`, which only ever move from
/// `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Who wrote the message.
    pub sender_id: ParticipantId,
    /// Who the message is addressed to.
    pub receiver_id: ParticipantId,
    /// Text content.
    pub body: String,
    /// When the message was created.
    pub timestamp: Timestamp,
    /// The channel accepted (outbound) or delivered (inbound) the message.
    #[serde(default)]
    pub delivered: bool,
    /// The receiving side has opened the message.
    #[serde(default)]
    pub read: bool,
    /// Server-assigned id; absent for locally originated or push-only messages.
    #[serde(default)]
    pub id: Option<String>,
}

impl Message {
    /// Creates a message with both status flags cleared and no server id.
    pub fn new(
        sender_id: ParticipantId,
        receiver_id: ParticipantId,
        body: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            body: body.into(),
            timestamp,
            delivered: false,
            read: false,
            id: None,
        }
    }

    /// Ledger key of this message.
    #[must_use]
    pub fn key(&self) -> MessageKey {
        MessageKey {
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            body: self.body.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Whether `other` is the same logical message as `self`.
    ///
    /// Sender, receiver and body must match exactly and the timestamps must
    /// differ by strictly less than `window_ms`.
    #[must_use]
    pub fn is_same_as(&self, other: &Self, window_ms: u64) -> bool {
        self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.body == other.body
            && self.timestamp.abs_diff(other.timestamp) < window_ms
    }

    /// The other party of the conversation, seen from `me`.
    #[must_use]
    pub fn counterpart_of(&self, me: &ParticipantId) -> &ParticipantId {
        if self.sender_id == *me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Status richness used to pick a survivor among duplicates.
    #[must_use]
    pub const fn status_rank(&self) -> u8 {
        (self.delivered as u8) + (self.read as u8) * 2
    }

    /// Folds the status of a duplicate into `self`. Never clears a flag.
    ///
    /// Returns `true` if anything changed.
    pub fn absorb(&mut self, other: &Self) -> bool {
        let mut changed = false;
        if other.delivered && !self.delivered {
            self.delivered = true;
            changed = true;
        }
        if other.read && !self.read {
            self.read = true;
            changed = true;
        }
        if self.id.is_none() && other.id.is_some() {
            self.id.clone_from(&other.id);
            changed = true;
        }
        changed
    }

    /// Sets `delivered`. Returns `true` if the flag changed.
    pub const fn mark_delivered(&mut self) -> bool {
        let changed = !self.delivered;
        self.delivered = true;
        changed
    }

    /// Sets `read` (which implies delivered). Returns `true` if `read` changed.
    pub const fn mark_read(&mut self) -> bool {
        let changed = !self.read;
        self.delivered = true;
        self.read = true;
        changed
    }
}

/// The logical identity of a message as recorded in the processed ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// Sender of the message.
    pub sender_id: ParticipantId,
    /// Receiver of the message.
    pub receiver_id: ParticipantId,
    /// Message body.
    pub body: String,
    /// Message timestamp.
    pub timestamp: Timestamp,
}

impl MessageKey {
    /// Stable string form stored in the persisted ledger.
    ///
    /// Fields are joined with the ASCII unit separator, which cannot appear
    /// in participant ids and is vanishingly rare in message bodies.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.sender_id,
            self.receiver_id,
            self.timestamp.as_millis(),
            self.body
        )
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}->{}@{}",
            self.sender_id,
            self.receiver_id,
            self.timestamp.as_millis()
        )
    }
}

/// Per-message delivery lifecycle as seen by the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Outbound, not yet accepted by the channel.
    Sent,
    /// Outbound, accepted by the channel.
    Delivered,
    /// Read by its receiver (either direction).
    Read,
    /// Inbound and not yet opened locally.
    ReceivedUnread,
}

impl DeliveryState {
    /// Derives the state of `message` from the point of view of `me`.
    #[must_use]
    pub fn of(message: &Message, me: &ParticipantId) -> Self {
        if message.read {
            Self::Read
        } else if message.sender_id != *me {
            Self::ReceivedUnread
        } else if message.delivered {
            Self::Delivered
        } else {
            Self::Sent
        }
    }

    /// Display symbol for this state.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match self {
            Self::Sent => "\u{2713}",
            Self::Delivered => "\u{2713}\u{2713}",
            Self::Read => "\u{2713}\u{2713}*",
            Self::ReceivedUnread => "\u{2022}",
        }
    }
}
