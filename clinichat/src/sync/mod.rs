//! Conversation synchronization for one identity in one universe.
//!
//! [`ConversationSync`] folds live push events and fetched history into a
//! [`ConversationStore`](crate::store::ConversationStore), tracks delivery
//! and read state, keeps per-counterpart unread counters, and mirrors
//! everything into session storage after each change.
//!
//! All state transitions are synchronous `&mut self` calls; only the
//! gateway round-trips are `async`. Observers subscribe to [`SyncEvent`]s.

pub mod engine;
pub mod ledger;
pub mod merge;
pub mod status;

use std::time::Duration;

use clinichat_proto::message::{
    COALESCE_WINDOW_MS, DeliveryState, Message, MessageKey, ParticipantId, ValidationError,
};
use clinichat_proto::scope::Universe;

pub use self::engine::ConversationSync;
pub use self::ledger::{DEFAULT_LEDGER_CAPACITY, ProcessedLedger};
pub use self::merge::{dedup, merge};
pub use self::status::{PendingUpdates, StatusUpdate};

/// Errors returned for rejected local actions.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The message body is not acceptable.
    #[error("invalid message: {0}")]
    Invalid(#[from] ValidationError),

    /// The counterpart belongs to the other universe.
    #[error("{counterpart} is outside the {universe} universe")]
    WrongUniverse {
        /// The rejected counterpart.
        counterpart: ParticipantId,
        /// The universe of the engine that rejected it.
        universe: Universe,
    },
}

/// Tunables of a [`ConversationSync`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages closer than this with equal content are one message.
    pub coalesce_window_ms: u64,
    /// Number of inbound message keys remembered for redelivery checks.
    pub ledger_capacity: usize,
    /// Delay after delivery at which an outbound message counts as read.
    /// `None` disables simulated read receipts.
    pub read_receipt_delay: Option<Duration>,
    /// Capacity of the [`SyncEvent`] broadcast channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: COALESCE_WINDOW_MS,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            read_receipt_delay: Some(Duration::from_secs(3)),
            event_buffer: 64,
        }
    }
}

/// Notifications published by a [`ConversationSync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A new message entered a conversation.
    MessageAdded {
        /// Conversation the message belongs to.
        counterpart: ParticipantId,
        /// The message as stored.
        message: Message,
    },
    /// A message moved to a new delivery state.
    StatusChanged {
        /// Conversation the message belongs to.
        counterpart: ParticipantId,
        /// Identity of the message.
        key: MessageKey,
        /// The state it moved to.
        state: DeliveryState,
    },
    /// A conversation's unread counter changed.
    UnreadChanged {
        /// The conversation.
        counterpart: ParticipantId,
        /// New counter value.
        unread: usize,
    },
    /// Fetched history was merged into a conversation.
    HistoryLoaded {
        /// The conversation.
        counterpart: ParticipantId,
        /// Messages the conversation gained.
        added: usize,
    },
    /// The ranked conversation list may have changed.
    ConversationsChanged,
}

/// What [`ConversationSync::ingest`] did with an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new message was added.
    Added,
    /// The event duplicated a stored message and enriched its status.
    Merged,
    /// The event was already processed and changed nothing.
    Duplicate,
    /// The event lacked a sender or a valid body.
    Malformed,
    /// The event does not belong to this identity or universe.
    Foreign,
}
