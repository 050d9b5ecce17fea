//! Request/response collaborators: history, roster, unread counters.
//!
//! Defines the [`Gateway`] trait the synchronization engine fetches through.
//! Implementations:
//! - [`http::HttpGateway`]: JSON over HTTP against the clinic backend
//! - [`memory::InMemoryGateway`]: scripted responses for tests
//!
//! Gateway errors are returned as-is; the engine decides how to degrade.

pub mod http;
pub mod memory;

use std::future::Future;

use clinichat_proto::api::{RosterEntry, UnreadCounts};
use clinichat_proto::message::{Message, ParticipantId};
use clinichat_proto::scope::Universe;

/// Errors that can occur when talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request could not be sent or the body could not be decoded.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("{path} returned HTTP {status}")]
    Status {
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
    },

    /// The configured base URL cannot be combined with a route.
    #[error("invalid backend URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The backend is unreachable or refused the call.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Async access to the backend's request/response endpoints.
pub trait Gateway: Send + Sync {
    /// Prior messages between `self_id` and `counterpart`, oldest first.
    fn fetch_history(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<Message>, GatewayError>> + Send;

    /// Counterparts available to `self_id` within `universe`.
    fn fetch_roster(
        &self,
        universe: Universe,
        self_id: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, GatewayError>> + Send;

    /// Server-side unread counters of `self_id`.
    fn fetch_unread_counts(
        &self,
        self_id: &ParticipantId,
    ) -> impl Future<Output = Result<UnreadCounts, GatewayError>> + Send;

    /// Tells the backend every message from `counterpart` was read.
    ///
    /// Resolves to the number of messages the backend changed.
    fn mark_conversation_read(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> impl Future<Output = Result<u32, GatewayError>> + Send;
}

impl<G: Gateway> Gateway for std::sync::Arc<G> {
    fn fetch_history(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<Message>, GatewayError>> + Send {
        (**self).fetch_history(self_id, counterpart)
    }

    fn fetch_roster(
        &self,
        universe: Universe,
        self_id: &ParticipantId,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, GatewayError>> + Send {
        (**self).fetch_roster(universe, self_id)
    }

    fn fetch_unread_counts(
        &self,
        self_id: &ParticipantId,
    ) -> impl Future<Output = Result<UnreadCounts, GatewayError>> + Send {
        (**self).fetch_unread_counts(self_id)
    }

    fn mark_conversation_read(
        &self,
        self_id: &ParticipantId,
        counterpart: &ParticipantId,
    ) -> impl Future<Output = Result<u32, GatewayError>> + Send {
        (**self).mark_conversation_read(self_id, counterpart)
    }
}
