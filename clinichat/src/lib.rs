//! `clinichat`: realtime conversation synchronization for clinic chat.
//!
//! Keeps the one-to-one conversations of a signed-in staff member or guest
//! consistent across a live push channel, fetched history and session
//! storage. See [`sync::ConversationSync`] for the engine and
//! [`client::Client`] for the coordinator that drives one engine per
//! [`Universe`](clinichat_proto::scope::Universe).

pub mod channel;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod identity;
pub mod persist;
pub mod rank;
pub mod store;
pub mod sync;
