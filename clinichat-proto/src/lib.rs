//! Shared data model and wire definitions for `Clinichat`.

pub mod api;
pub mod codec;
pub mod message;
pub mod push;
pub mod scope;
