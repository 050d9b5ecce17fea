//! Clinichat development backend library.
//!
//! Exposes the backend for use in tests and embedding. It accepts push
//! channel connections, identifies each one as a staff member or a guest,
//! routes messages between them and archives everything it routes so that
//! the history, roster, unread and mark-read endpoints can answer.

pub mod config;
pub mod relay;
pub mod store;
