//! Domain models for sessions, targets, and events.

pub mod event;
pub mod session;
pub mod target;
