#![forbid(unsafe_code)]

//! Agent session orchestration: one exclusive agent CLI process per work
//! target, a persisted lifecycle state machine, and live event delivery to
//! observers over Server-Sent Events.

pub mod api;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
