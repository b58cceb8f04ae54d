//! Persistence layer modules.

pub mod db;
pub mod schema;
pub mod session_repo;

pub use session_repo::{SessionRepo, SessionStore, StatusUpdate};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
