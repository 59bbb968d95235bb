//! Persistence layer modules (§6).

pub mod config_repo;
pub mod db;
pub mod message_repo;
pub mod retention;
pub mod schema;
pub mod session_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
