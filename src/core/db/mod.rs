//! Storage for authgate
//!
//! Identity and session models, the store traits the auth core consumes,
//! and two implementations of them: PostgreSQL repositories and in-memory
//! tables.

pub mod memory;
pub mod models;
pub mod pool;
pub mod repositories;
pub mod store;

// Re-export commonly used items
pub use memory::{MemoryCredentialStore, MemorySessionStore};
pub use models::*;
pub use pool::{DbConfig, DbError, connect, health_check};
pub use repositories::{IdentityRepository, SessionRepository};
pub use store::{CredentialStore, SessionStore, StoreError};

pub use sqlx::PgPool;
