//! PostgreSQL repositories
//!
//! Each repository owns a clone of the pool and implements one of the store
//! traits from [`crate::core::db::store`].

pub mod identity;
pub mod session;

pub use identity::IdentityRepository;
pub use session::SessionRepository;
