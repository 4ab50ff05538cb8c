//! Record-access seams consumed by the auth core
//!
//! Both stores return `Ok(None)` for absence and reserve `Err` for storage
//! failures. Handles are constructed by the process entry point and injected
//! as `Arc<dyn ...>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::db::models::{
    Identity, IdentityId, IdentityUpdate, NewIdentity, NewSession, SessionRecord,
};

/// Storage failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Email already exists")]
    EmailAlreadyExists,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Persistent identity records
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_identity_by_id(&self, id: IdentityId) -> Result<Option<Identity>, StoreError>;

    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, StoreError>;

    /// Look up by the SHA-256 hex digest of an API key
    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<Identity>, StoreError>;

    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, StoreError>;

    /// Returns `Ok(None)` when no identity has this id
    async fn update_identity(
        &self,
        id: IdentityId,
        fields: IdentityUpdate,
    ) -> Result<Option<Identity>, StoreError>;

    async fn update_last_activity(
        &self,
        id: IdentityId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Persistent refresh-token sessions, keyed by token digest
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: NewSession) -> Result<SessionRecord, StoreError>;

    async fn find_session_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Returns whether a record was removed
    async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError>;

    /// Removes every session of the identity in one atomic step
    async fn delete_all_sessions_for_identity(&self, id: IdentityId) -> Result<u64, StoreError>;

    /// Removes every session of the identity except the one with `keep_hash`
    async fn delete_other_sessions(
        &self,
        id: IdentityId,
        keep_hash: &str,
    ) -> Result<u64, StoreError>;

    /// Atomically replaces `old_hash` with `replacement`.
    /// Returns `Ok(None)` if `old_hash` was already gone.
    async fn rotate_session(
        &self,
        old_hash: &str,
        replacement: NewSession,
    ) -> Result<Option<SessionRecord>, StoreError>;

    async fn list_sessions_for_identity(
        &self,
        id: IdentityId,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Deletes every session whose expiry is at or before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::NotFound.to_string(), "Record not found");
        assert_eq!(
            StoreError::EmailAlreadyExists.to_string(),
            "Email already exists"
        );
        assert_eq!(
            StoreError::Unavailable("pool closed".to_string()).to_string(),
            "Storage unavailable: pool closed"
        );
    }
}
