//! In-memory store implementations
//!
//! Used in dev mode (no `DATABASE_URL`) and by the test suite. Each store
//! keeps its rows behind a single `RwLock`, so multi-row operations such as
//! logout-all and rotation are atomic with respect to other callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::RwLock;

use crate::core::db::models::{
    Identity, IdentityId, IdentityUpdate, NewIdentity, NewSession, Role, SessionRecord,
};
use crate::core::db::store::{CredentialStore, SessionStore, StoreError};

/// In-memory identity table
#[derive(Default)]
pub struct MemoryCredentialStore {
    identities: RwLock<HashMap<IdentityId, Identity>>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Attach an API key digest to an identity
    pub async fn set_api_key_hash(&self, id: IdentityId, key_hash: &str) {
        if let Some(identity) = self.identities.write().await.get_mut(&id) {
            identity.api_key_hash = Some(key_hash.to_string());
        }
    }

    /// Overwrite the stored role (roles have no update path in the core)
    pub async fn set_role(&self, id: IdentityId, role: Role) {
        if let Some(identity) = self.identities.write().await.get_mut(&id) {
            identity.role = role;
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("credential store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_identity_by_id(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        self.check_available()?;
        Ok(self.identities.read().await.get(&id).cloned())
    }

    async fn find_identity_by_email(&self, email: &str) -> Result<Option<Identity>, StoreError> {
        self.check_available()?;
        Ok(self
            .identities
            .read()
            .await
            .values()
            .find(|i| i.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_identity_by_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<Identity>, StoreError> {
        self.check_available()?;
        Ok(self
            .identities
            .read()
            .await
            .values()
            .find(|i| i.api_key_hash.as_deref() == Some(key_hash))
            .cloned())
    }

    async fn create_identity(&self, identity: NewIdentity) -> Result<Identity, StoreError> {
        self.check_available()?;
        let mut identities = self.identities.write().await;

        if identities
            .values()
            .any(|i| i.email.eq_ignore_ascii_case(&identity.email))
        {
            return Err(StoreError::EmailAlreadyExists);
        }

        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = Identity {
            id,
            email: identity.email,
            password_hash: identity.password_hash,
            role: identity.role,
            is_active: true,
            email_verified: false,
            first_name: identity.first_name,
            last_name: identity.last_name,
            api_key_hash: None,
            created_at: now,
            updated_at: now,
            last_activity_at: None,
            last_login_at: None,
        };
        identities.insert(id, row.clone());
        Ok(row)
    }

    async fn update_identity(
        &self,
        id: IdentityId,
        fields: IdentityUpdate,
    ) -> Result<Option<Identity>, StoreError> {
        self.check_available()?;
        let mut identities = self.identities.write().await;

        if let Some(ref email) = fields.email
            && identities
                .values()
                .any(|i| i.id != id && i.email.eq_ignore_ascii_case(email))
        {
            return Err(StoreError::EmailAlreadyExists);
        }

        let Some(identity) = identities.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(email) = fields.email {
            identity.email = email;
        }
        if let Some(first_name) = fields.first_name {
            identity.first_name = first_name;
        }
        if let Some(last_name) = fields.last_name {
            identity.last_name = last_name;
        }
        if let Some(password_hash) = fields.password_hash {
            identity.password_hash = password_hash;
        }
        if let Some(is_active) = fields.is_active {
            identity.is_active = is_active;
        }
        if let Some(last_login_at) = fields.last_login_at {
            identity.last_login_at = Some(last_login_at);
        }
        identity.updated_at = Utc::now();

        Ok(Some(identity.clone()))
    }

    async fn update_last_activity(
        &self,
        id: IdentityId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        match self.identities.write().await.get_mut(&id) {
            Some(identity) => {
                identity.last_activity_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

/// In-memory session table, keyed by token digest
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored rows, expired ones included
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("session store offline".to_string()));
        }
        Ok(())
    }

    fn to_record(&self, session: NewSession) -> SessionRecord {
        SessionRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            identity_id: session.identity_id,
            token_hash: session.token_hash,
            expires_at: session.expires_at,
            ip_address: session.ip_address,
            user_agent: session.user_agent,
            created_at: session.created_at,
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: NewSession) -> Result<SessionRecord, StoreError> {
        self.check_available()?;
        let record = self.to_record(session);
        self.sessions
            .write()
            .await
            .insert(record.token_hash.clone(), record.clone());
        Ok(record)
    }

    async fn find_session_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.check_available()?;
        Ok(self.sessions.read().await.get(token_hash).cloned())
    }

    async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.sessions.write().await.remove(token_hash).is_some())
    }

    async fn delete_all_sessions_for_identity(&self, id: IdentityId) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.identity_id != id);
        Ok((before - sessions.len()) as u64)
    }

    async fn delete_other_sessions(
        &self,
        id: IdentityId,
        keep_hash: &str,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|hash, s| s.identity_id != id || hash == keep_hash);
        Ok((before - sessions.len()) as u64)
    }

    async fn rotate_session(
        &self,
        old_hash: &str,
        replacement: NewSession,
    ) -> Result<Option<SessionRecord>, StoreError> {
        self.check_available()?;
        let mut sessions = self.sessions.write().await;

        if sessions.remove(old_hash).is_none() {
            return Ok(None);
        }

        let record = self.to_record(replacement);
        sessions.insert(record.token_hash.clone(), record.clone());
        Ok(Some(record))
    }

    async fn list_sessions_for_identity(
        &self,
        id: IdentityId,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.check_available()?;
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.identity_id == id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - sessions.len()) as u64)
    }
}
