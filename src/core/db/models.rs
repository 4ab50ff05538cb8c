//! Database models for authgate
//!
//! This module defines the entity structs that map to the `identities` and
//! `sessions` tables, plus the DTOs used to create and update them.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Numeric identity key
pub type IdentityId = i64;

// ============================================================================
// Identity Model
// ============================================================================

/// Account role. Fixed at creation time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Display, Default,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[display("admin")]
    Admin,
    #[default]
    #[display("customer")]
    Customer,
}

/// Identity entity representing an account
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Identity {
    pub id: IdentityId,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub email_verified: bool,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing)]
    pub api_key_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Identity data for creation (password already hashed)
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
}

/// Partial identity update. `None` leaves the column untouched.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentityUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(skip)]
    pub password_hash: Option<String>,
    #[serde(skip)]
    pub is_active: Option<bool>,
    #[serde(skip)]
    pub last_login_at: Option<DateTime<Utc>>,
}

impl IdentityUpdate {
    /// True when no column would change
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.first_name.is_none()
            && self.last_name.is_none()
            && self.password_hash.is_none()
            && self.is_active.is_none()
            && self.last_login_at.is_none()
    }
}

/// Identity without sensitive data (for API responses)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityResponse {
    pub id: IdentityId,
    pub email: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl From<Identity> for IdentityResponse {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.id,
            email: identity.email,
            role: identity.role,
            first_name: identity.first_name,
            last_name: identity.last_name,
            is_active: identity.is_active,
            email_verified: identity.email_verified,
            created_at: identity.created_at,
            last_login_at: identity.last_login_at,
        }
    }
}

// ============================================================================
// Session Model
// ============================================================================

/// One issued refresh token. The raw token is never stored, only its digest.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRecord {
    pub id: i64,
    pub identity_id: IdentityId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Session data for creation
#[derive(Debug, Clone)]
pub struct NewSession {
    pub identity_id: IdentityId,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Session summary for "your devices" listings
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionInfo {
    fn from(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            ip_address: record.ip_address,
            user_agent: record.user_agent,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
