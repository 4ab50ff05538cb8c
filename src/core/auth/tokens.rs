//! Token service
//!
//! Issues access tokens (signed claim sets) and refresh tokens (opaque random
//! strings whose only meaning is their presence in the session store), and
//! performs first-level verification of access tokens against the clock.

use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::auth::jwt::{AccessClaims, CLAIMS_VERSION, ClaimedIdentity, CodecError, TokenCodec};
use crate::core::clock::Clock;
use crate::core::config::AuthConfig;
use crate::core::db::models::Identity;

/// Window before expiry in which a token is reported as expiring soon
pub const EXPIRING_SOON_SECS: i64 = 300;

/// Refresh token entropy in bytes
const REFRESH_TOKEN_BYTES: usize = 48;

/// Seconds as a duration, saturating where chrono cannot represent them
pub(crate) fn saturating_seconds(secs: i64) -> Duration {
    Duration::try_seconds(secs).unwrap_or(if secs < 0 { Duration::MIN } else { Duration::MAX })
}

/// Token verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token claims")]
    MalformedClaims,

    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

impl From<CodecError> for TokenError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed => TokenError::Malformed,
            CodecError::InvalidSignature => TokenError::InvalidSignature,
            CodecError::MalformedClaims => TokenError::MalformedClaims,
            CodecError::Encoding(msg) => TokenError::Encoding(msg),
        }
    }
}

/// A freshly signed access token
#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub claims: AccessClaims,
}

impl IssuedAccessToken {
    pub fn expires_at(&self) -> i64 {
        self.claims.exp
    }
}

/// Claims that passed verification
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub claims: AccessClaims,
    /// Advisory: the client should refresh proactively
    pub expiring_soon: bool,
}

/// Token pair (access + refresh) as returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    /// Access token (short-lived)
    pub access_token: String,
    /// Refresh token (long-lived, opaque)
    pub refresh_token: String,
    /// Access token expiration (Unix timestamp)
    pub access_expires_at: i64,
    /// Refresh token expiration (Unix timestamp)
    pub refresh_expires_at: i64,
    /// Always "Bearer"
    pub token_type: String,
}

impl TokenPair {
    pub fn new(access: &IssuedAccessToken, refresh_token: String, refresh_expires_at: i64) -> Self {
        Self {
            access_token: access.token.clone(),
            refresh_token,
            access_expires_at: access.expires_at(),
            refresh_expires_at,
            token_type: "Bearer".to_string(),
        }
    }
}

/// SHA-256 hex digest under which a refresh token is stored
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Issuance and verification of access tokens
#[derive(Clone)]
pub struct TokenService {
    codec: TokenCodec,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            codec: TokenCodec::new(config.jwt_secret.as_bytes(), config.issuer.clone()),
            access_ttl: saturating_seconds(config.access_token_ttl_secs),
            refresh_ttl: saturating_seconds(config.refresh_token_ttl_secs),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Absolute expiry of a refresh token issued at `now`
    pub fn refresh_expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, TokenError> {
        now.checked_add_signed(self.refresh_ttl)
            .ok_or_else(|| TokenError::Encoding("refresh token expiry out of range".to_string()))
    }

    /// Sign a claim set for `identity`, valid for the configured lifetime
    pub fn issue_access_token(&self, identity: &Identity) -> Result<IssuedAccessToken, TokenError> {
        let now = self.clock.now();
        let exp = now
            .checked_add_signed(self.access_ttl)
            .ok_or_else(|| TokenError::Encoding("access token expiry out of range".to_string()))?;

        let claims = AccessClaims {
            ver: CLAIMS_VERSION,
            sub: identity.id,
            role: identity.role,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.codec.issuer().to_string(),
            jti: Uuid::new_v4().to_string(),
            user: ClaimedIdentity {
                id: identity.id,
                email: identity.email.clone(),
                role: identity.role,
            },
        };

        let token = self.codec.encode(&claims)?;
        Ok(IssuedAccessToken { token, claims })
    }

    /// Random opaque refresh token, hex encoded
    pub fn issue_refresh_token(&self) -> String {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Decode, then check expiry against the clock
    pub fn verify_access_token(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let claims = self.codec.decode(token)?;
        let now = self.clock.now().timestamp();

        if now >= claims.exp {
            tracing::debug!(sub = claims.sub, exp = claims.exp, "Access token expired");
            return Err(TokenError::Expired);
        }

        let expiring_soon = now + EXPIRING_SOON_SECS >= claims.exp;
        if expiring_soon {
            tracing::warn!(
                sub = claims.sub,
                remaining_secs = claims.exp - now,
                "Access token expires soon"
            );
        }

        Ok(VerifiedToken {
            claims,
            expiring_soon,
        })
    }
}
