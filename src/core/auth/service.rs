//! Session lifecycle manager
//!
//! Login, refresh, logout and logout-all-devices, plus the account flows
//! that touch sessions (registration, password change, profile update).
//! Ties the token service to the session and credential stores.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::auth::error::AuthError;
use crate::core::auth::password::{hash_password, validate_password_strength, verify_password};
use crate::core::auth::throttle::LoginThrottle;
use crate::core::auth::tokens::{TokenPair, TokenService, hash_refresh_token, saturating_seconds};
use crate::core::config::AuthConfig;
use crate::core::db::models::{
    Identity, IdentityId, IdentityResponse, IdentityUpdate, NewIdentity, NewSession, Role,
    SessionInfo,
};
use crate::core::db::store::{CredentialStore, SessionStore};

/// Requester metadata captured on session creation
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Registration request data
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Login request data
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Token refresh / logout request
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Password change request
#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    /// Session to keep signed in
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Profile fields a user may change
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Authentication response with identity data and tokens
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: IdentityResponse,
    pub tokens: TokenPair,
}

/// Basic shape check: `local@domain.tld`
pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };

    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(AuthError::InvalidEmail);
    }

    if !domain.contains('.') || domain.split('.').any(str::is_empty) {
        return Err(AuthError::InvalidEmail);
    }

    Ok(())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Session lifecycle manager
pub struct SessionManager {
    tokens: TokenService,
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<dyn SessionStore>,
    throttle: LoginThrottle,
    bcrypt_cost: u32,
    rotate_refresh_tokens: bool,
    revoke_sessions_on_password_change: bool,
    /// Verified against when the email is unknown, so timing matches a real miss
    dummy_hash: String,
}

impl SessionManager {
    pub fn new(
        config: &AuthConfig,
        tokens: TokenService,
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let throttle = LoginThrottle::new(
            config.login_max_attempts,
            saturating_seconds(i64::try_from(config.login_window_secs).unwrap_or(i64::MAX)),
            tokens.clock(),
        );
        let dummy_hash = hash_password(&tokens.issue_refresh_token(), config.bcrypt_cost)
            .unwrap_or_default();

        Self {
            tokens,
            credentials,
            sessions,
            throttle,
            bcrypt_cost: config.bcrypt_cost,
            rotate_refresh_tokens: config.rotate_refresh_tokens,
            revoke_sessions_on_password_change: config.revoke_sessions_on_password_change,
            dummy_hash,
        }
    }

    /// Register a customer account and sign it in
    pub async fn register(
        &self,
        request: RegisterRequest,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        let email = normalize_email(&request.email);
        validate_email(&email)?;
        validate_password_strength(&request.password)?;

        let password_hash = hash_password(&request.password, self.bcrypt_cost)?;
        let identity = self
            .credentials
            .create_identity(NewIdentity {
                email,
                password_hash,
                role: Role::Customer,
                first_name: request.first_name.trim().to_string(),
                last_name: request.last_name.trim().to_string(),
            })
            .await?;

        tracing::info!(identity_id = identity.id, "Identity registered");
        let identity = self.record_login(identity).await;
        self.start_session(identity, client).await
    }

    /// Verify credentials and open a new session.
    ///
    /// Unknown email, wrong password and role mismatch all fail with
    /// `InvalidCredentials`. Correct credentials on a deactivated account fail
    /// with `AccountDeactivated`.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        expected_role: Option<Role>,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        self.throttle.check(client.ip_address.as_deref(), email)?;

        let identity = match self
            .credentials
            .find_identity_by_email(&normalize_email(email))
            .await?
        {
            Some(identity) => identity,
            None => {
                verify_password(password, &self.dummy_hash);
                tracing::info!("Login failed: unknown email");
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !verify_password(password, &identity.password_hash) {
            tracing::info!(identity_id = identity.id, "Login failed: wrong password");
            return Err(AuthError::InvalidCredentials);
        }

        if let Some(role) = expected_role
            && identity.role != role
        {
            tracing::info!(identity_id = identity.id, "Login failed: role mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        if !identity.is_active {
            tracing::info!(identity_id = identity.id, "Login refused: account deactivated");
            return Err(AuthError::AccountDeactivated);
        }

        self.throttle.reset(client.ip_address.as_deref(), email);

        let identity = self.record_login(identity).await;
        self.start_session(identity, client).await
    }

    /// Mint a new access token from a refresh token.
    ///
    /// With rotation enabled the presented refresh token is consumed and a new
    /// one with the same absolute expiry is returned.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        let token_hash = hash_refresh_token(refresh_token);
        let now = self.tokens.now();

        let session = self
            .sessions
            .find_session_by_token(&token_hash)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if session.is_expired_at(now) {
            if let Err(e) = self.sessions.delete_session(&token_hash).await {
                tracing::warn!("Failed to reap expired session: {}", e);
            }
            tracing::debug!(identity_id = session.identity_id, "Refresh token expired");
            return Err(AuthError::InvalidToken);
        }

        let identity = match self
            .credentials
            .find_identity_by_id(session.identity_id)
            .await?
        {
            Some(identity) if identity.is_active => identity,
            Some(identity) => {
                tracing::info!(identity_id = identity.id, "Refresh refused: account deactivated");
                return Err(AuthError::AccountDeactivated);
            }
            None => {
                if let Err(e) = self.sessions.delete_session(&token_hash).await {
                    tracing::warn!("Failed to drop orphaned session: {}", e);
                }
                return Err(AuthError::InvalidToken);
            }
        };

        let access = self.tokens.issue_access_token(&identity)?;

        let refresh_token = if self.rotate_refresh_tokens {
            let next = self.tokens.issue_refresh_token();
            let replacement = NewSession {
                identity_id: identity.id,
                token_hash: hash_refresh_token(&next),
                expires_at: session.expires_at,
                ip_address: client.ip_address.clone().or(session.ip_address),
                user_agent: client.user_agent.clone().or(session.user_agent),
                created_at: now,
            };

            self.sessions
                .rotate_session(&token_hash, replacement)
                .await?
                .ok_or(AuthError::InvalidToken)?;
            next
        } else {
            refresh_token.to_string()
        };

        tracing::debug!(identity_id = identity.id, "Access token refreshed");

        Ok(AuthResponse {
            user: identity.into(),
            tokens: TokenPair::new(&access, refresh_token, session.expires_at.timestamp()),
        })
    }

    /// Revoke one refresh token. Always succeeds from the caller's view.
    pub async fn logout(&self, refresh_token: &str) {
        match self
            .sessions
            .delete_session(&hash_refresh_token(refresh_token))
            .await
        {
            Ok(true) => tracing::info!("Session closed"),
            Ok(false) => tracing::debug!("Logout for unknown session"),
            Err(e) => tracing::warn!("Logout could not reach session store: {}", e),
        }
    }

    /// Revoke every session of the identity. `false` only on storage failure.
    pub async fn logout_all_devices(&self, id: IdentityId) -> bool {
        match self.sessions.delete_all_sessions_for_identity(id).await {
            Ok(count) => {
                tracing::info!(identity_id = id, count, "All sessions revoked");
                true
            }
            Err(e) => {
                tracing::error!(identity_id = id, "Failed to revoke sessions: {}", e);
                false
            }
        }
    }

    /// Change the password after verifying the current one.
    ///
    /// When revocation is enabled every other session is dropped; the session
    /// of `keep_refresh_token` survives. Returns the number of revoked sessions.
    pub async fn change_password(
        &self,
        id: IdentityId,
        current_password: &str,
        new_password: &str,
        keep_refresh_token: Option<&str>,
    ) -> Result<u64, AuthError> {
        let identity = self
            .credentials
            .find_identity_by_id(id)
            .await?
            .ok_or(AuthError::AccountInvalid)?;

        if !verify_password(current_password, &identity.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        validate_password_strength(new_password)?;
        let password_hash = hash_password(new_password, self.bcrypt_cost)?;

        self.credentials
            .update_identity(
                id,
                IdentityUpdate {
                    password_hash: Some(password_hash),
                    ..Default::default()
                },
            )
            .await?
            .ok_or(AuthError::AccountInvalid)?;

        let revoked = if !self.revoke_sessions_on_password_change {
            0
        } else if let Some(token) = keep_refresh_token {
            self.sessions
                .delete_other_sessions(id, &hash_refresh_token(token))
                .await?
        } else {
            self.sessions.delete_all_sessions_for_identity(id).await?
        };

        tracing::info!(identity_id = id, revoked, "Password changed");
        Ok(revoked)
    }

    /// Update name and email. Sessions are untouched.
    pub async fn update_profile(
        &self,
        id: IdentityId,
        update: ProfileUpdate,
    ) -> Result<IdentityResponse, AuthError> {
        let email = match update.email {
            Some(email) => {
                let email = normalize_email(&email);
                validate_email(&email)?;
                Some(email)
            }
            None => None,
        };

        let fields = IdentityUpdate {
            email,
            first_name: update.first_name.map(|s| s.trim().to_string()),
            last_name: update.last_name.map(|s| s.trim().to_string()),
            ..Default::default()
        };

        let identity = if fields.is_empty() {
            self.credentials.find_identity_by_id(id).await?
        } else {
            self.credentials.update_identity(id, fields).await?
        };

        let identity = identity.ok_or(AuthError::AccountInvalid)?;
        tracing::info!(identity_id = id, "Profile updated");
        Ok(identity.into())
    }

    /// Non-expired sessions of the identity, newest first
    pub async fn active_sessions(&self, id: IdentityId) -> Result<Vec<SessionInfo>, AuthError> {
        let now = self.tokens.now();
        let sessions = self.sessions.list_sessions_for_identity(id).await?;

        Ok(sessions
            .into_iter()
            .filter(|s| !s.is_expired_at(now))
            .map(SessionInfo::from)
            .collect())
    }

    /// Delete expired sessions and idle throttle buckets
    pub async fn purge_expired_sessions(&self) -> Result<u64, AuthError> {
        let purged = self.sessions.purge_expired(self.tokens.now()).await?;
        let pruned = self.throttle.prune();

        if purged > 0 || pruned > 0 {
            tracing::info!(purged, pruned, "Expired sessions purged");
        }
        Ok(purged)
    }

    async fn record_login(&self, identity: Identity) -> Identity {
        let update = IdentityUpdate {
            last_login_at: Some(self.tokens.now()),
            ..Default::default()
        };

        match self.credentials.update_identity(identity.id, update).await {
            Ok(Some(updated)) => updated,
            Ok(None) => identity,
            Err(e) => {
                tracing::warn!(identity_id = identity.id, "Failed to record login: {}", e);
                identity
            }
        }
    }

    async fn start_session(
        &self,
        identity: Identity,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        let now = self.tokens.now();
        let access = self.tokens.issue_access_token(&identity)?;
        let refresh_token = self.tokens.issue_refresh_token();
        let expires_at = self.tokens.refresh_expiry(now)?;

        self.sessions
            .create_session(NewSession {
                identity_id: identity.id,
                token_hash: hash_refresh_token(&refresh_token),
                expires_at,
                ip_address: client.ip_address.clone(),
                user_agent: client.user_agent.clone(),
                created_at: now,
            })
            .await?;

        tracing::info!(identity_id = identity.id, "Session opened");

        Ok(AuthResponse {
            user: identity.into(),
            tokens: TokenPair::new(&access, refresh_token, expires_at.timestamp()),
        })
    }
}
