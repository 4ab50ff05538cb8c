//! Authentication guard
//!
//! Per-request gatekeeper. For each request:
//!
//! 1. normalize and classify the path ([`RouteTable`])
//! 2. extract a bearer token (or an `X-API-Key`)
//! 3. verify it ([`TokenService`])
//! 4. reconcile the subject against the credential store
//! 5. enrich: database fields win over anything the token asserts
//!
//! Excluded routes skip all of this. Optional routes turn every failure into
//! "no identity". Required routes surface the specific failure.
//!
//! Storage failures during reconciliation are fail-closed: the identity is
//! treated as invalid, never as authenticated and never as a 5xx.

use axum::{
    Router,
    extract::{FromRequestParts, Request, State},
    http::{HeaderMap, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::MethodRouter,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::core::auth::error::AuthError;
use crate::core::auth::routes::{RouteClass, RouteTable};
use crate::core::auth::tokens::{TokenService, VerifiedToken};
use crate::core::db::models::{Identity, IdentityId, Role};
use crate::core::db::store::CredentialStore;

/// Header carrying a machine credential
pub const API_KEY_HEADER: &str = "x-api-key";

/// How the request proved its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Bearer,
    ApiKey,
}

/// Identity handed to business logic after reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedIdentity {
    pub id: IdentityId,
    pub email: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub auth_method: AuthMethod,
    /// Token issuance metadata; absent for API keys
    pub issued_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub token_id: Option<String>,
    pub expiring_soon: bool,
}

impl AuthenticatedIdentity {
    fn from_record(identity: Identity, auth_method: AuthMethod) -> Self {
        Self {
            id: identity.id,
            email: identity.email,
            role: identity.role,
            first_name: identity.first_name,
            last_name: identity.last_name,
            is_active: identity.is_active,
            email_verified: identity.email_verified,
            created_at: identity.created_at,
            updated_at: identity.updated_at,
            last_activity_at: identity.last_activity_at,
            last_login_at: identity.last_login_at,
            auth_method,
            issued_at: None,
            expires_at: None,
            token_id: None,
            expiring_soon: false,
        }
    }

    /// Database record plus token metadata. Role and email come from the record.
    fn from_token(identity: Identity, verified: VerifiedToken) -> Self {
        let mut enriched = Self::from_record(identity, AuthMethod::Bearer);
        enriched.issued_at = Some(verified.claims.iat);
        enriched.expires_at = Some(verified.claims.exp);
        enriched.token_id = Some(verified.claims.jti);
        enriched.expiring_soon = verified.expiring_soon;
        enriched
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Equality check evaluated against the enriched identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimCheck {
    Role(Role),
    Subject(IdentityId),
    EmailVerified(bool),
}

impl ClaimCheck {
    pub fn holds(&self, identity: &AuthenticatedIdentity) -> bool {
        match self {
            ClaimCheck::Role(role) => identity.role == *role,
            ClaimCheck::Subject(id) => identity.id == *id,
            ClaimCheck::EmailVerified(verified) => identity.email_verified == *verified,
        }
    }
}

enum Credential<'a> {
    Bearer(&'a str),
    ApiKey(&'a str),
}

/// Bearer token from the `Authorization` header, if well formed
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn extract_credential(headers: &HeaderMap) -> Option<Credential<'_>> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(Credential::Bearer(token));
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(Credential::ApiKey)
}

/// SHA-256 hex digest under which an API key is stored
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// The per-request gatekeeper
pub struct AuthGuard {
    routes: Arc<RouteTable>,
    tokens: TokenService,
    credentials: Arc<dyn CredentialStore>,
}

impl AuthGuard {
    pub fn new(
        routes: Arc<RouteTable>,
        tokens: TokenService,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            routes,
            tokens,
            credentials,
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Classify `path` and authenticate accordingly.
    ///
    /// `Ok(None)` means "no identity, no error" (excluded routes, and optional
    /// routes without a usable credential).
    pub async fn authenticate(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<Option<AuthenticatedIdentity>, AuthError> {
        let class = self.routes.classify(path);
        self.authenticate_as(class, headers).await
    }

    /// Authenticate in required mode and enforce every claim check
    pub async fn require_auth(
        &self,
        headers: &HeaderMap,
        checks: &[ClaimCheck],
    ) -> Result<AuthenticatedIdentity, AuthError> {
        let identity = self
            .authenticate_as(RouteClass::Required, headers)
            .await?
            .ok_or(AuthError::TokenMissing)?;

        enforce_checks(&identity, checks)?;
        Ok(identity)
    }

    /// Authenticate in optional mode, registering `path` as optional
    pub async fn optional_auth(
        &self,
        path: &str,
        headers: &HeaderMap,
    ) -> Option<AuthenticatedIdentity> {
        if !self.routes.register_optional(path) {
            // Excluded routes never inspect credentials
            return None;
        }
        self.authenticate_as(RouteClass::Optional, headers)
            .await
            .ok()
            .flatten()
    }

    async fn authenticate_as(
        &self,
        class: RouteClass,
        headers: &HeaderMap,
    ) -> Result<Option<AuthenticatedIdentity>, AuthError> {
        if class == RouteClass::Excluded {
            return Ok(None);
        }

        let outcome = match extract_credential(headers) {
            None => Err(AuthError::TokenMissing),
            Some(Credential::Bearer(token)) => self.authenticate_bearer(token).await,
            Some(Credential::ApiKey(key)) => self.authenticate_api_key(key).await,
        };

        match outcome {
            Ok(identity) => {
                self.touch(identity.id).await;
                Ok(Some(identity))
            }
            Err(err) if class == RouteClass::Optional => {
                tracing::debug!("Optional authentication ignored: {}", err);
                Ok(None)
            }
            Err(err) => {
                tracing::debug!("Authentication rejected: {}", err);
                Err(err)
            }
        }
    }

    async fn authenticate_bearer(&self, token: &str) -> Result<AuthenticatedIdentity, AuthError> {
        let verified = self.tokens.verify_access_token(token)?;
        let identity = self.reconcile(verified.claims.sub).await?;

        if identity.role != verified.claims.role {
            tracing::info!(
                identity_id = identity.id,
                token_role = %verified.claims.role,
                stored_role = %identity.role,
                "Token role is stale; using stored role"
            );
        }

        Ok(AuthenticatedIdentity::from_token(identity, verified))
    }

    async fn authenticate_api_key(&self, key: &str) -> Result<AuthenticatedIdentity, AuthError> {
        let identity = match self
            .credentials
            .find_identity_by_api_key(&hash_api_key(key))
            .await
        {
            Ok(Some(identity)) if identity.is_active => identity,
            Ok(_) => return Err(AuthError::AccountInvalid),
            Err(e) => {
                tracing::warn!("API key lookup failed, denying: {}", e);
                return Err(AuthError::AccountInvalid);
            }
        };

        Ok(AuthenticatedIdentity::from_record(
            identity,
            AuthMethod::ApiKey,
        ))
    }

    /// Live, active record for a verified subject
    async fn reconcile(&self, id: IdentityId) -> Result<Identity, AuthError> {
        match self.credentials.find_identity_by_id(id).await {
            Ok(Some(identity)) if identity.is_active => Ok(identity),
            Ok(Some(_)) => {
                tracing::debug!(identity_id = id, "Token subject is deactivated");
                Err(AuthError::AccountInvalid)
            }
            Ok(None) => {
                tracing::debug!(identity_id = id, "Token subject no longer exists");
                Err(AuthError::AccountInvalid)
            }
            Err(e) => {
                tracing::warn!(identity_id = id, "Identity lookup failed, denying: {}", e);
                Err(AuthError::AccountInvalid)
            }
        }
    }

    /// Best-effort last-activity update
    async fn touch(&self, id: IdentityId) {
        if let Err(e) = self
            .credentials
            .update_last_activity(id, self.tokens.now())
            .await
        {
            tracing::warn!(identity_id = id, "Failed to record activity: {}", e);
        }
    }
}

fn enforce_checks(identity: &AuthenticatedIdentity, checks: &[ClaimCheck]) -> Result<(), AuthError> {
    if let Some(failed) = checks.iter().find(|check| !check.holds(identity)) {
        tracing::debug!(
            identity_id = identity.id,
            check = ?failed,
            "Claim check failed"
        );
        return Err(AuthError::InsufficientPermissions);
    }
    Ok(())
}

// ============================================================================
// Axum integration
// ============================================================================

/// Runs the guard for every request.
///
/// On success the [`AuthenticatedIdentity`] (if any) is stored in the request
/// extensions for [`CurrentIdentity`] and [`MaybeIdentity`].
pub async fn auth_middleware(
    State(guard): State<Arc<AuthGuard>>,
    mut request: Request,
    next: Next,
) -> Response {
    let outcome = guard
        .authenticate(request.uri().path(), request.headers())
        .await;

    match outcome {
        Ok(Some(identity)) => {
            request.extensions_mut().insert(identity);
        }
        Ok(None) => {}
        Err(err) => return err.into_response(),
    }

    next.run(request).await
}

/// Extractor for handlers on required routes
#[derive(Debug, Clone)]
pub struct CurrentIdentity(pub AuthenticatedIdentity);

impl CurrentIdentity {
    /// Enforce claim checks inside a handler
    pub fn require(&self, checks: &[ClaimCheck]) -> Result<&AuthenticatedIdentity, AuthError> {
        enforce_checks(&self.0, checks)?;
        Ok(&self.0)
    }
}

impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedIdentity>()
            .cloned()
            .map(CurrentIdentity)
            .ok_or(AuthError::TokenMissing)
    }
}

/// Mounting routes in the optional tier.
///
/// The guard classifies a request before any handler runs, so a route must be
/// optional before its first request. `optional_route` registers the path with
/// the guard's route table as it mounts the handler. Paths match exactly.
pub trait OptionalRouteExt<S> {
    fn optional_route(self, guard: &AuthGuard, path: &str, method_router: MethodRouter<S>)
    -> Self;
}

impl<S> OptionalRouteExt<S> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn optional_route(
        self,
        guard: &AuthGuard,
        path: &str,
        method_router: MethodRouter<S>,
    ) -> Self {
        if !guard.routes().register_optional(path) {
            tracing::warn!(route = %path, "Excluded route mounted as optional; keeping excluded");
        }
        self.route(path, method_router)
    }
}

/// Extractor for handlers on optional routes
#[derive(Debug, Clone)]
pub struct MaybeIdentity(pub Option<AuthenticatedIdentity>);

impl<S> FromRequestParts<S> for MaybeIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeIdentity(
            parts.extensions.get::<AuthenticatedIdentity>().cloned(),
        ))
    }
}
