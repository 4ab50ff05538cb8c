//! Auth API endpoints
//!
//! Provides REST API endpoints for the session lifecycle (mounted under the
//! configured service prefix, `/api` by default):
//! - POST /auth/register - Register a customer account
//! - POST /auth/login - Login and get tokens
//! - POST /auth/admin/login - Login restricted to admin accounts
//! - POST /auth/refresh - Refresh access token
//! - POST /auth/logout - Logout (invalidate refresh token)
//! - POST /auth/logout-all - Invalidate every session of the caller
//! - POST /auth/password - Change password
//! - PATCH /auth/profile - Update name / email
//! - GET /auth/me - Current identity
//! - GET /auth/sessions - Active sessions of the caller

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::auth::error::AuthError;
use crate::core::auth::guard::{AuthGuard, AuthenticatedIdentity, CurrentIdentity, auth_middleware};
use crate::core::auth::service::{
    AuthResponse, ChangePasswordRequest, ClientInfo, LoginRequest, ProfileUpdate, RefreshRequest,
    RegisterRequest, SessionManager,
};
use crate::core::db::models::{IdentityResponse, Role, SessionInfo};

/// Auth API state
#[derive(Clone)]
pub struct AuthApiState {
    pub sessions: Arc<SessionManager>,
    pub guard: Arc<AuthGuard>,
    /// Read the client IP from proxy headers instead of the socket
    pub trust_proxy_headers: bool,
}

/// Generic success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

impl SuccessResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Response for password change
#[derive(Debug, Serialize)]
pub struct PasswordChangedResponse {
    pub success: bool,
    pub revoked_sessions: u64,
}

/// Create the auth API router (routes only, no guard layer)
pub fn auth_api_router(state: AuthApiState) -> Router {
    let prefix = state.guard.routes().prefix().to_string();
    let routes = Router::new()
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/admin/login", post(admin_login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/logout-all", post(logout_all_handler))
        .route("/auth/password", post(change_password_handler))
        .route("/auth/profile", patch(update_profile_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/sessions", get(sessions_handler))
        .with_state(state);

    if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&prefix, routes)
    }
}

/// Full application: auth routes plus health check, every request guarded
pub fn app_router(state: AuthApiState, extra: Router) -> Router {
    let guard = Arc::clone(&state.guard);

    Router::new()
        .route("/", get(health_handler))
        .route("/health", get(health_handler))
        .merge(auth_api_router(state))
        .merge(extra)
        .layer(middleware::from_fn_with_state(guard, auth_middleware))
}

async fn health_handler() -> &'static str {
    "ok"
}

/// POST /auth/register
async fn register_handler(
    State(state): State<AuthApiState>,
    client: ClientInfo,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AuthError> {
    let response = state.sessions.register(request, &client).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /auth/login
async fn login_handler(
    State(state): State<AuthApiState>,
    client: ClientInfo,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let response = state
        .sessions
        .login(&request.email, &request.password, None, &client)
        .await?;
    Ok(Json(response))
}

/// POST /auth/admin/login
async fn admin_login_handler(
    State(state): State<AuthApiState>,
    client: ClientInfo,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let response = state
        .sessions
        .login(&request.email, &request.password, Some(Role::Admin), &client)
        .await?;
    Ok(Json(response))
}

/// POST /auth/refresh
async fn refresh_handler(
    State(state): State<AuthApiState>,
    client: ClientInfo,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    let response = state
        .sessions
        .refresh(&request.refresh_token, &client)
        .await?;
    Ok(Json(response))
}

/// POST /auth/logout
///
/// Never fails: an unreadable body or unknown token still reports success.
async fn logout_handler(State(state): State<AuthApiState>, body: Bytes) -> Json<SuccessResponse> {
    if let Ok(request) = serde_json::from_slice::<RefreshRequest>(&body) {
        state.sessions.logout(&request.refresh_token).await;
    }
    Json(SuccessResponse::ok("Logged out successfully"))
}

/// POST /auth/logout-all
async fn logout_all_handler(
    State(state): State<AuthApiState>,
    CurrentIdentity(identity): CurrentIdentity,
) -> impl IntoResponse {
    if state.sessions.logout_all_devices(identity.id).await {
        (
            StatusCode::OK,
            Json(SuccessResponse::ok("Logged out from all devices")),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SuccessResponse {
                success: false,
                message: "Sessions could not be revoked".to_string(),
            }),
        )
    }
}

/// POST /auth/password
async fn change_password_handler(
    State(state): State<AuthApiState>,
    CurrentIdentity(identity): CurrentIdentity,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<Json<PasswordChangedResponse>, AuthError> {
    let revoked_sessions = state
        .sessions
        .change_password(
            identity.id,
            &request.current_password,
            &request.new_password,
            request.refresh_token.as_deref(),
        )
        .await?;

    Ok(Json(PasswordChangedResponse {
        success: true,
        revoked_sessions,
    }))
}

/// PATCH /auth/profile
async fn update_profile_handler(
    State(state): State<AuthApiState>,
    CurrentIdentity(identity): CurrentIdentity,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<IdentityResponse>, AuthError> {
    let updated = state.sessions.update_profile(identity.id, update).await?;
    Ok(Json(updated))
}

/// GET /auth/me
async fn me_handler(CurrentIdentity(identity): CurrentIdentity) -> Json<AuthenticatedIdentity> {
    Json(identity)
}

/// GET /auth/sessions
async fn sessions_handler(
    State(state): State<AuthApiState>,
    CurrentIdentity(identity): CurrentIdentity,
) -> Result<Json<Vec<SessionInfo>>, AuthError> {
    let sessions = state.sessions.active_sessions(identity.id).await?;
    Ok(Json(sessions))
}

// ============================================================================
// Client metadata
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client IP.
///
/// With `trust_proxy_headers` the first `X-Forwarded-For` hop wins, then
/// `X-Real-IP`, then the socket. Without it the headers are ignored, since any
/// client can set them.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<String> {
    let socket_ip = || peer.map(|addr| addr.ip().to_string());
    if !trust_proxy_headers {
        return socket_ip();
    }

    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(socket_ip)
}

impl FromRequestParts<AuthApiState> for ClientInfo {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthApiState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(ClientInfo {
            ip_address: client_ip(&parts.headers, peer, state.trust_proxy_headers),
            user_agent: header_str(&parts.headers, header::USER_AGENT.as_str())
                .map(str::to_string),
        })
    }
}
