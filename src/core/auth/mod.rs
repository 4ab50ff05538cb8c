//! Authentication module for authgate
//!
//! This module provides:
//! - Access-token codec and token service (HS256, versioned claims)
//! - Route classification and the per-request authentication guard
//! - Session lifecycle: login, refresh, logout, logout-all-devices
//! - REST API endpoints and axum extractors

pub mod api;
pub mod error;
pub mod guard;
pub mod jwt;
pub mod password;
pub mod routes;
pub mod service;
pub mod throttle;
pub mod tokens;

#[cfg(test)]
mod tests;

pub use api::{AuthApiState, app_router, auth_api_router};
pub use error::{ApiError, AuthError};
pub use guard::{
    AuthGuard, AuthMethod, AuthenticatedIdentity, ClaimCheck, CurrentIdentity, MaybeIdentity,
    OptionalRouteExt, auth_middleware,
};
pub use jwt::{AccessClaims, ClaimedIdentity, CodecError, TokenCodec};
pub use routes::{RouteClass, RouteTable};
pub use service::{
    AuthResponse, ChangePasswordRequest, ClientInfo, LoginRequest, ProfileUpdate, RefreshRequest,
    RegisterRequest, SessionManager,
};
pub use throttle::{ACCOUNT_BUCKET_FACTOR, LoginThrottle};
pub use tokens::{TokenError, TokenPair, TokenService, VerifiedToken};
