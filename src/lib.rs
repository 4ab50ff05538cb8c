//! authgate - authentication and session-lifecycle core
//!
//! Issues, verifies and revokes bearer credentials, classifies inbound
//! requests by authentication requirement, and reconciles token claims
//! against the credential store.

pub mod core;

use std::sync::Arc;

use crate::core::auth::{AuthApiState, AuthGuard, RouteTable, SessionManager, TokenService};
use crate::core::clock::Clock;
use crate::core::config::AuthConfig;
use crate::core::db::{CredentialStore, SessionStore};

/// Wire the guard and session manager around injected stores and clock
pub fn build_state(
    config: &AuthConfig,
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
) -> AuthApiState {
    let tokens = TokenService::new(config, clock);
    let routes = Arc::new(RouteTable::from_config(config));

    let guard = AuthGuard::new(routes, tokens.clone(), Arc::clone(&credentials));
    let manager = SessionManager::new(config, tokens, credentials, sessions);

    AuthApiState {
        sessions: Arc::new(manager),
        guard: Arc::new(guard),
        trust_proxy_headers: config.trust_proxy_headers,
    }
}
