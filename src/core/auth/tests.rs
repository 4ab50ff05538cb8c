//! End-to-end scenarios over the in-memory stores and a manual clock

use axum::{
    Json, Router,
    body::Body,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::Response,
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use crate::build_state;
use crate::core::auth::guard::{API_KEY_HEADER, hash_api_key};
use crate::core::auth::password::hash_password;
use crate::core::auth::{
    ACCOUNT_BUCKET_FACTOR, AuthApiState, AuthError, AuthMethod, ClaimCheck, ClientInfo,
    CurrentIdentity, MaybeIdentity, OptionalRouteExt, ProfileUpdate, RegisterRequest, RouteClass,
    TokenService, app_router,
};
use crate::core::clock::{Clock, ManualClock};
use crate::core::config::AuthConfig;
use crate::core::db::{
    CredentialStore, Identity, IdentityUpdate, MemoryCredentialStore, MemorySessionStore,
    NewIdentity, Role,
};

const SECRET: &str = "test_secret_key_for_testing_only_32bytes!";
const PASSWORD: &str = "Secret123!";

struct Harness {
    state: AuthApiState,
    credentials: Arc<MemoryCredentialStore>,
    sessions: Arc<MemorySessionStore>,
    clock: Arc<ManualClock>,
    config: AuthConfig,
}

fn test_config() -> AuthConfig {
    AuthConfig::new(SECRET).bcrypt_cost(4)
}

fn harness_with(config: AuthConfig) -> Harness {
    let credentials = Arc::new(MemoryCredentialStore::new());
    let sessions = Arc::new(MemorySessionStore::new());
    let clock = Arc::new(ManualClock::starting_now());

    let state = build_state(
        &config,
        credentials.clone(),
        sessions.clone(),
        clock.clone(),
    );

    Harness {
        state,
        credentials,
        sessions,
        clock,
        config,
    }
}

fn harness() -> Harness {
    harness_with(test_config())
}

impl Harness {
    async fn seed(&self, email: &str, role: Role, active: bool) -> Identity {
        let identity = self
            .credentials
            .create_identity(NewIdentity {
                email: email.to_string(),
                password_hash: hash_password(PASSWORD, 4).unwrap(),
                role,
                first_name: "Test".to_string(),
                last_name: "User".to_string(),
            })
            .await
            .unwrap();

        if !active {
            self.deactivate(identity.id).await;
        }
        identity
    }

    async fn deactivate(&self, id: i64) {
        self.credentials
            .update_identity(
                id,
                IdentityUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    fn client(&self) -> ClientInfo {
        ClientInfo {
            ip_address: Some("203.0.113.7".to_string()),
            user_agent: Some("scenario-test".to_string()),
        }
    }

    async fn login(&self, email: &str) -> crate::core::auth::AuthResponse {
        self.state
            .sessions
            .login(email, PASSWORD, None, &self.client())
            .await
            .unwrap()
    }

    /// Token service sharing this harness's secret and clock
    fn tokens(&self) -> TokenService {
        TokenService::new(&self.config, self.clock.clone())
    }

    fn app(&self) -> Router {
        let extra = Router::new()
            .route(
                "/api/products",
                get(|MaybeIdentity(identity): MaybeIdentity| async move {
                    Json(json!({ "personalized": identity.is_some() }))
                }),
            )
            .route(
                "/api/orders",
                get(|CurrentIdentity(identity): CurrentIdentity| async move {
                    Json(json!({ "owner": identity.id }))
                }),
            )
            .route(
                "/api/admin/reports",
                get(|current: CurrentIdentity| async move {
                    current
                        .require(&[ClaimCheck::Role(Role::Admin)])
                        .map(|_| "report")
                }),
            );

        app_router(self.state.clone(), extra)
    }
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn login_from(forwarded_for: &str, email: &str, password: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", forwarded_for)
        .body(Body::from(
            json!({ "email": email, "password": password }).to_string(),
        ))
        .unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Token verification through the guard
// ============================================================================

#[tokio::test]
async fn test_issued_token_verifies_to_same_subject() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    let current = h
        .state
        .guard
        .require_auth(&bearer(&login.tokens.access_token), &[])
        .await
        .unwrap();

    assert_eq!(current.id, identity.id);
    assert_eq!(current.auth_method, AuthMethod::Bearer);
    assert_eq!(current.expires_at, Some(login.tokens.access_expires_at));
}

#[tokio::test]
async fn test_expired_token_is_expired_not_invalid_signature() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    h.clock
        .advance(Duration::seconds(h.config.access_token_ttl_secs));

    let err = h
        .state
        .guard
        .require_auth(&bearer(&login.tokens.access_token), &[])
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::Expired);
}

#[tokio::test]
async fn test_flipped_signature_bit_is_rejected() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    let (signing_input, signature) = token.rsplit_once('.').unwrap();
    let mut raw = URL_SAFE_NO_PAD.decode(signature).unwrap();
    raw[3] ^= 0b0001_0000;
    let tampered = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(&raw));

    let err = h
        .state
        .guard
        .require_auth(&bearer(&tampered), &[])
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidSignature);
}

#[tokio::test]
async fn test_expiring_soon_does_not_reject() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    h.clock
        .advance(Duration::seconds(h.config.access_token_ttl_secs - 10));

    let current = h
        .state
        .guard
        .require_auth(&bearer(&token), &[])
        .await
        .unwrap();
    assert!(current.expiring_soon);
}

// ============================================================================
// Guard: route classes
// ============================================================================

#[tokio::test]
async fn test_missing_token_on_required_route() {
    let h = harness();

    let err = h
        .state
        .guard
        .authenticate("/api/orders", &HeaderMap::new())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::TokenMissing);
}

#[tokio::test]
async fn test_excluded_route_never_inspects_token() {
    let h = harness();
    let result = h
        .state
        .guard
        .authenticate("/api/auth/login", &bearer("garbage"))
        .await;

    assert!(matches!(result, Ok(None)));
}

#[tokio::test]
async fn test_garbage_token_optional_vs_required() {
    let h = harness();
    let headers = bearer("definitely.not.a-jwt");

    let optional = h.state.guard.authenticate("/api/products", &headers).await;
    assert!(matches!(optional, Ok(None)));

    let required = h.state.guard.authenticate("/api/orders", &headers).await;
    assert_eq!(required.unwrap_err(), AuthError::Malformed);
}

#[tokio::test]
async fn test_optional_auth_registers_route() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    assert_eq!(
        h.state.guard.routes().classify("/api/wishlist"),
        RouteClass::Required
    );

    assert!(
        h.state
            .guard
            .optional_auth("/api/wishlist", &HeaderMap::new())
            .await
            .is_none()
    );
    assert_eq!(
        h.state.guard.routes().classify("/api/wishlist"),
        RouteClass::Optional
    );

    let identity = h
        .state
        .guard
        .optional_auth("/api/wishlist", &bearer(&token))
        .await;
    assert_eq!(identity.map(|i| i.email), Some("a@b.com".to_string()));
}

// ============================================================================
// Guard: reconciliation and enrichment
// ============================================================================

#[tokio::test]
async fn test_deactivated_after_issue_is_account_invalid() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    h.deactivate(identity.id).await;

    let err = h
        .state
        .guard
        .require_auth(&bearer(&token), &[])
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::AccountInvalid);

    let optional = h.state.guard.authenticate("/api/products", &bearer(&token)).await;
    assert!(matches!(optional, Ok(None)));
}

#[tokio::test]
async fn test_unknown_subject_is_account_invalid() {
    let h = harness();
    let ghost = Identity {
        id: 999,
        email: "ghost@b.com".to_string(),
        password_hash: String::new(),
        role: Role::Admin,
        is_active: true,
        email_verified: true,
        first_name: String::new(),
        last_name: String::new(),
        api_key_hash: None,
        created_at: h.clock.now(),
        updated_at: h.clock.now(),
        last_activity_at: None,
        last_login_at: None,
    };
    let token = h.tokens().issue_access_token(&ghost).unwrap().token;

    let err = h
        .state
        .guard
        .require_auth(&bearer(&token), &[])
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::AccountInvalid);
}

#[tokio::test]
async fn test_storage_failure_fails_closed() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    h.credentials.set_unavailable(true);

    let required = h.state.guard.authenticate("/api/orders", &bearer(&token)).await;
    assert_eq!(required.unwrap_err(), AuthError::AccountInvalid);

    let optional = h.state.guard.authenticate("/api/products", &bearer(&token)).await;
    assert!(matches!(optional, Ok(None)));
}

#[tokio::test]
async fn test_database_role_wins_over_token_role() {
    let h = harness();
    let identity = h.seed("boss@b.com", Role::Admin, true).await;
    let token = h.login("boss@b.com").await.tokens.access_token;

    // Admin at issue time
    assert!(
        h.state
            .guard
            .require_auth(&bearer(&token), &[ClaimCheck::Role(Role::Admin)])
            .await
            .is_ok()
    );

    // Downgraded while the token is still valid
    h.credentials.set_role(identity.id, Role::Customer).await;

    let err = h
        .state
        .guard
        .require_auth(&bearer(&token), &[ClaimCheck::Role(Role::Admin)])
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InsufficientPermissions);

    let current = h
        .state
        .guard
        .require_auth(&bearer(&token), &[])
        .await
        .unwrap();
    assert_eq!(current.role, Role::Customer);
}

#[tokio::test]
async fn test_enrichment_uses_stored_profile() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    h.state
        .sessions
        .update_profile(
            identity.id,
            ProfileUpdate {
                email: Some("new@b.com".to_string()),
                first_name: Some("Grace".to_string()),
                last_name: None,
            },
        )
        .await
        .unwrap();

    let current = h
        .state
        .guard
        .require_auth(&bearer(&token), &[])
        .await
        .unwrap();
    assert_eq!(current.email, "new@b.com");
    assert_eq!(current.first_name, "Grace");
    assert_eq!(current.last_name, "User");
}

#[tokio::test]
async fn test_customer_requiring_admin_is_forbidden() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    let err = h
        .state
        .guard
        .require_auth(&bearer(&token), &[ClaimCheck::Role(Role::Admin)])
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::InsufficientPermissions);
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_successful_auth_records_activity() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    h.clock.advance(Duration::seconds(30));
    h.state
        .guard
        .require_auth(&bearer(&token), &[])
        .await
        .unwrap();

    let stored = h
        .credentials
        .find_identity_by_id(identity.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_activity_at, Some(h.clock.now()));
}

#[tokio::test]
async fn test_api_key_authentication() {
    let h = harness();
    let identity = h.seed("bot@b.com", Role::Customer, true).await;
    h.credentials
        .set_api_key_hash(identity.id, &hash_api_key("sk_test_123"))
        .await;

    let mut headers = HeaderMap::new();
    headers.insert(API_KEY_HEADER, HeaderValue::from_static("sk_test_123"));
    let current = h.state.guard.require_auth(&headers, &[]).await.unwrap();
    assert_eq!(current.id, identity.id);
    assert_eq!(current.auth_method, AuthMethod::ApiKey);
    assert!(current.expires_at.is_none());

    let mut wrong = HeaderMap::new();
    wrong.insert(API_KEY_HEADER, HeaderValue::from_static("sk_test_999"));
    assert_eq!(
        h.state.guard.require_auth(&wrong, &[]).await.unwrap_err(),
        AuthError::AccountInvalid
    );
    assert!(matches!(
        h.state.guard.authenticate("/api/products", &wrong).await,
        Ok(None)
    ));

    h.deactivate(identity.id).await;
    assert_eq!(
        h.state.guard.require_auth(&headers, &[]).await.unwrap_err(),
        AuthError::AccountInvalid
    );
}

// ============================================================================
// Session lifecycle: login
// ============================================================================

#[tokio::test]
async fn test_login_failures_do_not_distinguish_cause() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let client = h.client();

    let unknown = h
        .state
        .sessions
        .login("nobody@b.com", PASSWORD, None, &client)
        .await
        .unwrap_err();
    let wrong = h
        .state
        .sessions
        .login("a@b.com", "Wrong123!", None, &client)
        .await
        .unwrap_err();

    assert_eq!(unknown, AuthError::InvalidCredentials);
    assert_eq!(wrong, AuthError::InvalidCredentials);
    assert_eq!(unknown.to_string(), wrong.to_string());
    assert!(h.sessions.is_empty().await);
}

#[tokio::test]
async fn test_login_deactivated_account() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, false).await;

    let correct = h
        .state
        .sessions
        .login("a@b.com", PASSWORD, None, &h.client())
        .await
        .unwrap_err();
    assert_eq!(correct, AuthError::AccountDeactivated);

    let wrong = h
        .state
        .sessions
        .login("a@b.com", "Wrong123!", None, &h.client())
        .await
        .unwrap_err();
    assert_eq!(wrong, AuthError::InvalidCredentials);
}

#[tokio::test]
async fn test_login_role_mismatch_is_invalid_credentials() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    h.seed("boss@b.com", Role::Admin, true).await;

    let err = h
        .state
        .sessions
        .login("a@b.com", PASSWORD, Some(Role::Admin), &h.client())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials);

    assert!(
        h.state
            .sessions
            .login("boss@b.com", PASSWORD, Some(Role::Admin), &h.client())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_login_persists_session_and_last_login() {
    let h = harness();
    let identity = h.seed("A@B.com", Role::Customer, true).await;
    let login = h.login("a@b.com ").await;

    assert_eq!(login.user.id, identity.id);
    assert_eq!(login.user.last_login_at, Some(h.clock.now()));
    assert_eq!(login.tokens.token_type, "Bearer");
    assert_eq!(
        login.tokens.refresh_expires_at,
        h.clock.now().timestamp() + h.config.refresh_token_ttl_secs
    );

    let sessions = h.state.sessions.active_sessions(identity.id).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].ip_address.as_deref(), Some("203.0.113.7"));
    assert_eq!(sessions[0].user_agent.as_deref(), Some("scenario-test"));
}

#[tokio::test]
async fn test_login_throttled_after_max_attempts() {
    let h = harness_with(test_config().login_limit(2, 300));
    h.seed("a@b.com", Role::Customer, true).await;
    let client = h.client();

    for _ in 0..2 {
        let err = h
            .state
            .sessions
            .login("a@b.com", "Wrong123!", None, &client)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    // Correct password, but the bucket is empty
    let err = h
        .state
        .sessions
        .login("a@b.com", PASSWORD, None, &client)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TooManyAttempts { retry_after_secs } if retry_after_secs > 0));

    h.clock.advance(Duration::seconds(300));
    assert!(
        h.state
            .sessions
            .login("a@b.com", PASSWORD, None, &client)
            .await
            .is_ok()
    );
}

// ============================================================================
// Session lifecycle: refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_scenario_without_rotation() {
    let h = harness_with(test_config().rotate_refresh_tokens(false));
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    h.clock.advance(Duration::seconds(120));
    let refreshed = h
        .state
        .sessions
        .refresh(&login.tokens.refresh_token, &h.client())
        .await
        .unwrap();

    assert_eq!(refreshed.user.id, identity.id);
    assert!(refreshed.tokens.access_expires_at > login.tokens.access_expires_at);
    assert_ne!(refreshed.tokens.access_token, login.tokens.access_token);
    assert_eq!(refreshed.tokens.refresh_token, login.tokens.refresh_token);

    // Refresh lifetime elapsed
    h.clock
        .advance(Duration::seconds(h.config.refresh_token_ttl_secs));
    let err = h
        .state
        .sessions
        .refresh(&login.tokens.refresh_token, &h.client())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidToken);

    // Expired record reaped on lookup
    assert!(h.sessions.is_empty().await);
}

#[tokio::test]
async fn test_refresh_rotation_is_single_use() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    h.clock.advance(Duration::seconds(60));
    let rotated = h
        .state
        .sessions
        .refresh(&login.tokens.refresh_token, &h.client())
        .await
        .unwrap();

    assert_ne!(rotated.tokens.refresh_token, login.tokens.refresh_token);
    assert_eq!(
        rotated.tokens.refresh_expires_at,
        login.tokens.refresh_expires_at
    );
    assert!(rotated.tokens.access_expires_at > login.tokens.access_expires_at);

    // Replay of the consumed token
    let replay = h
        .state
        .sessions
        .refresh(&login.tokens.refresh_token, &h.client())
        .await
        .unwrap_err();
    assert_eq!(replay, AuthError::InvalidToken);

    assert!(
        h.state
            .sessions
            .refresh(&rotated.tokens.refresh_token, &h.client())
            .await
            .is_ok()
    );
    assert_eq!(h.sessions.len().await, 1);
}

#[tokio::test]
async fn test_rotated_session_keeps_absolute_expiry() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let mut token = h.login("a@b.com").await.tokens.refresh_token;

    // Rotating every day never extends the session past its original expiry
    let days = h.config.refresh_token_ttl_secs / 86_400;
    for _ in 0..days - 1 {
        h.clock.advance(Duration::days(1));
        token = h
            .state
            .sessions
            .refresh(&token, &h.client())
            .await
            .unwrap()
            .tokens
            .refresh_token;
    }

    h.clock.advance(Duration::days(1));
    let err = h
        .state
        .sessions
        .refresh(&token, &h.client())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidToken);
}

#[tokio::test]
async fn test_refresh_for_deactivated_account() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    h.deactivate(identity.id).await;

    let err = h
        .state
        .sessions
        .refresh(&login.tokens.refresh_token, &h.client())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::AccountDeactivated);
}

#[tokio::test]
async fn test_refresh_unknown_token() {
    let h = harness();
    let err = h
        .state
        .sessions
        .refresh("not-a-session", &h.client())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidToken);
}

// ============================================================================
// Session lifecycle: logout
// ============================================================================

#[tokio::test]
async fn test_logout_is_idempotent() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    h.state.sessions.logout(&login.tokens.refresh_token).await;
    h.state.sessions.logout(&login.tokens.refresh_token).await;
    h.state.sessions.logout("never-issued").await;

    assert!(h.sessions.is_empty().await);
    let err = h
        .state
        .sessions
        .refresh(&login.tokens.refresh_token, &h.client())
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::InvalidToken);
}

#[tokio::test]
async fn test_logout_survives_storage_failure() {
    let h = harness();
    h.sessions.set_unavailable(true);

    // Returns (), nothing to unwrap
    h.state.sessions.logout("whatever").await;
}

#[tokio::test]
async fn test_logout_all_devices_revokes_every_session() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let other = h.seed("c@d.com", Role::Customer, true).await;

    let phone = h.login("a@b.com").await;
    let laptop = h.login("a@b.com").await;
    let unrelated = h.login("c@d.com").await;

    assert!(h.state.sessions.logout_all_devices(identity.id).await);

    for token in [&phone.tokens.refresh_token, &laptop.tokens.refresh_token] {
        let err = h
            .state
            .sessions
            .refresh(token, &h.client())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
    }

    // Other identities untouched
    assert!(
        h.state
            .sessions
            .refresh(&unrelated.tokens.refresh_token, &h.client())
            .await
            .is_ok()
    );
    assert_eq!(
        h.state.sessions.active_sessions(other.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_logout_all_devices_reports_storage_failure() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;

    // Zero affected rows is still success
    assert!(h.state.sessions.logout_all_devices(identity.id).await);

    h.sessions.set_unavailable(true);
    assert!(!h.state.sessions.logout_all_devices(identity.id).await);
}

// ============================================================================
// Account flows
// ============================================================================

#[tokio::test]
async fn test_register_then_login() {
    let h = harness();
    let registered = h
        .state
        .sessions
        .register(
            RegisterRequest {
                email: " New@Example.com ".to_string(),
                password: "Password123".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
            },
            &h.client(),
        )
        .await
        .unwrap();

    assert_eq!(registered.user.email, "new@example.com");
    assert_eq!(registered.user.role, Role::Customer);
    assert_eq!(registered.user.last_login_at, Some(h.clock.now()));
    assert!(!registered.tokens.refresh_token.is_empty());

    assert!(
        h.state
            .sessions
            .login("new@example.com", "Password123", None, &h.client())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_register_rejections() {
    let h = harness();
    h.seed("taken@b.com", Role::Customer, true).await;

    let request = |email: &str, password: &str| RegisterRequest {
        email: email.to_string(),
        password: password.to_string(),
        first_name: String::new(),
        last_name: String::new(),
    };

    let cases = [
        (request("TAKEN@b.com", "Password123"), AuthError::EmailAlreadyExists),
        (request("not-an-email", "Password123"), AuthError::InvalidEmail),
        (request("ok@b.com", "short1A"), AuthError::PasswordTooShort),
        (request("ok@b.com", "alllowercase1"), AuthError::PasswordTooWeak),
    ];

    for (req, expected) in cases {
        let err = h
            .state
            .sessions
            .register(req, &h.client())
            .await
            .unwrap_err();
        assert_eq!(err, expected);
    }
}

#[tokio::test]
async fn test_change_password_keeps_current_session_only() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    let current = h.login("a@b.com").await;
    let other = h.login("a@b.com").await;

    let revoked = h
        .state
        .sessions
        .change_password(
            identity.id,
            PASSWORD,
            "NewSecret456",
            Some(&current.tokens.refresh_token),
        )
        .await
        .unwrap();
    assert_eq!(revoked, 1);

    assert!(
        h.state
            .sessions
            .refresh(&current.tokens.refresh_token, &h.client())
            .await
            .is_ok()
    );
    assert_eq!(
        h.state
            .sessions
            .refresh(&other.tokens.refresh_token, &h.client())
            .await
            .unwrap_err(),
        AuthError::InvalidToken
    );

    // Old password gone, new one works
    assert_eq!(
        h.state
            .sessions
            .login("a@b.com", PASSWORD, None, &h.client())
            .await
            .unwrap_err(),
        AuthError::InvalidCredentials
    );
    assert!(
        h.state
            .sessions
            .login("a@b.com", "NewSecret456", None, &h.client())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_change_password_without_revocation() {
    let h = harness_with(test_config().revoke_sessions_on_password_change(false));
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    h.login("a@b.com").await;
    h.login("a@b.com").await;

    let revoked = h
        .state
        .sessions
        .change_password(identity.id, PASSWORD, "NewSecret456", None)
        .await
        .unwrap();

    assert_eq!(revoked, 0);
    assert_eq!(h.sessions.len().await, 2);
}

#[tokio::test]
async fn test_change_password_rejections() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;

    assert_eq!(
        h.state
            .sessions
            .change_password(identity.id, "Wrong123!", "NewSecret456", None)
            .await
            .unwrap_err(),
        AuthError::InvalidCredentials
    );
    assert_eq!(
        h.state
            .sessions
            .change_password(identity.id, PASSWORD, "weak", None)
            .await
            .unwrap_err(),
        AuthError::PasswordTooShort
    );
}

#[tokio::test]
async fn test_update_profile_leaves_sessions() {
    let h = harness();
    let identity = h.seed("a@b.com", Role::Customer, true).await;
    h.seed("c@d.com", Role::Customer, true).await;
    let login = h.login("a@b.com").await;

    let updated = h
        .state
        .sessions
        .update_profile(
            identity.id,
            ProfileUpdate {
                first_name: Some("  Grace ".to_string()),
                last_name: Some("Hopper".to_string()),
                email: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.first_name, "Grace");
    assert_eq!(updated.last_name, "Hopper");

    let conflict = h
        .state
        .sessions
        .update_profile(
            identity.id,
            ProfileUpdate {
                email: Some("C@D.com".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(conflict, AuthError::EmailAlreadyExists);

    let invalid = h
        .state
        .sessions
        .update_profile(
            identity.id,
            ProfileUpdate {
                email: Some("nope".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(invalid, AuthError::InvalidEmail);

    assert!(
        h.state
            .sessions
            .refresh(&login.tokens.refresh_token, &h.client())
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_active_sessions_and_purge() {
    let h = harness_with(test_config().refresh_token_ttl(2 * 86_400));
    let identity = h.seed("a@b.com", Role::Customer, true).await;

    h.login("a@b.com").await;
    h.clock.advance(Duration::days(1));
    h.login("a@b.com").await;
    h.clock.advance(Duration::hours(36));

    let active = h.state.sessions.active_sessions(identity.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(h.sessions.len().await, 2);

    assert_eq!(h.state.sessions.purge_expired_sessions().await.unwrap(), 1);
    assert_eq!(h.sessions.len().await, 1);
}

// ============================================================================
// HTTP surface
// ============================================================================

#[tokio::test]
async fn test_http_login_me_and_logout() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let app = h.app();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            json!({ "email": "a@b.com", "password": PASSWORD }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let access = body["tokens"]["access_token"].as_str().unwrap().to_string();
    let refresh = body["tokens"]["refresh_token"].as_str().unwrap().to_string();
    assert!(body["user"].get("password_hash").is_none());

    let response = app
        .clone()
        .oneshot(get_request("/api/auth/me", Some(&access)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let me = body_json(response).await;
    assert_eq!(me["email"], "a@b.com");
    assert_eq!(me["auth_method"], "bearer");

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/logout",
            json!({ "refresh_token": refresh }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.sessions.is_empty().await);
}

#[tokio::test]
async fn test_http_logout_never_fails() {
    let h = harness();
    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/logout")
        .body(Body::from("not json"))
        .unwrap();

    let response = h.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);
}

#[tokio::test]
async fn test_http_missing_token_is_401() {
    let h = harness();
    let response = h
        .app()
        .oneshot(get_request("/api/auth/me", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "TOKEN_MISSING");
}

#[tokio::test]
async fn test_http_garbage_token_optional_vs_required() {
    let h = harness();
    let app = h.app();

    let response = app
        .clone()
        .oneshot(get_request("/api/products", Some("garbage")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["personalized"], false);

    let response = app
        .oneshot(get_request("/api/orders", Some("garbage")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "TOKEN_MALFORMED");
}

#[tokio::test]
async fn test_http_optional_route_personalized_with_token() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    let response = h
        .app()
        .oneshot(get_request("/api/products", Some(&token)))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["personalized"], true);
}

#[tokio::test]
async fn test_http_admin_route_forbidden_for_customer() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    let response = h
        .app()
        .oneshot(get_request("/api/admin/reports", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        body_json(response).await["code"],
        "INSUFFICIENT_PERMISSIONS"
    );
}

#[tokio::test]
async fn test_http_throttled_login_sets_retry_after() {
    let h = harness_with(test_config().login_limit(1, 60));
    h.seed("a@b.com", Role::Customer, true).await;
    let app = h.app();
    let body = json!({ "email": "a@b.com", "password": "Wrong123!" });

    let first = app
        .clone()
        .oneshot(json_request("POST", "/api/auth/login", body.clone()))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::UNAUTHORIZED);

    let second = app
        .oneshot(json_request("POST", "/api/auth/login", body))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()[header::RETRY_AFTER], "60");
}

#[tokio::test]
async fn test_http_register_and_sessions() {
    let h = harness();
    let app = h.app();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/register",
            json!({ "email": "new@b.com", "password": "Password123", "first_name": "N" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let access = body_json(response).await["tokens"]["access_token"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(get_request("/api/auth/sessions", Some(&access)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/auth/register",
            json!({ "email": "new@b.com", "password": "Password123" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_http_health_is_excluded() {
    let h = harness();
    let response = h
        .app()
        .oneshot(get_request("/health", Some("garbage")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_http_mounted_optional_route_admits_anonymous() {
    let h = harness();
    h.seed("a@b.com", Role::Customer, true).await;
    let token = h.login("a@b.com").await.tokens.access_token;

    let extra = Router::new().optional_route(
        &h.state.guard,
        "/api/wishlist",
        get(|MaybeIdentity(identity): MaybeIdentity| async move {
            Json(json!({ "signed_in": identity.is_some() }))
        }),
    );
    let app = app_router(h.state.clone(), extra);

    assert_eq!(
        h.state.guard.routes().classify("/api/wishlist"),
        RouteClass::Optional
    );

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get_request("/api/wishlist", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["signed_in"], false);
    }

    let response = app
        .clone()
        .oneshot(get_request("/api/wishlist", Some("garbage")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get_request("/api/wishlist", Some(&token)))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["signed_in"], true);
}

#[tokio::test]
async fn test_optional_route_cannot_reopen_excluded_path() {
    let h = harness();
    let _router = Router::<()>::new().optional_route(
        &h.state.guard,
        "/api/auth/login",
        get(|| async { "login" }),
    );

    assert_eq!(
        h.state.guard.routes().classify("/api/auth/login"),
        RouteClass::Excluded
    );
}

#[tokio::test]
async fn test_http_spoofed_forwarded_for_does_not_dodge_throttle() {
    let h = harness_with(test_config().login_limit(2, 300));
    h.seed("a@b.com", Role::Customer, true).await;
    let app = h.app();

    let mut statuses = Vec::new();
    for n in 0..5 {
        let response = app
            .clone()
            .oneshot(login_from(&format!("192.0.2.{n}"), "a@b.com", "Wrong123!"))
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert_eq!(
        statuses,
        [
            StatusCode::UNAUTHORIZED,
            StatusCode::UNAUTHORIZED,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );
}

#[tokio::test]
async fn test_http_trusted_proxy_rotation_hits_account_limit() {
    let h = harness_with(
        test_config()
            .login_limit(2, 300)
            .trust_proxy_headers(true),
    );
    h.seed("a@b.com", Role::Customer, true).await;
    let app = h.app();
    let account_capacity = 2 * ACCOUNT_BUCKET_FACTOR;

    for n in 0..account_capacity {
        let response = app
            .clone()
            .oneshot(login_from(&format!("192.0.2.{n}"), "a@b.com", "Wrong123!"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app
        .clone()
        .oneshot(login_from("198.51.100.200", "a@b.com", PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Other accounts behind the same proxy still log in, and the hop is recorded
    h.seed("c@d.com", Role::Customer, true).await;
    let response = app
        .oneshot(login_from("198.51.100.200", "c@d.com", PASSWORD))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let user_id = body_json(response).await["user"]["id"].as_i64().unwrap();

    let sessions = h.state.sessions.active_sessions(user_id).await.unwrap();
    assert_eq!(sessions[0].ip_address.as_deref(), Some("198.51.100.200"));
}
