//! Configuration from environment variables.
//!
//! Call `dotenvy::dotenv()` first, then `AuthConfig::from_env()` and
//! `ServerConfig::from_env()`. Both are also constructible from any key
//! lookup so tests never touch the process environment.

use std::str::FromStr;

/// Default access token lifetime (15 minutes)
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Default refresh token lifetime (7 days)
pub const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 24 * 60 * 60;

/// Cost factor for bcrypt hashing (12 is recommended for production)
pub const BCRYPT_COST: u32 = 12;

/// Minimum accepted signing secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Longest accepted token lifetime or throttle window (10 years)
pub const MAX_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// bcrypt cost bounds
pub const BCRYPT_MIN_COST: u32 = 4;
pub const BCRYPT_MAX_COST: u32 = 31;

const DEFAULT_ISSUER: &str = "authgate";
const DEFAULT_SERVICE_PREFIX: &str = "/api";

/// Routes that never inspect credentials
pub const DEFAULT_EXCLUDED_ROUTES: &[&str] = &[
    "/",
    "/health",
    "/auth/login",
    "/auth/admin/login",
    "/auth/register",
    "/auth/refresh",
    "/auth/logout",
];

/// Routes that accept but do not demand credentials
pub const DEFAULT_OPTIONAL_ROUTES: &[&str] = &["/products", "/products/featured"];

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("JWT_SECRET environment variable not set")]
    MissingSecret,

    #[error("JWT_SECRET must be at least {MIN_SECRET_LEN} bytes")]
    WeakSecret,

    #[error("{0} must be between 1 and {MAX_LIFETIME_SECS} seconds")]
    InvalidLifetime(&'static str),

    #[error("BCRYPT_COST must be between {BCRYPT_MIN_COST} and {BCRYPT_MAX_COST}, got {0}")]
    InvalidBcryptCost(u32),
}

/// Auth core configuration
#[derive(Clone)]
pub struct AuthConfig {
    /// Shared HS256 signing secret
    pub jwt_secret: String,
    pub issuer: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    /// Leading path segment(s) stripped before route classification
    pub service_prefix: String,
    pub excluded_routes: Vec<String>,
    pub optional_routes: Vec<String>,
    pub bcrypt_cost: u32,
    /// Issue a new refresh token on every refresh
    pub rotate_refresh_tokens: bool,
    /// Drop other sessions when a password changes
    pub revoke_sessions_on_password_change: bool,
    pub login_max_attempts: u32,
    pub login_window_secs: u64,
    /// Take the client IP from `X-Forwarded-For` / `X-Real-IP`.
    /// Only safe behind a proxy that overwrites those headers.
    pub trust_proxy_headers: bool,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("service_prefix", &self.service_prefix)
            .field("excluded_routes", &self.excluded_routes)
            .field("optional_routes", &self.optional_routes)
            .field("bcrypt_cost", &self.bcrypt_cost)
            .field("rotate_refresh_tokens", &self.rotate_refresh_tokens)
            .field(
                "revoke_sessions_on_password_change",
                &self.revoke_sessions_on_password_change,
            )
            .field("login_max_attempts", &self.login_max_attempts)
            .field("login_window_secs", &self.login_window_secs)
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .finish()
    }
}

impl AuthConfig {
    /// Create a configuration with defaults around the given secret
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: secret.into(),
            issuer: DEFAULT_ISSUER.to_string(),
            access_token_ttl_secs: ACCESS_TOKEN_TTL_SECS,
            refresh_token_ttl_secs: REFRESH_TOKEN_TTL_SECS,
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            excluded_routes: DEFAULT_EXCLUDED_ROUTES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            optional_routes: DEFAULT_OPTIONAL_ROUTES
                .iter()
                .map(|r| r.to_string())
                .collect(),
            bcrypt_cost: BCRYPT_COST,
            rotate_refresh_tokens: true,
            revoke_sessions_on_password_change: true,
            login_max_attempts: 5,
            login_window_secs: 300,
            trust_proxy_headers: false,
        }
    }

    /// Load from environment variables and validate
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup and validate
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = lookup("JWT_SECRET").ok_or(ConfigError::MissingSecret)?;
        let mut config = Self::new(secret);

        if let Some(issuer) = lookup("JWT_ISSUER") {
            config.issuer = issuer;
        }
        if let Some(prefix) = lookup("AUTH_SERVICE_PREFIX") {
            config.service_prefix = prefix;
        }
        if let Some(routes) = lookup("AUTH_EXCLUDED_ROUTES") {
            config.excluded_routes = split_list(&routes);
        }
        if let Some(routes) = lookup("AUTH_OPTIONAL_ROUTES") {
            config.optional_routes = split_list(&routes);
        }

        config.access_token_ttl_secs = parse_or(
            &lookup,
            "ACCESS_TOKEN_TTL_SECS",
            config.access_token_ttl_secs,
        );
        config.refresh_token_ttl_secs = parse_or(
            &lookup,
            "REFRESH_TOKEN_TTL_SECS",
            config.refresh_token_ttl_secs,
        );
        config.bcrypt_cost = parse_or(&lookup, "BCRYPT_COST", config.bcrypt_cost);
        config.rotate_refresh_tokens =
            parse_or(&lookup, "ROTATE_REFRESH_TOKENS", config.rotate_refresh_tokens);
        config.revoke_sessions_on_password_change = parse_or(
            &lookup,
            "REVOKE_SESSIONS_ON_PASSWORD_CHANGE",
            config.revoke_sessions_on_password_change,
        );
        config.login_max_attempts =
            parse_or(&lookup, "LOGIN_MAX_ATTEMPTS", config.login_max_attempts);
        config.login_window_secs = parse_or(&lookup, "LOGIN_WINDOW_SECS", config.login_window_secs);
        config.trust_proxy_headers =
            parse_or(&lookup, "TRUST_PROXY_HEADERS", config.trust_proxy_headers);

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the token and session code cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret);
        }
        let lifetimes = 1..=MAX_LIFETIME_SECS;
        if !lifetimes.contains(&self.access_token_ttl_secs) {
            return Err(ConfigError::InvalidLifetime("ACCESS_TOKEN_TTL_SECS"));
        }
        if !lifetimes.contains(&self.refresh_token_ttl_secs) {
            return Err(ConfigError::InvalidLifetime("REFRESH_TOKEN_TTL_SECS"));
        }
        // Zero is allowed: it disables throttling
        if self.login_window_secs > MAX_LIFETIME_SECS as u64 {
            return Err(ConfigError::InvalidLifetime("LOGIN_WINDOW_SECS"));
        }
        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&self.bcrypt_cost) {
            return Err(ConfigError::InvalidBcryptCost(self.bcrypt_cost));
        }
        Ok(())
    }

    /// Set access token lifetime
    pub fn access_token_ttl(mut self, secs: i64) -> Self {
        self.access_token_ttl_secs = secs;
        self
    }

    /// Set refresh token lifetime
    pub fn refresh_token_ttl(mut self, secs: i64) -> Self {
        self.refresh_token_ttl_secs = secs;
        self
    }

    /// Set issuer
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Set bcrypt cost
    pub fn bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn rotate_refresh_tokens(mut self, rotate: bool) -> Self {
        self.rotate_refresh_tokens = rotate;
        self
    }

    pub fn revoke_sessions_on_password_change(mut self, revoke: bool) -> Self {
        self.revoke_sessions_on_password_change = revoke;
        self
    }

    pub fn login_limit(mut self, max_attempts: u32, window_secs: u64) -> Self {
        self.login_max_attempts = max_attempts;
        self.login_window_secs = window_secs;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

/// Process-level settings for the server binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// PostgreSQL URL; in-memory storage is used when unset
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub session_sweep_interval_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            session_sweep_interval_secs: parse_or(&lookup, "SESSION_SWEEP_INTERVAL_SECS", 3600),
        }
    }

    /// Check if database is configured
    pub fn has_database(&self) -> bool {
        self.database_url.is_some()
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
