//! Login attempt throttling
//!
//! Two token buckets guard every attempt. The per-client bucket is keyed by
//! `(client ip, lowercased email)`, holds `max_attempts` tokens and refills
//! completely over `window`. The per-account bucket is keyed by the email
//! alone and holds `ACCOUNT_BUCKET_FACTOR` times as many, so spreading
//! guesses over many addresses still runs into a limit. An attempt consumes
//! one token from each; if either is empty the attempt is rejected with a
//! retry-after hint. Successful logins reset both keys.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::core::auth::error::AuthError;
use crate::core::clock::Clock;

/// Absorbs float drift in refill arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Per-account capacity as a multiple of the per-client capacity
pub const ACCOUNT_BUCKET_FACTOR: u32 = 4;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Capacity and refill rate of one bucket family
#[derive(Debug, Clone, Copy)]
struct Limit {
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
}

impl Limit {
    fn new(capacity: u32, window: Duration) -> Self {
        let window_secs = window.num_milliseconds().max(1) as f64 / 1000.0;
        Self {
            capacity: capacity as f64,
            refill_rate: capacity as f64 / window_secs,
        }
    }

    fn full(&self, now: DateTime<Utc>) -> Bucket {
        Bucket {
            tokens: self.capacity,
            last_refill: now,
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: DateTime<Utc>) {
        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Seconds until one token is available; `None` when one already is
    fn wait_secs(&self, bucket: &Bucket) -> Option<u64> {
        if bucket.tokens + TOKEN_EPSILON >= 1.0 {
            return None;
        }
        let missing = 1.0 - bucket.tokens;
        let retry_after_ms = (missing / self.refill_rate * 1000.0).round() as u64;
        Some(retry_after_ms.div_ceil(1000).max(1))
    }

    fn is_full(&self, bucket: &Bucket) -> bool {
        bucket.tokens + TOKEN_EPSILON >= self.capacity
    }
}

/// Per-client and per-account login limiter
pub struct LoginThrottle {
    enabled: bool,
    per_client: Limit,
    per_account: Limit,
    clients: DashMap<(String, String), Bucket>,
    accounts: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
}

impl LoginThrottle {
    pub fn new(max_attempts: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled: max_attempts > 0,
            per_client: Limit::new(max_attempts, window),
            per_account: Limit::new(max_attempts.saturating_mul(ACCOUNT_BUCKET_FACTOR), window),
            clients: DashMap::new(),
            accounts: DashMap::new(),
            clock,
        }
    }

    fn account_key(email: &str) -> String {
        email.trim().to_lowercase()
    }

    fn client_key(ip: Option<&str>, email: &str) -> (String, String) {
        (ip.unwrap_or("unknown").to_string(), Self::account_key(email))
    }

    /// Consume one attempt or fail with `TooManyAttempts`
    pub fn check(&self, ip: Option<&str>, email: &str) -> Result<(), AuthError> {
        // Zero disables throttling
        if !self.enabled {
            return Ok(());
        }

        let now = self.clock.now();
        // Client entry is always locked before the account entry
        let mut client = self
            .clients
            .entry(Self::client_key(ip, email))
            .or_insert_with(|| self.per_client.full(now));
        let mut account = self
            .accounts
            .entry(Self::account_key(email))
            .or_insert_with(|| self.per_account.full(now));

        self.per_client.refill(&mut client, now);
        self.per_account.refill(&mut account, now);

        let wait = [
            self.per_client.wait_secs(&client),
            self.per_account.wait_secs(&account),
        ]
        .into_iter()
        .flatten()
        .max();

        if let Some(retry_after_secs) = wait {
            tracing::warn!(
                ip = ip.unwrap_or("unknown"),
                retry_after_secs,
                "Login attempts throttled"
            );
            return Err(AuthError::TooManyAttempts { retry_after_secs });
        }

        client.tokens = (client.tokens - 1.0).max(0.0);
        account.tokens = (account.tokens - 1.0).max(0.0);
        Ok(())
    }

    /// Forget both keys after a successful login
    pub fn reset(&self, ip: Option<&str>, email: &str) {
        self.clients.remove(&Self::client_key(ip, email));
        self.accounts.remove(&Self::account_key(email));
    }

    /// Drop buckets that have refilled completely
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.tracked_keys();

        self.clients.retain(|_, bucket| {
            self.per_client.refill(bucket, now);
            !self.per_client.is_full(bucket)
        });
        self.accounts.retain(|_, bucket| {
            self.per_account.refill(bucket, now);
            !self.per_account.is_full(bucket)
        });

        before.saturating_sub(self.tracked_keys())
    }

    /// Number of live buckets across both families
    pub fn tracked_keys(&self) -> usize {
        self.clients.len() + self.accounts.len()
    }
}
