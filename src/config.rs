//! Authentication core configuration.

use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
const DEFAULT_LOCKOUT_MINUTES: u64 = 30;
const DEFAULT_FAILURE_IDLE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_RATE_LIMIT: u32 = 10;
const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_RATE_BUCKET_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_LOGIN_LOCK_HOLD: Duration = Duration::from_secs(1);
const DEFAULT_TOKEN_TTL_SECONDS: i64 = 8 * 60 * 60;
const DEFAULT_TOKEN_ISSUER: &str = "gardisto";
const DEFAULT_MIN_PASSWORD_LENGTH: usize = 8;
const DEFAULT_AUDIT_QUEUE_CAPACITY: usize = 1024;

/// Tunables for the authentication core.
///
/// Constructed with defaults matching the production deployment and adjusted
/// with `with_*` builders. No value is read from the environment here; the
/// caller wires configuration in.
#[derive(Clone)]
pub struct AuthConfig {
    token_secret: SecretString,
    token_issuer: String,
    token_ttl_seconds: i64,
    max_failed_attempts: u32,
    lockout_duration: Duration,
    failure_idle_expiry: Duration,
    rate_limit: u32,
    rate_window: Duration,
    rate_bucket_max_age: Duration,
    login_lock_hold: Duration,
    min_password_length: usize,
    allow_insecure_legacy: bool,
    audit_queue_capacity: usize,
    archive_root: PathBuf,
}

impl AuthConfig {
    #[must_use]
    pub fn new(token_secret: SecretString, archive_root: PathBuf) -> Self {
        Self {
            token_secret,
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            token_ttl_seconds: DEFAULT_TOKEN_TTL_SECONDS,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            lockout_duration: Duration::from_secs(DEFAULT_LOCKOUT_MINUTES * 60),
            failure_idle_expiry: DEFAULT_FAILURE_IDLE_EXPIRY,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
            rate_bucket_max_age: DEFAULT_RATE_BUCKET_MAX_AGE,
            login_lock_hold: DEFAULT_LOGIN_LOCK_HOLD,
            min_password_length: DEFAULT_MIN_PASSWORD_LENGTH,
            allow_insecure_legacy: false,
            audit_queue_capacity: DEFAULT_AUDIT_QUEUE_CAPACITY,
            archive_root,
        }
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String) -> Self {
        self.token_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_failed_attempts(mut self, attempts: u32) -> Self {
        self.max_failed_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_lockout_duration(mut self, duration: Duration) -> Self {
        self.lockout_duration = duration;
        self
    }

    #[must_use]
    pub fn with_failure_idle_expiry(mut self, duration: Duration) -> Self {
        self.failure_idle_expiry = duration;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, limit: u32) -> Self {
        self.rate_limit = limit;
        self
    }

    #[must_use]
    pub fn with_rate_window(mut self, window: Duration) -> Self {
        self.rate_window = window;
        self
    }

    #[must_use]
    pub fn with_rate_bucket_max_age(mut self, max_age: Duration) -> Self {
        self.rate_bucket_max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_login_lock_hold(mut self, hold: Duration) -> Self {
        self.login_lock_hold = hold;
        self
    }

    #[must_use]
    pub fn with_min_password_length(mut self, length: usize) -> Self {
        self.min_password_length = length;
        self
    }

    /// Enable verification of the deprecated fast hash. Off by default;
    /// intended for development databases that still carry bare digests.
    #[must_use]
    pub fn with_allow_insecure_legacy(mut self, allow: bool) -> Self {
        self.allow_insecure_legacy = allow;
        self
    }

    #[must_use]
    pub fn with_audit_queue_capacity(mut self, capacity: usize) -> Self {
        self.audit_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn token_secret(&self) -> &SecretString {
        &self.token_secret
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn token_ttl_seconds(&self) -> i64 {
        self.token_ttl_seconds
    }

    #[must_use]
    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    #[must_use]
    pub fn lockout_duration(&self) -> Duration {
        self.lockout_duration
    }

    #[must_use]
    pub fn failure_idle_expiry(&self) -> Duration {
        self.failure_idle_expiry
    }

    #[must_use]
    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        self.rate_window
    }

    #[must_use]
    pub fn rate_bucket_max_age(&self) -> Duration {
        self.rate_bucket_max_age
    }

    #[must_use]
    pub fn login_lock_hold(&self) -> Duration {
        self.login_lock_hold
    }

    #[must_use]
    pub fn min_password_length(&self) -> usize {
        self.min_password_length
    }

    #[must_use]
    pub fn allow_insecure_legacy(&self) -> bool {
        self.allow_insecure_legacy
    }

    #[must_use]
    pub fn audit_queue_capacity(&self) -> usize {
        self.audit_queue_capacity
    }

    #[must_use]
    pub fn archive_root(&self) -> &PathBuf {
        &self.archive_root
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Token secret is deliberately omitted.
        f.debug_struct("AuthConfig")
            .field("token_issuer", &self.token_issuer)
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("max_failed_attempts", &self.max_failed_attempts)
            .field("lockout_duration", &self.lockout_duration)
            .field("rate_limit", &self.rate_limit)
            .field("rate_window", &self.rate_window)
            .field("allow_insecure_legacy", &self.allow_insecure_legacy)
            .field("archive_root", &self.archive_root)
            .finish_non_exhaustive()
    }
}
