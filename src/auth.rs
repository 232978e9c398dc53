//! Authentication orchestrator.
//!
//! Ties the defense layers together in a fixed order on login:
//! input validation, rate limit, lockout, concurrency guard, credential
//! verification, account status, and only then token issuance and session
//! registration. The order is load-bearing: cheap in-process checks run
//! before any database read, and the concurrency guard wraps everything
//! that touches the credential record.
//!
//! Unknown identities and wrong passwords are deliberately
//! indistinguishable: both record a lockout failure against the normalized
//! identifier and both surface the same error shape.

use anyhow::Result;
use secrecy::ExposeSecret;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::audit::{AuditEvent, AuditHandle};
use crate::config::AuthConfig;
use crate::credentials::CredentialVerifier;
use crate::error::AuthError;
use crate::lockout::LockoutEngine;
use crate::login_lock::LoginLock;
use crate::rate_limit::RateLimiter;
use crate::revocation::RevocationList;
use crate::session::SessionRegistry;
use crate::store::{
    AccountStatus, CredentialStore, RevocationStore, SessionStore, UserRecord,
};
use crate::token::{TokenCodec, hash_token};
use crate::types::{ChangePasswordRequest, ChangePasswordResponse, LoginRequest, LoginResponse};

const LOGIN_ENDPOINT: &str = "login";
/// Remaining-attempt hints appear once this few attempts are left.
const HINT_THRESHOLD: u32 = 2;

/// The authentication core. One instance per process; engines and stores
/// are shared behind it.
pub struct Authenticator {
    verifier: CredentialVerifier,
    codec: TokenCodec,
    users: Arc<dyn CredentialStore>,
    lockout: Arc<LockoutEngine>,
    rate: Arc<RateLimiter>,
    login_lock: LoginLock,
    revocations: Arc<RevocationList>,
    sessions: SessionRegistry,
    audit: AuditHandle,
    min_password_length: usize,
}

impl Authenticator {
    /// Build the core from configuration and store handles.
    ///
    /// # Errors
    ///
    /// Fails when the token signing secret is too short.
    pub fn new(
        config: &AuthConfig,
        users: Arc<dyn CredentialStore>,
        session_store: Arc<dyn SessionStore>,
        revocation_store: Arc<dyn RevocationStore>,
        audit: AuditHandle,
    ) -> Result<Self> {
        let codec = TokenCodec::new(
            config.token_secret(),
            config.token_issuer().to_string(),
            config.token_ttl_seconds(),
        )?;
        let revocations = Arc::new(RevocationList::new(revocation_store));
        let sessions = SessionRegistry::new(
            session_store,
            Arc::clone(&revocations),
            audit.clone(),
        );
        Ok(Self {
            verifier: CredentialVerifier::new(config.allow_insecure_legacy()),
            codec,
            users,
            lockout: Arc::new(LockoutEngine::new(
                config.max_failed_attempts(),
                config.lockout_duration(),
                config.failure_idle_expiry(),
                audit.clone(),
            )),
            rate: Arc::new(RateLimiter::new(
                config.rate_limit(),
                config.rate_window(),
                config.rate_bucket_max_age(),
            )),
            login_lock: LoginLock::new(config.login_lock_hold()),
            revocations,
            sessions,
            audit,
            min_password_length: config.min_password_length(),
        })
    }

    /// Authenticate an identity and issue a session token.
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, AuthError> {
        let identifier = request.identifier.trim();
        if identifier.is_empty() {
            return Err(AuthError::InvalidInput(
                "identifier must not be empty".to_string(),
            ));
        }
        if request.secret.expose_secret().is_empty() {
            return Err(AuthError::InvalidInput(
                "secret must not be empty".to_string(),
            ));
        }

        let ip = trimmed(request.ip_address.as_deref());
        let agent = trimmed(request.user_agent.as_deref());
        // Throttle by source address when known, by identifier otherwise.
        let rate_key = ip.unwrap_or(identifier);
        if self.rate.should_block(rate_key, LOGIN_ENDPOINT) {
            return Err(AuthError::RateLimited {
                retry_after_seconds: self.rate.retry_after_seconds(rate_key, LOGIN_ENDPOINT),
            });
        }
        self.rate.record_request(rate_key, LOGIN_ENDPOINT);

        let status = self.lockout.check(identifier);
        if status.locked {
            return Err(AuthError::Locked {
                remaining_minutes: status.remaining_minutes,
            });
        }

        let _lock_guard = self
            .login_lock
            .try_acquire(identifier)
            .ok_or(AuthError::Conflict)?;

        let Some(user) = self.users.find_by_identifier(identifier).await? else {
            return Err(self.failed_attempt(identifier, ip, "unknown_identity"));
        };

        let outcome = self.verifier.verify(&request.secret, &user.password_hash);
        if !outcome.valid {
            return Err(self.failed_attempt(identifier, ip, "invalid_credentials"));
        }

        match user.status {
            AccountStatus::Active => {}
            AccountStatus::Frozen => {
                return Err(AuthError::Forbidden("Account is frozen".to_string()));
            }
            AccountStatus::Deleted => {
                return Err(AuthError::Forbidden("Account is deleted".to_string()));
            }
        }

        self.lockout.reset(identifier);
        self.rate.reset(rate_key, LOGIN_ENDPOINT);

        // Migrate legacy hashes on the same write that stamps the login.
        let upgraded = if outcome.needs_upgrade {
            Some(self.verifier.hash(&request.secret)?)
        } else {
            None
        };
        self.users.record_login(&user.id, upgraded.as_deref()).await?;

        let invalidated = self
            .sessions
            .invalidate_anomalous(&user.id, ip, agent, "session_anomaly")
            .await?;

        let issued = self.codec.issue(&user.id, user.auth_version)?;
        self.sessions
            .register(
                &user.id,
                &hash_token(&issued.token),
                issued.expires_at,
                ip,
                agent,
            )
            .await?;
        let session_count = self.sessions.count_active(&user.id).await?;

        self.audit.record(
            AuditEvent::new(&user.id, "user", &user.id, "login")
                .with_actor_name(&user.display_name)
                .with_changes(json!({
                    "identifier": user.identifier,
                    "sessionCount": session_count,
                    "upgradedHash": upgraded.is_some(),
                }))
                .with_ip(ip),
        );

        Ok(LoginResponse {
            token: issued.token,
            expires_in_seconds: issued.expires_in_seconds,
            session_count,
            must_change_password: user.must_change_password,
            invalidated_sessions: invalidated.invalidated,
        })
    }

    /// Validate a presented token end to end: signature, expiry, revocation,
    /// credential version, and account status. Returns the owning record.
    pub async fn authenticate(&self, token: &str) -> Result<UserRecord, AuthError> {
        let claims = self
            .codec
            .claims(token)
            .map_err(|_| AuthError::invalid_credentials())?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::invalid_credentials());
        }
        if self.revocations.is_revoked(&hash_token(token)).await? {
            return Err(AuthError::invalid_credentials());
        }

        let user = self
            .users
            .find_by_id(&claims.sub)
            .await?
            .ok_or_else(AuthError::invalid_credentials)?;
        if claims.auth_version != user.auth_version {
            // Token predates a password change.
            return Err(AuthError::invalid_credentials());
        }
        match user.status {
            AccountStatus::Active => Ok(user),
            AccountStatus::Frozen => Err(AuthError::Forbidden("Account is frozen".to_string())),
            AccountStatus::Deleted => Err(AuthError::Forbidden("Account is deleted".to_string())),
        }
    }

    /// Revoke a token and retire its session. Idempotent; reports whether a
    /// live session was removed. An undecodable token is a no-op: it can
    /// never authenticate, so there is nothing to revoke.
    pub async fn logout(&self, token: &str) -> Result<bool, AuthError> {
        let Ok(claims) = self.codec.claims(token) else {
            return Ok(false);
        };
        self.revocations
            .add(&self.codec, token, Some(&claims.sub), "logout")
            .await?;
        let removed = self.sessions.remove_by_token(&hash_token(token)).await?;
        if removed {
            self.audit
                .record(AuditEvent::new(&claims.sub, "user", &claims.sub, "logout"));
        }
        Ok(removed)
    }

    /// Change the authenticated identity's password. Every existing session
    /// is revoked and the credential version advanced, so all previously
    /// issued tokens die with the old password.
    pub async fn change_password(
        &self,
        token: &str,
        request: &ChangePasswordRequest,
    ) -> Result<ChangePasswordResponse, AuthError> {
        let user = self.authenticate(token).await?;

        let outcome = self
            .verifier
            .verify(&request.current_secret, &user.password_hash);
        if !outcome.valid {
            return Err(self.failed_attempt(&user.identifier, None, "invalid_current_password"));
        }

        let new_secret = request.new_secret.expose_secret();
        if new_secret.len() < self.min_password_length {
            return Err(AuthError::InvalidInput(format!(
                "new password must be at least {} characters",
                self.min_password_length
            )));
        }
        if new_secret == request.current_secret.expose_secret() {
            return Err(AuthError::InvalidInput(
                "new password must differ from the current one".to_string(),
            ));
        }

        let hash = self.verifier.hash(&request.new_secret)?;
        let auth_version = self.users.update_password(&user.id, &hash).await?;
        let summary = self
            .sessions
            .invalidate_all(&user.id, &user.id, "password_changed")
            .await?;

        self.audit.record(
            AuditEvent::new(&user.id, "user", &user.id, "change_password")
                .with_actor_name(&user.display_name)
                .with_changes(json!({
                    "authVersion": auth_version,
                    "sessionsRevoked": summary.invalidated,
                })),
        );

        Ok(ChangePasswordResponse {
            auth_version,
            sessions_revoked: summary.invalidated,
        })
    }

    /// Administrative unlock of a locked-out identity.
    pub fn unlock(&self, identity: &str, actor: &str) -> bool {
        self.lockout.unlock(identity, actor)
    }

    #[must_use]
    pub fn lockout(&self) -> &LockoutEngine {
        &self.lockout
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate
    }

    #[must_use]
    pub fn revocations(&self) -> &Arc<RevocationList> {
        &self.revocations
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[must_use]
    pub fn token_codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Spawn the periodic maintenance tasks: rate-bucket sweep, revocation
    /// sweep, and lockout pruning. Tasks run until aborted.
    #[must_use]
    pub fn spawn_maintenance(&self, period: Duration) -> Vec<JoinHandle<()>> {
        let lockout = Arc::clone(&self.lockout);
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                lockout.prune();
            }
        });
        vec![
            self.rate.spawn_sweeper(period),
            self.revocations.spawn_sweeper(period),
            pruner,
        ]
    }

    /// Record a failed attempt and shape the caller-facing error. Unknown
    /// identity and wrong password both land here, on purpose.
    fn failed_attempt(&self, identifier: &str, ip: Option<&str>, reason: &str) -> AuthError {
        let attempt = self.lockout.record_failure(identifier, ip);
        self.audit.record(
            AuditEvent::new(identifier, "auth", identifier, "login_failed")
                .with_changes(json!({
                    "reason": reason,
                    "remainingAttempts": attempt.remaining_attempts,
                }))
                .with_ip(ip),
        );

        if attempt.locked {
            return AuthError::Locked {
                remaining_minutes: self.lockout.check(identifier).remaining_minutes,
            };
        }
        if attempt.remaining_attempts <= HINT_THRESHOLD {
            return AuthError::Unauthenticated {
                remaining_attempts: Some(attempt.remaining_attempts),
                warning: Some(format!(
                    "{} attempt(s) remaining before the account is locked",
                    attempt.remaining_attempts
                )),
            };
        }
        AuthError::invalid_credentials()
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use secrecy::SecretString;
    use std::path::PathBuf;

    // md5("password")
    const LEGACY_HASH: &str = "5f4dcc3b5aa765d61d8327deb882cf99";

    fn config() -> AuthConfig {
        AuthConfig::new(
            SecretString::from("an-adequately-long-signing-secret-value"),
            PathBuf::from("/tmp/audit-archive"),
        )
        .with_allow_insecure_legacy(true)
    }

    fn build(config: &AuthConfig) -> (Authenticator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let auth = Authenticator::new(
            config,
            Arc::clone(&store) as Arc<dyn CredentialStore>,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::clone(&store) as Arc<dyn RevocationStore>,
            AuditHandle::disabled(),
        )
        .unwrap();
        (auth, store)
    }

    fn seed_user(store: &MemoryStore, status: AccountStatus) {
        store.put_user(UserRecord {
            id: "u1".to_string(),
            identifier: "alice@example.com".to_string(),
            display_name: "Alice".to_string(),
            password_hash: LEGACY_HASH.to_string(),
            status,
            auth_version: 1,
            must_change_password: false,
            last_login_at: None,
        });
    }

    fn login_request(identifier: &str, secret: &str) -> LoginRequest {
        LoginRequest {
            identifier: identifier.to_string(),
            secret: SecretString::from(secret),
            ip_address: Some("203.0.113.5".to_string()),
            user_agent: Some("firefox".to_string()),
        }
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_any_lookup() {
        let (auth, _store) = build(&config());
        let err = auth.login(&login_request("  ", "password")).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = auth
            .login(&login_request("alice@example.com", ""))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn unknown_identity_and_wrong_password_are_indistinguishable() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);

        let unknown = auth
            .login(&login_request("nobody@example.com", "password"))
            .await
            .unwrap_err();
        let wrong = auth
            .login(&login_request("alice@example.com", "wrong"))
            .await
            .unwrap_err();

        assert_eq!(unknown.status_code(), 401);
        assert_eq!(wrong.status_code(), 401);
        assert_eq!(unknown.to_string(), wrong.to_string());

        // Both paths accumulate lockout failures.
        assert_eq!(auth.lockout().check("nobody@example.com").attempts, 1);
        assert_eq!(auth.lockout().check("alice@example.com").attempts, 1);
    }

    #[tokio::test]
    async fn repeated_failures_hint_then_lock() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);
        let request = login_request("alice@example.com", "wrong");

        for expected in [4_u32, 3] {
            let err = auth.login(&request).await.unwrap_err();
            match err {
                AuthError::Unauthenticated {
                    remaining_attempts, ..
                } => assert_eq!(remaining_attempts, None, "no hint at {expected} remaining"),
                other => panic!("unexpected error: {other}"),
            }
        }
        for expected in [2_u32, 1] {
            match auth.login(&request).await.unwrap_err() {
                AuthError::Unauthenticated {
                    remaining_attempts,
                    warning,
                } => {
                    assert_eq!(remaining_attempts, Some(expected));
                    assert!(warning.is_some());
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        let err = auth.login(&request).await.unwrap_err();
        assert!(matches!(err, AuthError::Locked { .. }));

        // Even the correct password is refused while locked.
        let err = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 423);
    }

    #[tokio::test]
    async fn successful_login_issues_token_and_upgrades_hash() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);
        auth.login(&login_request("alice@example.com", "wrong"))
            .await
            .unwrap_err();

        let response = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap();
        assert_eq!(response.session_count, 1);
        assert_eq!(response.invalidated_sessions, 0);

        let user = store.user("u1").unwrap();
        assert!(user.password_hash.starts_with("$argon2id$"));
        assert!(user.last_login_at.is_some());
        assert_eq!(auth.lockout().check("alice@example.com").attempts, 0);

        let authenticated = auth.authenticate(&response.token).await.unwrap();
        assert_eq!(authenticated.id, "u1");
    }

    #[tokio::test]
    async fn login_is_rate_limited_per_source() {
        let config = config().with_rate_limit(2);
        let (auth, store) = build(&config);
        seed_user(&store, AccountStatus::Active);
        let request = login_request("alice@example.com", "wrong");

        auth.login(&request).await.unwrap_err();
        auth.login(&request).await.unwrap_err();
        let err = auth.login(&request).await.unwrap_err();
        assert_eq!(err.status_code(), 429);

        // A different source address is unaffected.
        let mut other = login_request("alice@example.com", "wrong");
        other.ip_address = Some("203.0.113.9".to_string());
        assert_eq!(auth.login(&other).await.unwrap_err().status_code(), 401);
    }

    #[tokio::test]
    async fn concurrent_login_for_same_identity_conflicts() {
        let config = config().with_login_lock_hold(Duration::from_secs(5));
        let (auth, store) = build(&config);
        seed_user(&store, AccountStatus::Active);

        // First attempt still in flight: its guard is held.
        let held = auth.login_lock.try_acquire("alice@example.com").unwrap();

        let err = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict));
        assert_eq!(err.status_code(), 409);
        // The rejected attempt consumed no failure budget.
        assert_eq!(auth.lockout().check("alice@example.com").attempts, 0);

        drop(held);
        auth.login(&login_request("alice@example.com", "password"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn frozen_account_is_forbidden_with_valid_credentials() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Frozen);

        let err = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
        // Valid credentials against a frozen account are not a failed attempt.
        assert_eq!(auth.lockout().check("alice@example.com").attempts, 0);
    }

    #[tokio::test]
    async fn logout_revokes_and_is_idempotent() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);
        let response = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap();

        assert!(auth.logout(&response.token).await.unwrap());
        assert!(!auth.logout(&response.token).await.unwrap());
        assert!(!auth.logout("garbage").await.unwrap());

        let err = auth.authenticate(&response.token).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn password_change_kills_old_tokens() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);
        let response = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap();

        let err = auth
            .change_password(
                &response.token,
                &ChangePasswordRequest {
                    current_secret: SecretString::from("wrong"),
                    new_secret: SecretString::from("brand-new-password"),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 401);

        let err = auth
            .change_password(
                &response.token,
                &ChangePasswordRequest {
                    current_secret: SecretString::from("password"),
                    new_secret: SecretString::from("short"),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let changed = auth
            .change_password(
                &response.token,
                &ChangePasswordRequest {
                    current_secret: SecretString::from("password"),
                    new_secret: SecretString::from("brand-new-password"),
                },
            )
            .await
            .unwrap();
        assert_eq!(changed.auth_version, 2);
        assert_eq!(changed.sessions_revoked, 1);

        // The old token is dead on both axes: revoked and version-mismatched.
        assert_eq!(
            auth.authenticate(&response.token).await.unwrap_err().status_code(),
            401
        );

        let relogin = auth
            .login(&login_request("alice@example.com", "brand-new-password"))
            .await
            .unwrap();
        assert!(auth.authenticate(&relogin.token).await.is_ok());
    }

    #[tokio::test]
    async fn anomalous_sessions_are_invalidated_on_login() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);

        let mut elsewhere = login_request("alice@example.com", "password");
        elsewhere.ip_address = Some("198.51.100.7".to_string());
        elsewhere.user_agent = Some("curl".to_string());
        let stolen = auth.login(&elsewhere).await.unwrap();

        let response = auth
            .login(&login_request("alice@example.com", "password"))
            .await
            .unwrap();
        assert_eq!(response.invalidated_sessions, 1);
        assert_eq!(response.session_count, 1);
        assert_eq!(
            auth.authenticate(&stolen.token).await.unwrap_err().status_code(),
            401
        );
    }

    #[tokio::test]
    async fn admin_unlock_restores_access() {
        let (auth, store) = build(&config());
        seed_user(&store, AccountStatus::Active);
        let request = login_request("alice@example.com", "wrong");
        for _ in 0..5 {
            let _ = auth.login(&request).await;
        }
        assert!(auth.lockout().check("alice@example.com").locked);

        assert!(auth.unlock("alice@example.com", "admin-1"));
        auth.login(&login_request("alice@example.com", "password"))
            .await
            .unwrap();
    }
}
