//! Active-session registry and bulk invalidation.
//!
//! Sessions are keyed by token hash in the durable store. Invalidation goes
//! through the revocation list first and only then deletes the session rows,
//! so a revoked token can never slip through between the two steps. Bulk
//! operations emit one summary audit event, not one per session.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditHandle};
use crate::revocation::RevocationList;
use crate::store::{SessionRecord, SessionStore};

/// Outcome of a bulk invalidation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationSummary {
    pub invalidated: usize,
    pub remaining: usize,
}

/// Tracks issued sessions and retires them in bulk.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    revocations: Arc<RevocationList>,
    audit: AuditHandle,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        revocations: Arc<RevocationList>,
        audit: AuditHandle,
    ) -> Self {
        Self {
            store,
            revocations,
            audit,
        }
    }

    /// Record a freshly issued session.
    pub async fn register(
        &self,
        user_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<()> {
        self.store
            .insert_session(SessionRecord {
                token_hash: token_hash.to_string(),
                user_id: user_id.to_string(),
                issued_at: Utc::now(),
                expires_at,
                ip_address: ip_address.map(str::to_string),
                user_agent: user_agent.map(str::to_string),
            })
            .await
    }

    pub async fn count_active(&self, user_id: &str) -> Result<i64> {
        self.store.count_active(user_id).await
    }

    /// Drop one session by token hash. Idempotent; reports whether a
    /// session was actually present.
    pub async fn remove_by_token(&self, token_hash: &str) -> Result<bool> {
        self.store.delete_by_hash(token_hash).await
    }

    /// Invalidate sessions that look like they belong to someone else.
    ///
    /// A session is anomalous only when BOTH its IP and its user agent
    /// differ from the current request's, and all four values are present.
    /// A shared office IP with a new browser, or a roaming laptop on a new
    /// network, each match on one axis and survive.
    pub async fn invalidate_anomalous(
        &self,
        user_id: &str,
        current_ip: Option<&str>,
        current_agent: Option<&str>,
        reason: &str,
    ) -> Result<InvalidationSummary> {
        let (Some(current_ip), Some(current_agent)) = (
            non_empty(current_ip),
            non_empty(current_agent),
        ) else {
            return Ok(InvalidationSummary::default());
        };

        let sessions = self.store.list_active(user_id).await?;
        let total = sessions.len();
        let anomalous: Vec<SessionRecord> = sessions
            .into_iter()
            .filter(|session| {
                let (Some(ip), Some(agent)) = (
                    non_empty(session.ip_address.as_deref()),
                    non_empty(session.user_agent.as_deref()),
                ) else {
                    return false;
                };
                ip != current_ip && agent != current_agent
            })
            .collect();

        if anomalous.is_empty() {
            return Ok(InvalidationSummary {
                invalidated: 0,
                remaining: total,
            });
        }

        self.retire(user_id, &anomalous, reason).await?;
        self.audit.record(
            AuditEvent::new(user_id, "session", user_id, "sessions_invalidated")
                .with_changes(json!({
                    "reason": reason,
                    "invalidatedCount": anomalous.len(),
                    "remainingCount": total - anomalous.len(),
                }))
                .with_summary(&format!(
                    "Invalidated {} anomalous session(s)",
                    anomalous.len()
                ))
                .with_ip(Some(current_ip)),
        );
        Ok(InvalidationSummary {
            invalidated: anomalous.len(),
            remaining: total - anomalous.len(),
        })
    }

    /// Invalidate every active session for a user. For password changes and
    /// administrative response to a compromised account.
    pub async fn invalidate_all(
        &self,
        user_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<InvalidationSummary> {
        let sessions = self.store.list_active(user_id).await?;
        if sessions.is_empty() {
            return Ok(InvalidationSummary::default());
        }

        self.retire(user_id, &sessions, reason).await?;
        self.audit.record(
            AuditEvent::new(actor, "session", user_id, "sessions_revoked")
                .with_changes(json!({
                    "reason": reason,
                    "invalidatedCount": sessions.len(),
                }))
                .with_summary(&format!(
                    "Revoked all {} active session(s)",
                    sessions.len()
                )),
        );
        Ok(InvalidationSummary {
            invalidated: sessions.len(),
            remaining: 0,
        })
    }

    /// Invalidate every active session except the one presenting
    /// `current_token_hash`. The "log out my other devices" operation.
    pub async fn invalidate_others(
        &self,
        user_id: &str,
        current_token_hash: &str,
        reason: &str,
    ) -> Result<InvalidationSummary> {
        let sessions = self.store.list_active(user_id).await?;
        let total = sessions.len();
        let others: Vec<SessionRecord> = sessions
            .into_iter()
            .filter(|session| session.token_hash != current_token_hash)
            .collect();

        if others.is_empty() {
            return Ok(InvalidationSummary {
                invalidated: 0,
                remaining: total,
            });
        }

        self.retire(user_id, &others, reason).await?;
        self.audit.record(
            AuditEvent::new(user_id, "session", user_id, "logout_other_devices")
                .with_changes(json!({
                    "reason": reason,
                    "invalidatedCount": others.len(),
                }))
                .with_summary(&format!("Logged out {} other device(s)", others.len())),
        );
        Ok(InvalidationSummary {
            invalidated: others.len(),
            remaining: total - others.len(),
        })
    }

    /// Revoke first, then delete the session rows.
    async fn retire(
        &self,
        user_id: &str,
        sessions: &[SessionRecord],
        reason: &str,
    ) -> Result<()> {
        for session in sessions {
            self.revocations
                .add_hash(&session.token_hash, Some(user_id), session.expires_at, reason)
                .await?;
        }
        let hashes: Vec<String> = sessions
            .iter()
            .map(|session| session.token_hash.clone())
            .collect();
        self.store.delete_by_hashes(&hashes).await
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::RevocationStore;

    fn registry() -> (SessionRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let revocations = Arc::new(RevocationList::new(
            Arc::clone(&store) as Arc<dyn crate::store::RevocationStore>
        ));
        (
            SessionRegistry::new(
                Arc::clone(&store) as Arc<dyn SessionStore>,
                revocations,
                AuditHandle::disabled(),
            ),
            store,
        )
    }

    async fn seed(
        registry: &SessionRegistry,
        hash: &str,
        ip: Option<&str>,
        agent: Option<&str>,
    ) {
        registry
            .register(
                "user-1",
                hash,
                Utc::now() + chrono::Duration::hours(1),
                ip,
                agent,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn both_axes_must_differ_to_invalidate() {
        let (registry, _store) = registry();
        seed(&registry, "same-both", Some("10.0.0.1"), Some("firefox")).await;
        seed(&registry, "same-ip", Some("10.0.0.1"), Some("chrome")).await;
        seed(&registry, "same-agent", Some("10.0.0.9"), Some("firefox")).await;
        seed(&registry, "differs", Some("10.0.0.9"), Some("chrome")).await;

        let summary = registry
            .invalidate_anomalous("user-1", Some("10.0.0.1"), Some("firefox"), "login_anomaly")
            .await
            .unwrap();

        assert_eq!(summary.invalidated, 1);
        assert_eq!(summary.remaining, 3);
        assert!(!registry.remove_by_token("differs").await.unwrap());
        assert!(registry.remove_by_token("same-ip").await.unwrap());
    }

    #[tokio::test]
    async fn missing_context_invalidates_nothing() {
        let (registry, _store) = registry();
        seed(&registry, "a", Some("10.0.0.9"), Some("chrome")).await;
        seed(&registry, "no-meta", None, None).await;

        let none = registry
            .invalidate_anomalous("user-1", None, Some("firefox"), "login_anomaly")
            .await
            .unwrap();
        assert_eq!(none.invalidated, 0);

        // A session with no recorded IP or agent can never be anomalous.
        let summary = registry
            .invalidate_anomalous("user-1", Some("10.0.0.1"), Some("firefox"), "login_anomaly")
            .await
            .unwrap();
        assert_eq!(summary.invalidated, 1);
        assert!(registry.remove_by_token("no-meta").await.unwrap());
    }

    #[tokio::test]
    async fn invalidated_sessions_are_revoked() {
        let (registry, store) = registry();
        seed(&registry, "victim", Some("10.0.0.9"), Some("chrome")).await;

        registry
            .invalidate_anomalous("user-1", Some("10.0.0.1"), Some("firefox"), "login_anomaly")
            .await
            .unwrap();

        let revocation = store.find_active_revocation("victim").await.unwrap();
        assert_eq!(revocation.unwrap().reason, "login_anomaly");
        assert_eq!(registry.count_active("user-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalidate_all_clears_every_session() {
        let (registry, store) = registry();
        seed(&registry, "a", Some("10.0.0.1"), Some("firefox")).await;
        seed(&registry, "b", Some("10.0.0.2"), Some("chrome")).await;

        let summary = registry
            .invalidate_all("user-1", "admin-1", "password_changed")
            .await
            .unwrap();
        assert_eq!(summary.invalidated, 2);
        assert_eq!(registry.count_active("user-1").await.unwrap(), 0);
        assert!(store.find_active_revocation("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalidate_others_spares_the_current_session() {
        let (registry, _store) = registry();
        seed(&registry, "current", Some("10.0.0.1"), Some("firefox")).await;
        seed(&registry, "other", Some("10.0.0.2"), Some("chrome")).await;

        let summary = registry
            .invalidate_others("user-1", "current", "logout_other_devices")
            .await
            .unwrap();
        assert_eq!(summary.invalidated, 1);
        assert_eq!(summary.remaining, 1);
        assert!(registry.remove_by_token("current").await.unwrap());
    }

    #[tokio::test]
    async fn bulk_invalidation_stores_one_summary_entry() {
        use crate::audit::{AuditService, ColdArchive, SensitivityPolicy};
        use crate::store::AuditStore;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (audit, worker) = AuditService::spawn(
            Arc::clone(&store) as Arc<dyn AuditStore>,
            ColdArchive::new(dir.path()),
            SensitivityPolicy::default(),
            16,
        );
        let revocations = Arc::new(RevocationList::new(
            Arc::clone(&store) as Arc<dyn crate::store::RevocationStore>
        ));
        let registry = SessionRegistry::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            revocations,
            audit,
        );

        seed(&registry, "a", Some("10.0.0.1"), Some("firefox")).await;
        seed(&registry, "b", Some("10.0.0.2"), Some("chrome")).await;
        registry
            .invalidate_all("user-1", "admin-1", "password_changed")
            .await
            .unwrap();

        drop(registry);
        worker.await.unwrap();

        let entry = store.get_audit(1).await.unwrap().unwrap();
        assert_eq!(entry.action, "sessions_revoked");
        assert_eq!(
            entry.summary.as_deref(),
            Some("Revoked all 2 active session(s)")
        );
        assert!(store.get_audit(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_is_idempotent() {
        let (registry, _store) = registry();
        seed(&registry, "a", None, None).await;
        assert!(registry.remove_by_token("a").await.unwrap());
        assert!(!registry.remove_by_token("a").await.unwrap());
    }
}
