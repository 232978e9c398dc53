//! Tamper-evident audit logging.
//!
//! Callers hand events to a cheap clonable [`AuditHandle`]; a single worker
//! task drains the bounded queue and persists them. Routing all writes
//! through one worker serializes sensitive entries, which keeps the hash
//! chain consistent without a database lock. When the queue is full the
//! event is dropped and logged; audit pressure must never stall logins.
//!
//! Sensitive entries (per [`SensitivityPolicy`]) are chained and mirrored to
//! cold storage; plain entries are just rows.

pub mod archive;
pub mod chain;
pub mod sensitivity;

pub use archive::{ArchiveVerification, ColdArchive};
pub use chain::{BrokenLink, ChainVerification, verify_chain};
pub use sensitivity::SensitivityPolicy;

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::AuthConfig;
use crate::store::{AuditStore, NewAuditRecord};

/// One event to record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor_id: String,
    pub actor_name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub changes: Option<Value>,
    pub summary: Option<String>,
    pub ip_address: Option<String>,
}

impl AuditEvent {
    /// Event by `actor` on `entity_id`. The actor id doubles as the display
    /// name until overridden.
    #[must_use]
    pub fn new(actor: &str, entity_type: &str, entity_id: &str, action: &str) -> Self {
        Self {
            actor_id: actor.to_string(),
            actor_name: actor.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            changes: None,
            summary: None,
            ip_address: None,
        }
    }

    #[must_use]
    pub fn with_actor_name(mut self, name: &str) -> Self {
        self.actor_name = name.to_string();
        self
    }

    #[must_use]
    pub fn with_changes(mut self, changes: Value) -> Self {
        self.changes = Some(changes);
        self
    }

    #[must_use]
    pub fn with_summary(mut self, summary: &str) -> Self {
        self.summary = Some(summary.to_string());
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip_address: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone)]
enum HandleInner {
    Active(mpsc::Sender<AuditEvent>),
    Disabled,
}

/// Non-blocking submission side of the audit pipeline.
#[derive(Debug, Clone)]
pub struct AuditHandle {
    inner: HandleInner,
}

impl AuditHandle {
    /// Handle that discards every event. For engines under test and
    /// deployments that opt out of auditing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: HandleInner::Disabled,
        }
    }

    /// Enqueue an event; never blocks. On a full or closed queue the event
    /// is dropped and a warning logged.
    pub fn record(&self, event: AuditEvent) {
        let HandleInner::Active(sender) = &self.inner else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(action = %event.action, "audit queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(action = %event.action, "audit worker gone, dropping event");
            }
        }
    }
}

/// Owns the worker draining the audit queue.
#[derive(Debug)]
pub struct AuditService;

impl AuditService {
    /// Spawn the worker and return the submission handle plus the worker
    /// task. The pipeline shuts down once every handle clone is dropped.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        cold_archive: ColdArchive,
        policy: SensitivityPolicy,
        queue_capacity: usize,
    ) -> (AuditHandle, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<AuditEvent>(queue_capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let action = event.action.clone();
                if let Err(err) = persist_event(&*store, &cold_archive, &policy, event).await {
                    // An audit failure never propagates to the caller.
                    warn!(%action, "audit write failed: {err:#}");
                }
            }
        });
        (
            AuditHandle {
                inner: HandleInner::Active(sender),
            },
            worker,
        )
    }

    /// Spawn the worker wired from configuration: the archive root and the
    /// queue capacity come from [`AuthConfig`].
    #[must_use]
    pub fn spawn_from(
        config: &AuthConfig,
        store: Arc<dyn AuditStore>,
        policy: SensitivityPolicy,
    ) -> (AuditHandle, JoinHandle<()>) {
        Self::spawn(
            store,
            ColdArchive::new(config.archive_root().clone()),
            policy,
            config.audit_queue_capacity(),
        )
    }
}

/// Persist one event: classify, chain if sensitive, insert, archive.
pub async fn persist_event(
    store: &dyn AuditStore,
    cold_archive: &ColdArchive,
    policy: &SensitivityPolicy,
    event: AuditEvent,
) -> Result<i64> {
    let sensitive = policy.is_sensitive(&event.action, &event.entity_type);
    let mut record = NewAuditRecord {
        actor_id: event.actor_id,
        actor_name: event.actor_name,
        entity_type: event.entity_type,
        entity_id: event.entity_id,
        action: event.action,
        changes: event.changes,
        summary: event.summary,
        ip_address: event.ip_address,
        sensitive,
        immutable: sensitive,
        chain_hash: None,
        created_at: Utc::now(),
    };

    if sensitive {
        let previous = store.last_chain_hash().await?;
        record.chain_hash = Some(chain::chain_hash(previous.as_deref(), &record)?);
    }

    let id = store.insert_audit(record.clone()).await?;
    if sensitive {
        cold_archive.archive(store, &record.into_record(id)).await?;
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn setup() -> (MemoryStore, ColdArchive, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let archive = ColdArchive::new(dir.path());
        (MemoryStore::new(), archive, dir)
    }

    #[tokio::test]
    async fn plain_event_gets_no_chain_or_archive() {
        let (store, archive, _dir) = setup();
        let event = AuditEvent::new("alice", "user", "u1", "login").with_ip(Some("203.0.113.5"));

        let id = persist_event(&store, &archive, &SensitivityPolicy::default(), event)
            .await
            .unwrap();

        let entry = store.get_audit(id).await.unwrap().unwrap();
        assert!(!entry.sensitive);
        assert!(entry.chain_hash.is_none());
        assert!(store.archive_metadata(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sensitive_event_is_chained_and_archived() {
        let (store, archive, _dir) = setup();
        let event = AuditEvent::new("alice", "auth", "alice", "account_locked")
            .with_changes(json!({"attemptCount": 5}));

        let id = persist_event(&store, &archive, &SensitivityPolicy::default(), event)
            .await
            .unwrap();

        let entry = store.get_audit(id).await.unwrap().unwrap();
        assert!(entry.sensitive);
        assert!(entry.immutable);
        assert!(entry.chain_hash.is_some());
        assert!(store.archive_metadata(id).await.unwrap().is_some());

        let verification = verify_chain(&store, None, None).await.unwrap();
        assert!(verification.valid);
        assert_eq!(verification.verified_count, 1);
    }

    #[tokio::test]
    async fn consecutive_sensitive_events_link_up() {
        let (store, archive, _dir) = setup();
        let policy = SensitivityPolicy::default();

        for action in ["account_locked", "account_unlocked", "sessions_revoked"] {
            persist_event(
                &store,
                &archive,
                &policy,
                AuditEvent::new("admin-1", "auth", "alice", action),
            )
            .await
            .unwrap();
        }

        let verification = verify_chain(&store, None, None).await.unwrap();
        assert!(verification.valid);
        assert_eq!(verification.verified_count, 3);
    }

    #[tokio::test]
    async fn worker_drains_queue() {
        let (store, archive, _dir) = setup();
        let store = Arc::new(store);
        let (handle, worker) = AuditService::spawn(
            Arc::clone(&store) as Arc<dyn AuditStore>,
            archive,
            SensitivityPolicy::default(),
            16,
        );

        handle.record(AuditEvent::new("alice", "user", "u1", "login"));
        handle.record(AuditEvent::new("admin-1", "auth", "alice", "account_unlocked"));
        drop(handle);
        worker.await.unwrap();

        assert!(store.get_audit(1).await.unwrap().is_some());
        assert!(store.get_audit(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spawn_from_archives_under_the_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::new(
            secrecy::SecretString::from("an-adequately-long-signing-secret-value"),
            dir.path().to_path_buf(),
        )
        .with_audit_queue_capacity(8);
        let store = Arc::new(MemoryStore::new());

        let (handle, worker) = AuditService::spawn_from(
            &config,
            Arc::clone(&store) as Arc<dyn AuditStore>,
            SensitivityPolicy::default(),
        );
        handle.record(AuditEvent::new("admin-1", "auth", "alice", "account_locked"));
        drop(handle);
        worker.await.unwrap();

        let metadata = store.archive_metadata(1).await.unwrap().unwrap();
        assert!(
            std::path::Path::new(&metadata.file_path).starts_with(dir.path()),
            "artifact {} not under configured root {}",
            metadata.file_path,
            dir.path().display()
        );
    }

    #[test]
    fn disabled_handle_swallows_events() {
        AuditHandle::disabled().record(AuditEvent::new("a", "b", "c", "d"));
    }
}
