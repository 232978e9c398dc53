//! In-memory store backend.
//!
//! Backs tests and embedded deployments with the same trait surface as the
//! `PostgreSQL` backend. A single mutex over the whole state is plenty at
//! test scale and keeps cross-table operations trivially consistent.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{
    ArchiveMetadata, ArchiveStats, AuditRecord, AuditStore, CredentialStore, NewAuditRecord,
    RevocationRecord, RevocationStore, SessionRecord, SessionStore, UserRecord,
};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    sessions: HashMap<String, SessionRecord>,
    revocations: HashMap<String, RevocationRecord>,
    audits: Vec<AuditRecord>,
    next_audit_id: i64,
    archives: HashMap<i64, ArchiveMetadata>,
}

/// Store backend holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user record, replacing any existing record with the same id.
    pub fn put_user(&self, user: UserRecord) {
        self.lock().users.insert(user.id.clone(), user);
    }

    /// Snapshot of a user record, if present.
    #[must_use]
    pub fn user(&self, id: &str) -> Option<UserRecord> {
        self.lock().users.get(id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked mid-test.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>> {
        let wanted = identifier.trim().to_lowercase();
        Ok(self
            .lock()
            .users
            .values()
            .find(|user| user.identifier.to_lowercase() == wanted)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        Ok(self.lock().users.get(id).cloned())
    }

    async fn record_login(&self, id: &str, upgraded_hash: Option<&str>) -> Result<()> {
        if let Some(user) = self.lock().users.get_mut(id) {
            if let Some(hash) = upgraded_hash {
                user.password_hash = hash.to_string();
            }
            user.last_login_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_password(&self, id: &str, hash: &str) -> Result<i64> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown user {id}"))?;
        user.password_hash = hash.to_string();
        user.auth_version += 1;
        user.must_change_password = false;
        Ok(user.auth_version)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: SessionRecord) -> Result<()> {
        self.lock()
            .sessions
            .entry(session.token_hash.clone())
            .or_insert(session);
        Ok(())
    }

    async fn list_active(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let now = Utc::now();
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|session| session.user_id == user_id && session.expires_at > now)
            .cloned()
            .collect())
    }

    async fn count_active(&self, user_id: &str) -> Result<i64> {
        let now = Utc::now();
        Ok(self
            .lock()
            .sessions
            .values()
            .filter(|session| session.user_id == user_id && session.expires_at > now)
            .count() as i64)
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool> {
        Ok(self.lock().sessions.remove(token_hash).is_some())
    }

    async fn delete_by_hashes(&self, token_hashes: &[String]) -> Result<()> {
        let mut inner = self.lock();
        for hash in token_hashes {
            inner.sessions.remove(hash);
        }
        Ok(())
    }
}

#[async_trait]
impl RevocationStore for MemoryStore {
    async fn insert_revocation(&self, record: RevocationRecord) -> Result<()> {
        self.lock()
            .revocations
            .entry(record.token_hash.clone())
            .or_insert(record);
        Ok(())
    }

    async fn find_active_revocation(&self, token_hash: &str) -> Result<Option<RevocationRecord>> {
        let now = Utc::now();
        Ok(self
            .lock()
            .revocations
            .get(token_hash)
            .filter(|record| record.expires_at > now)
            .cloned())
    }

    async fn delete_expired_revocations(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .revocations
            .values()
            .filter(|record| record.expires_at <= now)
            .map(|record| record.token_hash.clone())
            .collect();
        for hash in &expired {
            inner.revocations.remove(hash);
        }
        Ok(expired)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, record: NewAuditRecord) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_audit_id += 1;
        let id = inner.next_audit_id;
        inner.audits.push(record.into_record(id));
        Ok(id)
    }

    async fn last_chain_hash(&self) -> Result<Option<String>> {
        Ok(self
            .lock()
            .audits
            .iter()
            .rev()
            .find_map(|entry| entry.chain_hash.clone()))
    }

    async fn get_audit(&self, id: i64) -> Result<Option<AuditRecord>> {
        Ok(self
            .lock()
            .audits
            .iter()
            .find(|entry| entry.id == id)
            .cloned())
    }

    async fn chained_range(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self
            .lock()
            .audits
            .iter()
            .filter(|entry| {
                entry.chain_hash.is_some()
                    && start_id.is_none_or(|start| entry.id >= start)
                    && end_id.is_none_or(|end| entry.id <= end)
            })
            .cloned()
            .collect())
    }

    async fn upsert_archive_metadata(&self, metadata: ArchiveMetadata) -> Result<()> {
        self.lock().archives.insert(metadata.audit_id, metadata);
        Ok(())
    }

    async fn archive_metadata(&self, audit_id: i64) -> Result<Option<ArchiveMetadata>> {
        Ok(self.lock().archives.get(&audit_id).cloned())
    }

    async fn set_verification_status(&self, audit_id: i64, status: &str) -> Result<()> {
        if let Some(metadata) = self.lock().archives.get_mut(&audit_id) {
            metadata.verification_status = status.to_string();
            metadata.verified_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn archive_stats(&self) -> Result<ArchiveStats> {
        let inner = self.lock();
        let mut stats = ArchiveStats::default();
        for metadata in inner.archives.values() {
            stats.total_archived += 1;
            match metadata.verification_status.as_str() {
                "verified" => stats.total_verified += 1,
                "failed" => stats.total_failed += 1,
                _ => {}
            }
            stats.oldest_archive = Some(match stats.oldest_archive {
                Some(oldest) => oldest.min(metadata.archived_at),
                None => metadata.archived_at,
            });
            stats.newest_archive = Some(match stats.newest_archive {
                Some(newest) => newest.max(metadata.archived_at),
                None => metadata.archived_at,
            });
        }
        Ok(stats)
    }
}
