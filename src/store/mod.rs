//! Repository-style store traits and their record types.
//!
//! The durable store is the single source of truth for credentials,
//! sessions, revocations, and audit entries. Engines hold `Arc<dyn ...>`
//! handles so deployments pick the backend: [`postgres::PgStore`] in
//! production, [`memory::MemoryStore`] for tests and embedded use.
//!
//! Row mapping is statically typed: each record struct is mapped
//! column-by-column in the backend, never through dynamic lookup.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a credential record. Records are never deleted, only
/// status-transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Frozen,
    Deleted,
}

impl AccountStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Frozen => "frozen",
            Self::Deleted => "deleted",
        }
    }

    /// Unknown statuses map to `Frozen`: an unrecognized state must never
    /// widen access.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "active" => Self::Active,
            "deleted" => Self::Deleted,
            _ => Self::Frozen,
        }
    }
}

/// A credential record as stored.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub identifier: String,
    pub display_name: String,
    pub password_hash: String,
    pub status: AccountStatus,
    pub auth_version: i64,
    pub must_change_password: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// An issued session keyed by token hash; the raw token is never stored.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub token_hash: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// A durable token revocation entry. The expiry mirrors the token's own
/// expiry so the entry can be pruned once moot.
#[derive(Debug, Clone)]
pub struct RevocationRecord {
    pub token_hash: String,
    pub user_id: Option<String>,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// An audit entry ready to persist.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    pub actor_id: String,
    pub actor_name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub changes: Option<serde_json::Value>,
    pub summary: Option<String>,
    pub ip_address: Option<String>,
    pub sensitive: bool,
    pub immutable: bool,
    pub chain_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted audit entry.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub id: i64,
    pub actor_id: String,
    pub actor_name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub changes: Option<serde_json::Value>,
    pub summary: Option<String>,
    pub ip_address: Option<String>,
    pub sensitive: bool,
    pub immutable: bool,
    pub chain_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewAuditRecord {
    #[must_use]
    pub fn into_record(self, id: i64) -> AuditRecord {
        AuditRecord {
            id,
            actor_id: self.actor_id,
            actor_name: self.actor_name,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: self.action,
            changes: self.changes,
            summary: self.summary,
            ip_address: self.ip_address,
            sensitive: self.sensitive,
            immutable: self.immutable,
            chain_hash: self.chain_hash,
            created_at: self.created_at,
        }
    }
}

/// Metadata for one archived sensitive entry.
#[derive(Debug, Clone)]
pub struct ArchiveMetadata {
    pub audit_id: i64,
    pub file_path: String,
    pub file_hash: String,
    pub archived_at: DateTime<Utc>,
    pub verification_status: String,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Aggregate archive counters for operator visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub total_archived: i64,
    pub total_verified: i64,
    pub total_failed: i64,
    pub oldest_archive: Option<DateTime<Utc>>,
    pub newest_archive: Option<DateTime<Utc>>,
}

/// Credential reads and the narrow writes login and password change need.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>>;

    /// Stamp a successful login, optionally persisting a migrated hash on
    /// the same request.
    async fn record_login(&self, id: &str, upgraded_hash: Option<&str>) -> Result<()>;

    /// Replace the password hash, bump the credential version, and clear the
    /// must-change flag. Returns the new version.
    async fn update_password(&self, id: &str, hash: &str) -> Result<i64>;
}

/// Session persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: SessionRecord) -> Result<()>;

    async fn list_active(&self, user_id: &str) -> Result<Vec<SessionRecord>>;

    async fn count_active(&self, user_id: &str) -> Result<i64>;

    /// Idempotent: deleting an absent session is not an error.
    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool>;

    async fn delete_by_hashes(&self, token_hashes: &[String]) -> Result<()>;
}

/// Durable token revocation list.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn insert_revocation(&self, record: RevocationRecord) -> Result<()>;

    /// An unexpired entry for this hash, if present.
    async fn find_active_revocation(&self, token_hash: &str) -> Result<Option<RevocationRecord>>;

    /// Delete expired entries and return the removed hashes so callers can
    /// drop matching cache entries synchronously.
    async fn delete_expired_revocations(&self) -> Result<Vec<String>>;
}

/// Append-only audit log plus archive metadata.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, record: NewAuditRecord) -> Result<i64>;

    /// Chain hash of the most recent sensitive entry, if any.
    async fn last_chain_hash(&self) -> Result<Option<String>>;

    async fn get_audit(&self, id: i64) -> Result<Option<AuditRecord>>;

    /// Sensitive (chained) entries in ascending id order within the range.
    async fn chained_range(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
    ) -> Result<Vec<AuditRecord>>;

    async fn upsert_archive_metadata(&self, metadata: ArchiveMetadata) -> Result<()>;

    async fn archive_metadata(&self, audit_id: i64) -> Result<Option<ArchiveMetadata>>;

    async fn set_verification_status(&self, audit_id: i64, status: &str) -> Result<()>;

    async fn archive_stats(&self) -> Result<ArchiveStats>;
}
