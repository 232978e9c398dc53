//! `PostgreSQL` store backend.
//!
//! Queries follow the same shape everywhere: build the statement, open a
//! `db.query` span, bind, instrument, and map rows column-by-column into the
//! typed records from the parent module.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::Instrument;

use super::{
    AccountStatus, ArchiveMetadata, ArchiveStats, AuditRecord, AuditStore, CredentialStore,
    NewAuditRecord, RevocationRecord, RevocationStore, SessionRecord, SessionStore, UserRecord,
};

/// Schema for the tables this crate owns. Applied by the deployment's
/// migration tooling, not by the library.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    identifier TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL DEFAULT '',
    password_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    auth_version BIGINT NOT NULL DEFAULT 1,
    must_change_password BOOLEAN NOT NULL DEFAULT FALSE,
    last_login_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS active_sessions (
    token_hash TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    issued_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    ip_address TEXT,
    user_agent TEXT
);
CREATE INDEX IF NOT EXISTS active_sessions_user_idx ON active_sessions (user_id, expires_at);

CREATE TABLE IF NOT EXISTS token_revocations (
    token_hash TEXT PRIMARY KEY,
    user_id TEXT,
    reason TEXT NOT NULL,
    revoked_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS token_revocations_expiry_idx ON token_revocations (expires_at);

CREATE TABLE IF NOT EXISTS audit_logs (
    id BIGSERIAL PRIMARY KEY,
    actor_id TEXT NOT NULL,
    actor_name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    changes TEXT,
    summary TEXT,
    ip_address TEXT,
    sensitive BOOLEAN NOT NULL DEFAULT FALSE,
    immutable BOOLEAN NOT NULL DEFAULT FALSE,
    chain_hash TEXT,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_logs_chain_idx ON audit_logs (id) WHERE chain_hash IS NOT NULL;

CREATE TABLE IF NOT EXISTS audit_archive_metadata (
    audit_id BIGINT PRIMARY KEY,
    file_path TEXT NOT NULL,
    file_hash TEXT NOT NULL,
    archived_at TIMESTAMPTZ NOT NULL,
    verification_status TEXT NOT NULL DEFAULT 'archived',
    verified_at TIMESTAMPTZ
);
";

/// Store backend over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_user(row: &sqlx::postgres::PgRow) -> UserRecord {
    let status: String = row.get("status");
    UserRecord {
        id: row.get("id"),
        identifier: row.get("identifier"),
        display_name: row.get("display_name"),
        password_hash: row.get("password_hash"),
        status: AccountStatus::parse(&status),
        auth_version: row.get("auth_version"),
        must_change_password: row.get("must_change_password"),
        last_login_at: row.get("last_login_at"),
    }
}

fn map_session(row: &sqlx::postgres::PgRow) -> SessionRecord {
    SessionRecord {
        token_hash: row.get("token_hash"),
        user_id: row.get("user_id"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
    }
}

fn map_audit(row: &sqlx::postgres::PgRow) -> AuditRecord {
    let changes: Option<String> = row.get("changes");
    AuditRecord {
        id: row.get("id"),
        actor_id: row.get("actor_id"),
        actor_name: row.get("actor_name"),
        entity_type: row.get("entity_type"),
        entity_id: row.get("entity_id"),
        action: row.get("action"),
        changes: changes.and_then(|raw| serde_json::from_str(&raw).ok()),
        summary: row.get("summary"),
        ip_address: row.get("ip_address"),
        sensitive: row.get("sensitive"),
        immutable: row.get("immutable"),
        chain_hash: row.get("chain_hash"),
        created_at: row.get("created_at"),
    }
}

fn map_archive_metadata(row: &sqlx::postgres::PgRow) -> ArchiveMetadata {
    ArchiveMetadata {
        audit_id: row.get("audit_id"),
        file_path: row.get("file_path"),
        file_hash: row.get("file_hash"),
        archived_at: row.get("archived_at"),
        verification_status: row.get("verification_status"),
        verified_at: row.get("verified_at"),
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, identifier, display_name, password_hash, status,
                   auth_version, must_change_password, last_login_at
            FROM users
            WHERE LOWER(identifier) = LOWER($1)
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier.trim())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by identifier")?;
        Ok(row.as_ref().map(map_user))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        let query = r"
            SELECT id, identifier, display_name, password_hash, status,
                   auth_version, must_change_password, last_login_at
            FROM users
            WHERE id = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user by id")?;
        Ok(row.as_ref().map(map_user))
    }

    async fn record_login(&self, id: &str, upgraded_hash: Option<&str>) -> Result<()> {
        let query = r"
            UPDATE users
            SET password_hash = COALESCE($2, password_hash),
                last_login_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(id)
            .bind(upgraded_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to record login")?;
        Ok(())
    }

    async fn update_password(&self, id: &str, hash: &str) -> Result<i64> {
        let query = r"
            UPDATE users
            SET password_hash = $2,
                auth_version = auth_version + 1,
                must_change_password = FALSE,
                updated_at = NOW()
            WHERE id = $1
            RETURNING auth_version
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .bind(hash)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to update password")?;
        Ok(row.get("auth_version"))
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: SessionRecord) -> Result<()> {
        let query = r"
            INSERT INTO active_sessions
                (token_hash, user_id, issued_at, expires_at, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (token_hash) DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&session.token_hash)
            .bind(&session.user_id)
            .bind(session.issued_at)
            .bind(session.expires_at)
            .bind(&session.ip_address)
            .bind(&session.user_agent)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn list_active(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let query = r"
            SELECT token_hash, user_id, issued_at, expires_at, ip_address, user_agent
            FROM active_sessions
            WHERE user_id = $1 AND expires_at > NOW()
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to list active sessions")?;
        Ok(rows.iter().map(map_session).collect())
    }

    async fn count_active(&self, user_id: &str) -> Result<i64> {
        let query =
            "SELECT COUNT(*) FROM active_sessions WHERE user_id = $1 AND expires_at > NOW()";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to count active sessions")?;
        Ok(row.get(0))
    }

    async fn delete_by_hash(&self, token_hash: &str) -> Result<bool> {
        let query = "DELETE FROM active_sessions WHERE token_hash = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_hashes(&self, token_hashes: &[String]) -> Result<()> {
        if token_hashes.is_empty() {
            return Ok(());
        }
        let query = "DELETE FROM active_sessions WHERE token_hash = ANY($1)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hashes)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete sessions")?;
        Ok(())
    }
}

#[async_trait]
impl RevocationStore for PgStore {
    async fn insert_revocation(&self, record: RevocationRecord) -> Result<()> {
        let query = r"
            INSERT INTO token_revocations (token_hash, user_id, reason, revoked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (token_hash) DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&record.token_hash)
            .bind(&record.user_id)
            .bind(&record.reason)
            .bind(record.revoked_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert revocation")?;
        Ok(())
    }

    async fn find_active_revocation(&self, token_hash: &str) -> Result<Option<RevocationRecord>> {
        let query = r"
            SELECT token_hash, user_id, reason, revoked_at, expires_at
            FROM token_revocations
            WHERE token_hash = $1 AND expires_at > NOW()
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup revocation")?;
        Ok(row.map(|row| RevocationRecord {
            token_hash: row.get("token_hash"),
            user_id: row.get("user_id"),
            reason: row.get("reason"),
            revoked_at: row.get("revoked_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete_expired_revocations(&self) -> Result<Vec<String>> {
        let query = "DELETE FROM token_revocations WHERE expires_at <= NOW() RETURNING token_hash";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to delete expired revocations")?;
        Ok(rows.iter().map(|row| row.get("token_hash")).collect())
    }
}

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_audit(&self, record: NewAuditRecord) -> Result<i64> {
        let changes = record
            .changes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize audit changes")?;
        let query = r"
            INSERT INTO audit_logs
                (actor_id, actor_name, entity_type, entity_id, action, changes,
                 summary, ip_address, sensitive, immutable, chain_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&record.actor_id)
            .bind(&record.actor_name)
            .bind(&record.entity_type)
            .bind(&record.entity_id)
            .bind(&record.action)
            .bind(changes)
            .bind(&record.summary)
            .bind(&record.ip_address)
            .bind(record.sensitive)
            .bind(record.immutable)
            .bind(&record.chain_hash)
            .bind(record.created_at)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to insert audit entry")?;
        Ok(row.get("id"))
    }

    async fn last_chain_hash(&self) -> Result<Option<String>> {
        let query = r"
            SELECT chain_hash
            FROM audit_logs
            WHERE chain_hash IS NOT NULL
            ORDER BY id DESC
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch last chain hash")?;
        Ok(row.map(|row| row.get("chain_hash")))
    }

    async fn get_audit(&self, id: i64) -> Result<Option<AuditRecord>> {
        let query = r"
            SELECT id, actor_id, actor_name, entity_type, entity_id, action, changes,
                   summary, ip_address, sensitive, immutable, chain_hash, created_at
            FROM audit_logs
            WHERE id = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch audit entry")?;
        Ok(row.as_ref().map(map_audit))
    }

    async fn chained_range(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
    ) -> Result<Vec<AuditRecord>> {
        let query = r"
            SELECT id, actor_id, actor_name, entity_type, entity_id, action, changes,
                   summary, ip_address, sensitive, immutable, chain_hash, created_at
            FROM audit_logs
            WHERE chain_hash IS NOT NULL
              AND ($1::BIGINT IS NULL OR id >= $1)
              AND ($2::BIGINT IS NULL OR id <= $2)
            ORDER BY id ASC
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(start_id)
            .bind(end_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch chained audit range")?;
        Ok(rows.iter().map(map_audit).collect())
    }

    async fn upsert_archive_metadata(&self, metadata: ArchiveMetadata) -> Result<()> {
        let query = r"
            INSERT INTO audit_archive_metadata
                (audit_id, file_path, file_hash, archived_at, verification_status, verified_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (audit_id) DO UPDATE
            SET file_path = EXCLUDED.file_path,
                file_hash = EXCLUDED.file_hash,
                archived_at = EXCLUDED.archived_at,
                verification_status = EXCLUDED.verification_status
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(metadata.audit_id)
            .bind(&metadata.file_path)
            .bind(&metadata.file_hash)
            .bind(metadata.archived_at)
            .bind(&metadata.verification_status)
            .bind(metadata.verified_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to upsert archive metadata")?;
        Ok(())
    }

    async fn archive_metadata(&self, audit_id: i64) -> Result<Option<ArchiveMetadata>> {
        let query = r"
            SELECT audit_id, file_path, file_hash, archived_at, verification_status, verified_at
            FROM audit_archive_metadata
            WHERE audit_id = $1
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(audit_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch archive metadata")?;
        Ok(row.as_ref().map(map_archive_metadata))
    }

    async fn set_verification_status(&self, audit_id: i64, status: &str) -> Result<()> {
        let query = r"
            UPDATE audit_archive_metadata
            SET verification_status = $2, verified_at = NOW()
            WHERE audit_id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(audit_id)
            .bind(status)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to set verification status")?;
        Ok(())
    }

    async fn archive_stats(&self) -> Result<ArchiveStats> {
        let query = r"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE verification_status = 'verified') AS verified,
                   COUNT(*) FILTER (WHERE verification_status = 'failed') AS failed,
                   MIN(archived_at) AS oldest,
                   MAX(archived_at) AS newest
            FROM audit_archive_metadata
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to fetch archive stats")?;
        let oldest: Option<DateTime<Utc>> = row.get("oldest");
        let newest: Option<DateTime<Utc>> = row.get("newest");
        Ok(ArchiveStats {
            total_archived: row.get("total"),
            total_verified: row.get("verified"),
            total_failed: row.get("failed"),
            oldest_archive: oldest,
            newest_archive: newest,
        })
    }
}
