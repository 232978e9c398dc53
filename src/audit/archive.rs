//! Cold-storage archival of sensitive audit entries.
//!
//! Every sensitive entry is mirrored to the filesystem as a JSON artifact
//! plus a `.sig` sidecar recording its SHA-256, both marked read-only after
//! write. Artifacts are laid out one directory per UTC day:
//!
//! ```text
//! <root>/2026-08-24/sensitive-2026-08-24T10-15-00-123-42.json
//! <root>/2026-08-24/sensitive-2026-08-24T10-15-00-123-42.json.sig
//! ```
//!
//! Verification recomputes the file hash against the stored metadata and
//! records the outcome, so silent on-disk tampering surfaces on the next
//! integrity check.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::{ArchiveMetadata, AuditRecord, AuditStore};

/// Outcome of verifying one archived entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveVerification {
    Verified,
    HashMismatch { expected: String, actual: String },
    MissingMetadata,
    MissingFile { expected_path: String },
}

impl ArchiveVerification {
    #[must_use]
    pub fn valid(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Filesystem archive rooted at a configured directory.
#[derive(Debug, Clone)]
pub struct ColdArchive {
    root: PathBuf,
}

impl ColdArchive {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write the artifact and its `.sig` sidecar; both end up read-only.
    /// Returns the metadata to persist. Re-archiving an entry overwrites the
    /// previous artifact.
    pub fn write(&self, record: &AuditRecord) -> Result<ArchiveMetadata> {
        let day_dir = self.root.join(record.created_at.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir)
            .with_context(|| format!("failed to create archive directory {}", day_dir.display()))?;

        let stamp = record.created_at.format("%Y-%m-%dT%H-%M-%S-%3f");
        let file_name = format!("sensitive-{stamp}-{}.json", record.id);
        let file_path = day_dir.join(&file_name);

        let archived_at = Utc::now();
        let artifact = json!({
            "auditLogId": record.id,
            "archivedAt": archived_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            "logEntry": {
                "id": record.id,
                "actorId": record.actor_id,
                "actorName": record.actor_name,
                "entityType": record.entity_type,
                "entityId": record.entity_id,
                "action": record.action,
                "changes": record.changes,
                "summary": record.summary,
                "ipAddress": record.ip_address,
                "isSensitive": record.sensitive,
                "immutable": record.immutable,
                "chainHash": record.chain_hash,
                "createdAt": record.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            },
        });
        let artifact_json =
            serde_json::to_string_pretty(&artifact).context("failed to serialize archive artifact")?;
        write_read_only(&file_path, &artifact_json)?;

        let file_hash = hex::encode(Sha256::digest(artifact_json.as_bytes()));
        let signature = json!({
            "auditLogId": record.id,
            "filePath": file_name,
            "hash": file_hash,
            "algorithm": "SHA-256",
            "createdAt": archived_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        });
        let signature_json =
            serde_json::to_string_pretty(&signature).context("failed to serialize signature")?;
        let signature_path = day_dir.join(format!("{file_name}.sig"));
        write_read_only(&signature_path, &signature_json)?;

        Ok(ArchiveMetadata {
            audit_id: record.id,
            file_path: file_path.to_string_lossy().into_owned(),
            file_hash,
            archived_at,
            verification_status: "archived".to_string(),
            verified_at: None,
        })
    }

    /// Archive one entry and persist its metadata.
    pub async fn archive(
        &self,
        store: &dyn AuditStore,
        record: &AuditRecord,
    ) -> Result<ArchiveMetadata> {
        let metadata = self.write(record)?;
        store.upsert_archive_metadata(metadata.clone()).await?;
        Ok(metadata)
    }

    /// Recompute the artifact hash for one entry and record the outcome.
    ///
    /// A missing file is reported without flipping the status; only a hash
    /// comparison updates it.
    pub async fn verify(
        &self,
        store: &dyn AuditStore,
        audit_id: i64,
    ) -> Result<ArchiveVerification> {
        let Some(metadata) = store.archive_metadata(audit_id).await? else {
            return Ok(ArchiveVerification::MissingMetadata);
        };

        let path = Path::new(&metadata.file_path);
        if !path.is_file() {
            return Ok(ArchiveVerification::MissingFile {
                expected_path: metadata.file_path,
            });
        }

        let content = fs::read(path)
            .with_context(|| format!("failed to read archive artifact {}", path.display()))?;
        let actual = hex::encode(Sha256::digest(&content));

        if actual.eq_ignore_ascii_case(&metadata.file_hash) {
            store.set_verification_status(audit_id, "verified").await?;
            Ok(ArchiveVerification::Verified)
        } else {
            store.set_verification_status(audit_id, "failed").await?;
            Ok(ArchiveVerification::HashMismatch {
                expected: metadata.file_hash,
                actual,
            })
        }
    }
}

fn write_read_only(path: &Path, content: &str) -> Result<()> {
    // A previous artifact at this path is read-only; unlock it first.
    if let Ok(existing) = fs::metadata(path) {
        let mut perms = existing.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
        let _ = fs::set_permissions(path, perms);
    }
    fs::write(path, content)
        .with_context(|| format!("failed to write archive file {}", path.display()))?;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat archive file {}", path.display()))?
        .permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to mark {} read-only", path.display()))?;
    Ok(())
}
