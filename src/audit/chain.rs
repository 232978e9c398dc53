//! Hash chaining over sensitive audit entries.
//!
//! Each sensitive entry carries a SHA-256 over a canonical JSON payload that
//! includes the previous sensitive entry's hash, so rewriting any entry in
//! place breaks every later link. The payload field order is fixed by the
//! struct declaration; reordering fields would silently break every
//! previously written chain.

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::store::{AuditRecord, AuditStore, NewAuditRecord};

/// First-link sentinel when no chained entry exists yet.
const GENESIS: &str = "genesis";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChainPayload<'a> {
    previous_hash: &'a str,
    timestamp: String,
    actor_id: &'a str,
    actor_name: &'a str,
    action: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    changes: Option<String>,
    ip_address: &'a str,
}

fn payload_hash(payload: &ChainPayload<'_>) -> Result<String> {
    let json = serde_json::to_string(payload).context("failed to serialize chain payload")?;
    Ok(hex::encode(Sha256::digest(json.as_bytes())))
}

fn fallback<'a>(value: Option<&'a str>, default: &'a str) -> &'a str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => default,
    }
}

#[allow(clippy::too_many_arguments)]
fn hash_fields(
    previous: Option<&str>,
    timestamp: chrono::DateTime<chrono::Utc>,
    actor_id: &str,
    actor_name: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    changes: Option<&serde_json::Value>,
    ip_address: Option<&str>,
) -> Result<String> {
    let changes = changes
        .map(serde_json::to_string)
        .transpose()
        .context("failed to serialize chained changes")?;
    payload_hash(&ChainPayload {
        previous_hash: fallback(previous, GENESIS),
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        actor_id: fallback(Some(actor_id), "system"),
        actor_name: fallback(Some(actor_name), "system"),
        action,
        entity_type,
        entity_id,
        changes,
        ip_address: fallback(ip_address, "unknown"),
    })
}

/// Chain hash for an entry about to be persisted.
pub fn chain_hash(previous: Option<&str>, record: &NewAuditRecord) -> Result<String> {
    hash_fields(
        previous,
        record.created_at,
        &record.actor_id,
        &record.actor_name,
        &record.action,
        &record.entity_type,
        &record.entity_id,
        record.changes.as_ref(),
        record.ip_address.as_deref(),
    )
}

/// Recomputed chain hash for a stored entry, for verification.
pub fn recompute(previous: Option<&str>, record: &AuditRecord) -> Result<String> {
    hash_fields(
        previous,
        record.created_at,
        &record.actor_id,
        &record.actor_name,
        &record.action,
        &record.entity_type,
        &record.entity_id,
        record.changes.as_ref(),
        record.ip_address.as_deref(),
    )
}

/// One entry whose stored hash does not match its recomputed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenLink {
    pub id: i64,
    pub expected: String,
    pub actual: String,
}

/// Outcome of a chain walk. `broken` lists every bad link found, not just
/// the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub verified_count: usize,
    pub broken: Vec<BrokenLink>,
}

/// Walk the chained entries in `[start_id, end_id]` (either bound optional)
/// and recompute every link against the stored hashes.
pub async fn verify_chain(
    store: &dyn AuditStore,
    start_id: Option<i64>,
    end_id: Option<i64>,
) -> Result<ChainVerification> {
    let entries = store.chained_range(start_id, end_id).await?;
    let mut broken = Vec::new();
    let mut previous: Option<String> = None;

    for entry in &entries {
        let expected = recompute(previous.as_deref(), entry)?;
        let actual = entry.chain_hash.clone().unwrap_or_default();
        if !expected.eq_ignore_ascii_case(&actual) {
            broken.push(BrokenLink {
                id: entry.id,
                expected,
                actual,
            });
        }
        // Later links chain off the stored hash, so one corrupt entry
        // reports exactly one break rather than cascading.
        previous = entry.chain_hash.clone();
    }

    Ok(ChainVerification {
        valid: broken.is_empty(),
        verified_count: entries.len(),
        broken,
    })
}
