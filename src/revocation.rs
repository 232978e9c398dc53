//! Durable token revocation with a read-through cache.
//!
//! Revocation entries live in the store so they survive restarts and are
//! shared across instances; a hot-path cache keeps per-request checks off
//! the database. The cache is positive-only: a miss always consults the
//! store and is never cached, so a revocation performed by another instance
//! takes effect here on the next check. Entries expire alongside the token
//! they revoke; a sweep prunes them once moot.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::store::{RevocationRecord, RevocationStore};
use crate::token::{TokenCodec, hash_token};

/// Shared revocation list backed by the durable store.
pub struct RevocationList {
    store: Arc<dyn RevocationStore>,
    cache: DashMap<String, RevocationRecord>,
    sweeping: AtomicBool,
}

impl RevocationList {
    #[must_use]
    pub fn new(store: Arc<dyn RevocationStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Revoke a raw token, deriving its hash and expiry from its own claims.
    ///
    /// Undecodable tokens are rejected: they can never authenticate, so a
    /// revocation entry would only bloat the list.
    pub async fn add(
        &self,
        codec: &TokenCodec,
        token: &str,
        user_id: Option<&str>,
        reason: &str,
    ) -> Result<()> {
        let expires_at = codec.expiry(token)?;
        self.add_hash(&hash_token(token), user_id, expires_at, reason)
            .await
    }

    /// Revoke by token hash, for callers that no longer hold the raw token
    /// (bulk session invalidation works from stored hashes).
    pub async fn add_hash(
        &self,
        token_hash: &str,
        user_id: Option<&str>,
        expires_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        let record = RevocationRecord {
            token_hash: token_hash.to_string(),
            user_id: user_id.map(str::to_string),
            reason: reason.to_string(),
            revoked_at: Utc::now(),
            expires_at,
        };
        self.store.insert_revocation(record.clone()).await?;
        if expires_at > Utc::now() {
            self.cache.insert(record.token_hash.clone(), record);
        }
        Ok(())
    }

    /// Whether an unexpired revocation exists for this token hash.
    pub async fn is_revoked(&self, token_hash: &str) -> Result<bool> {
        Ok(self.reason_for(token_hash).await?.is_some())
    }

    /// Revocation reason for this token hash, if revoked.
    pub async fn reason_for(&self, token_hash: &str) -> Result<Option<String>> {
        let now = Utc::now();
        if let Some(entry) = self.cache.get(token_hash) {
            if entry.expires_at > now {
                return Ok(Some(entry.reason.clone()));
            }
            drop(entry);
            self.cache.remove(token_hash);
        }

        match self.store.find_active_revocation(token_hash).await? {
            Some(record) => {
                let reason = record.reason.clone();
                self.cache.insert(record.token_hash.clone(), record);
                Ok(Some(reason))
            }
            None => Ok(None),
        }
    }

    /// Prune expired entries from store and cache.
    ///
    /// Returns the number removed from the store; returns zero immediately
    /// when a sweep is already in flight.
    pub async fn remove_expired(&self) -> Result<usize> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.store.delete_expired_revocations().await;
        self.sweeping.store(false, Ordering::Release);

        let removed = result?;
        for hash in &removed {
            self.cache.remove(hash);
        }
        // Cache entries can outlive their store rows when a row expired
        // between sweeps of another instance.
        let now = Utc::now();
        self.cache.retain(|_, record| record.expires_at > now);
        if !removed.is_empty() {
            debug!("revocation sweep removed {} expired entries", removed.len());
        }
        Ok(removed.len())
    }

    /// Run [`RevocationList::remove_expired`] on a periodic timer until the
    /// task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let list = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = list.remove_expired().await {
                    tracing::warn!("revocation sweep failed: {err:#}");
                }
            }
        })
    }
}

impl std::fmt::Debug for RevocationList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationList")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
