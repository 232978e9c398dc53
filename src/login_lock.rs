//! Per-identity guard against duplicate concurrent login processing.
//!
//! Collapses rapid-fire duplicate submissions (double-click, retry storms)
//! into one processed attempt: a second concurrent attempt for the same
//! identity is rejected with a try-again-shortly signal rather than queued,
//! so unrelated logins never serialize behind one slow one. This is not a
//! correctness mutex for the credential store; it only prevents duplicate
//! side effects from a single human action.
//!
//! Acquisition returns an RAII guard so the lock is released on every exit
//! path, including panics and caller cancellation.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Short-lived per-identity login locks.
#[derive(Debug, Clone)]
pub struct LoginLock {
    locks: Arc<DashMap<String, Instant>>,
    hold: Duration,
}

impl LoginLock {
    #[must_use]
    pub fn new(hold: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            hold,
        }
    }

    /// Try to acquire the lock for an identity.
    ///
    /// Returns `None` when another attempt for the same identity acquired it
    /// within the hold window. A stale entry past the hold window is taken
    /// over; its eventual release is a no-op.
    #[must_use]
    pub fn try_acquire(&self, identity: &str) -> Option<LoginLockGuard> {
        let key = identity.trim().to_lowercase();
        if key.is_empty() {
            // Nothing sensible to lock on; let validation reject the request.
            return Some(LoginLockGuard {
                locks: Arc::clone(&self.locks),
                key,
                acquired: Instant::now(),
            });
        }

        let now = Instant::now();
        match self.locks.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < self.hold {
                    return None;
                }
                occupied.insert(now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
            }
        }
        Some(LoginLockGuard {
            locks: Arc::clone(&self.locks),
            key,
            acquired: now,
        })
    }
}

/// Releases the login lock on drop.
#[derive(Debug)]
pub struct LoginLockGuard {
    locks: Arc<DashMap<String, Instant>>,
    key: String,
    acquired: Instant,
}

impl Drop for LoginLockGuard {
    fn drop(&mut self) {
        if self.key.is_empty() {
            return;
        }
        // Only release our own acquisition; a later takeover of a stale
        // entry must not be stomped by the original holder's release.
        self.locks
            .remove_if(&self.key, |_, held| *held == self.acquired);
    }
}
