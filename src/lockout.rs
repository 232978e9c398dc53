//! Per-identity failed-attempt tracking and timed lockout.
//!
//! State machine per identity: `Clean -> Accumulating(n) -> Locked(until)`.
//! Identity keys are case-insensitive. Whether an identity is locked is
//! always decided by wall-clock comparison against the stored lock-until
//! time, never by record presence alone; eviction only bounds memory.
//!
//! Records expire from storage at whichever comes sooner: 24 hours of
//! inactivity for bare failure counts, or the lock expiry once locked.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::time::Duration;

use crate::audit::{AuditEvent, AuditHandle};

/// Read-only lockout state for an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockoutStatus {
    pub locked: bool,
    pub remaining_minutes: u64,
    pub attempts: u32,
}

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedAttempt {
    pub locked: bool,
    pub remaining_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Aggregate counters for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutStats {
    pub tracked_identities: usize,
    pub currently_locked: usize,
    pub with_failures: usize,
    pub max_failed_attempts: u32,
    pub lockout_minutes: u64,
}

#[derive(Debug, Clone, Copy)]
struct LockoutRecord {
    count: u32,
    last_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

/// Tracks failed attempts per identity and enforces timed lockout.
#[derive(Debug)]
pub struct LockoutEngine {
    records: DashMap<String, LockoutRecord>,
    max_attempts: u32,
    lock_duration: chrono::Duration,
    idle_expiry: chrono::Duration,
    audit: AuditHandle,
}

impl LockoutEngine {
    #[must_use]
    pub fn new(
        max_attempts: u32,
        lock_duration: Duration,
        idle_expiry: Duration,
        audit: AuditHandle,
    ) -> Self {
        Self {
            records: DashMap::new(),
            max_attempts,
            lock_duration: chrono::Duration::from_std(lock_duration)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            idle_expiry: chrono::Duration::from_std(idle_expiry)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            audit,
        }
    }

    /// Read-only status check; lazily clears a lock that has expired.
    #[must_use]
    pub fn check(&self, identity: &str) -> LockoutStatus {
        let key = normalize(identity);
        if key.is_empty() {
            return LockoutStatus::default();
        }

        let now = Utc::now();
        let Some(record) = self.records.get(&key).map(|entry| *entry.value()) else {
            return LockoutStatus::default();
        };

        if let Some(until) = record.locked_until {
            if until > now {
                return LockoutStatus {
                    locked: true,
                    remaining_minutes: remaining_minutes(until, now),
                    attempts: record.count,
                };
            }
            // Lock expired; drop the record entirely.
            self.records.remove(&key);
            return LockoutStatus::default();
        }

        if now - record.last_attempt > self.idle_expiry {
            self.records.remove(&key);
            return LockoutStatus::default();
        }

        LockoutStatus {
            locked: false,
            remaining_minutes: 0,
            attempts: record.count,
        }
    }

    /// Record one failed attempt and report the resulting state.
    ///
    /// An attempt against an already-locked identity reports `locked` without
    /// incrementing the counter or extending the lock.
    pub fn record_failure(&self, identity: &str, ip_address: Option<&str>) -> FailedAttempt {
        let key = normalize(identity);
        if key.is_empty() {
            return FailedAttempt {
                locked: false,
                remaining_attempts: self.max_attempts,
                locked_until: None,
            };
        }

        let now = Utc::now();
        let mut locked_now = false;
        let mut entry = self.records.entry(key.clone()).or_insert(LockoutRecord {
            count: 0,
            last_attempt: now,
            locked_until: None,
        });
        let record = entry.value_mut();

        // Expired lock: start a fresh accumulation window.
        if record.locked_until.is_some_and(|until| until <= now) {
            record.count = 0;
            record.locked_until = None;
        }

        let result = if let Some(until) = record.locked_until {
            FailedAttempt {
                locked: true,
                remaining_attempts: 0,
                locked_until: Some(until),
            }
        } else {
            // A stale failure count past the idle window no longer counts.
            if now - record.last_attempt > self.idle_expiry {
                record.count = 0;
            }
            record.count += 1;
            record.last_attempt = now;

            if record.count >= self.max_attempts {
                let until = now + self.lock_duration;
                record.locked_until = Some(until);
                locked_now = true;
                FailedAttempt {
                    locked: true,
                    remaining_attempts: 0,
                    locked_until: Some(until),
                }
            } else {
                FailedAttempt {
                    locked: false,
                    remaining_attempts: self.max_attempts - record.count,
                    locked_until: None,
                }
            }
        };
        let attempt_count = record.count;
        drop(entry);

        if locked_now {
            if let Some(until) = result.locked_until {
                self.audit.record(
                    AuditEvent::new(&key, "auth", &key, "account_locked")
                        .with_changes(json!({
                            "reason": "too_many_failed_attempts",
                            "attemptCount": attempt_count,
                            "lockedUntil": until.to_rfc3339(),
                            "lockoutDurationMinutes": self.lock_duration.num_minutes(),
                        }))
                        .with_ip(ip_address),
                );
            }
        }

        result
    }

    /// Clear failure state after a successful login.
    pub fn reset(&self, identity: &str) {
        let key = normalize(identity);
        if key.is_empty() {
            return;
        }
        let had_failures = self.records.remove(&key).is_some();
        if had_failures {
            self.audit.record(
                AuditEvent::new(&key, "auth", &key, "failed_attempts_reset")
                    .with_changes(json!({ "reason": "successful_login" })),
            );
        }
    }

    /// Administrative unlock. Returns whether the identity was actually locked.
    pub fn unlock(&self, identity: &str, actor: &str) -> bool {
        let key = normalize(identity);
        if key.is_empty() {
            return false;
        }
        let was_locked = self
            .records
            .remove(&key)
            .is_some_and(|(_, record)| record.locked_until.is_some());
        if was_locked {
            self.audit.record(
                AuditEvent::new(actor, "auth", &key, "account_unlocked").with_changes(json!({
                    "unlockedBy": actor,
                    "reason": "manual_unlock",
                })),
            );
        }
        was_locked
    }

    /// Aggregate counters across tracked identities.
    #[must_use]
    pub fn stats(&self) -> LockoutStats {
        let now = Utc::now();
        let mut tracked = 0;
        let mut locked = 0;
        let mut with_failures = 0;
        for entry in &self.records {
            tracked += 1;
            if entry.count > 0 {
                with_failures += 1;
            }
            if entry.locked_until.is_some_and(|until| until > now) {
                locked += 1;
            }
        }
        LockoutStats {
            tracked_identities: tracked,
            currently_locked: locked,
            with_failures,
            max_failed_attempts: self.max_attempts,
            lockout_minutes: u64::try_from(self.lock_duration.num_minutes()).unwrap_or(0),
        }
    }

    /// Drop records that no longer affect any decision: expired locks, and
    /// failure counts idle past the expiry window.
    pub fn prune(&self) {
        let now = Utc::now();
        let idle_expiry = self.idle_expiry;
        self.records.retain(|_, record| match record.locked_until {
            Some(until) => until > now,
            None => now - record.last_attempt <= idle_expiry,
        });
    }
}

fn normalize(identity: &str) -> String {
    identity.trim().to_lowercase()
}

fn remaining_minutes(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let seconds = (until - now).num_seconds().max(0);
    // Round up so a nearly-expired lock still reports one minute.
    u64::try_from((seconds + 59) / 60).unwrap_or(0).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> LockoutEngine {
        LockoutEngine::new(
            5,
            Duration::from_secs(30 * 60),
            Duration::from_secs(24 * 60 * 60),
            AuditHandle::disabled(),
        )
    }

    #[test]
    fn five_failures_lock_with_countdown() {
        let engine = engine();

        for expected_remaining in (1..=4).rev() {
            let attempt = engine.record_failure("Alice", Some("203.0.113.5"));
            assert!(!attempt.locked);
            assert_eq!(attempt.remaining_attempts, expected_remaining);
        }

        let attempt = engine.record_failure("Alice", Some("203.0.113.5"));
        assert!(attempt.locked);
        assert_eq!(attempt.remaining_attempts, 0);
        assert!(attempt.locked_until.is_some());

        let status = engine.check("alice");
        assert!(status.locked);
        assert_eq!(status.remaining_minutes, 30);
        assert_eq!(status.attempts, 5);
    }

    #[test]
    fn locked_identity_does_not_accumulate_further() {
        let engine = engine();
        for _ in 0..5 {
            engine.record_failure("alice", None);
        }
        let before = engine.check("alice");

        let attempt = engine.record_failure("alice", None);
        assert!(attempt.locked);

        let after = engine.check("alice");
        assert_eq!(after.attempts, before.attempts);
        assert_eq!(after.remaining_minutes, before.remaining_minutes);
    }

    #[test]
    fn identity_keys_are_case_insensitive() {
        let engine = engine();
        engine.record_failure(" Alice ", None);
        engine.record_failure("ALICE", None);
        assert_eq!(engine.check("alice").attempts, 2);
    }

    #[test]
    fn reset_returns_to_clean() {
        let engine = engine();
        engine.record_failure("alice", None);
        engine.record_failure("alice", None);
        engine.reset("alice");
        assert_eq!(engine.check("alice"), LockoutStatus::default());
    }

    #[test]
    fn unlock_reports_whether_identity_was_locked() {
        let engine = engine();
        assert!(!engine.unlock("alice", "admin-1"));

        engine.record_failure("alice", None);
        assert!(!engine.unlock("alice", "admin-1"));

        for _ in 0..5 {
            engine.record_failure("bob", None);
        }
        assert!(engine.unlock("bob", "admin-1"));
        assert_eq!(engine.check("bob"), LockoutStatus::default());
    }

    #[test]
    fn expired_lock_clears_lazily_on_check() {
        let engine = LockoutEngine::new(
            1,
            Duration::from_secs(0),
            Duration::from_secs(24 * 60 * 60),
            AuditHandle::disabled(),
        );
        let attempt = engine.record_failure("alice", None);
        assert!(attempt.locked);

        // Zero-duration lock is already expired by wall clock.
        assert_eq!(engine.check("alice"), LockoutStatus::default());
    }

    #[test]
    fn expired_lock_restarts_accumulation_on_failure() {
        let engine = LockoutEngine::new(
            2,
            Duration::from_secs(0),
            Duration::from_secs(24 * 60 * 60),
            AuditHandle::disabled(),
        );
        engine.record_failure("alice", None);
        engine.record_failure("alice", None); // locks, instantly expired

        let attempt = engine.record_failure("alice", None);
        assert!(!attempt.locked);
        assert_eq!(attempt.remaining_attempts, 1);
    }

    #[test]
    fn stats_count_tracked_and_locked() {
        let engine = engine();
        engine.record_failure("alice", None);
        for _ in 0..5 {
            engine.record_failure("bob", None);
        }
        let stats = engine.stats();
        assert_eq!(stats.tracked_identities, 2);
        assert_eq!(stats.with_failures, 2);
        assert_eq!(stats.currently_locked, 1);
        assert_eq!(stats.max_failed_attempts, 5);
        assert_eq!(stats.lockout_minutes, 30);
    }

    #[test]
    fn prune_drops_expired_locks() {
        let engine = LockoutEngine::new(
            1,
            Duration::from_secs(0),
            Duration::from_secs(24 * 60 * 60),
            AuditHandle::disabled(),
        );
        engine.record_failure("alice", None);
        engine.prune();
        assert_eq!(engine.stats().tracked_identities, 0);
    }
}
