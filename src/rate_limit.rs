//! Sliding-window request throttling per (endpoint, identifier).
//!
//! The window is relative to the most recent request, not clock-aligned. A
//! bucket whose last request fell outside the window has naturally reset and
//! no longer blocks. A periodic sweep drops buckets idle beyond the window
//! or older than an absolute cap, bounding memory regardless of traffic
//! shape; sweeps are single-flight and skipped while one is running.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    first_request: Instant,
    last_request: Instant,
    count: u32,
}

/// In-process sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, RateBucket>,
    limit: u32,
    window: Duration,
    max_age: Duration,
    sweeping: AtomicBool,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration, max_age: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            limit,
            window,
            max_age,
            sweeping: AtomicBool::new(false),
        }
    }

    /// True iff the bucket is at the limit and has not naturally reset.
    #[must_use]
    pub fn should_block(&self, identifier: &str, endpoint: &str) -> bool {
        if identifier.trim().is_empty() {
            return false;
        }
        let key = bucket_key(identifier, endpoint);
        let Some(bucket) = self.buckets.get(&key).map(|entry| *entry.value()) else {
            return false;
        };
        bucket.count >= self.limit && bucket.last_request.elapsed() <= self.window
    }

    /// Seconds until the current window naturally resets. Zero when the
    /// identifier is not blocked.
    #[must_use]
    pub fn retry_after_seconds(&self, identifier: &str, endpoint: &str) -> u64 {
        let key = bucket_key(identifier, endpoint);
        let Some(bucket) = self.buckets.get(&key).map(|entry| *entry.value()) else {
            return 0;
        };
        if bucket.count < self.limit {
            return 0;
        }
        self.window
            .saturating_sub(bucket.last_request.elapsed())
            .as_secs()
    }

    /// Count a request: increment the live bucket, or start a fresh one if
    /// the previous request fell outside the window.
    pub fn record_request(&self, identifier: &str, endpoint: &str) {
        if identifier.trim().is_empty() {
            return;
        }
        let key = bucket_key(identifier, endpoint);
        let now = Instant::now();
        self.buckets
            .entry(key)
            .and_modify(|bucket| {
                if now.duration_since(bucket.last_request) > self.window {
                    bucket.first_request = now;
                    bucket.count = 1;
                } else {
                    bucket.count += 1;
                }
                bucket.last_request = now;
            })
            .or_insert(RateBucket {
                first_request: now,
                last_request: now,
                count: 1,
            });
    }

    /// Forget the bucket for this identifier/endpoint pair.
    pub fn reset(&self, identifier: &str, endpoint: &str) {
        if identifier.trim().is_empty() {
            return;
        }
        self.buckets.remove(&bucket_key(identifier, endpoint));
    }

    /// Remove buckets idle beyond the window or older than the absolute cap.
    ///
    /// Returns the number of buckets removed; returns zero immediately if a
    /// sweep is already in progress.
    pub fn sweep(&self) -> usize {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let before = self.buckets.len();
        let window = self.window;
        let max_age = self.max_age;
        self.buckets.retain(|_, bucket| {
            bucket.last_request.elapsed() <= window && bucket.first_request.elapsed() <= max_age
        });
        let removed = before.saturating_sub(self.buckets.len());
        self.sweeping.store(false, Ordering::Release);
        if removed > 0 {
            debug!("rate limiter sweep removed {removed} idle buckets");
        }
        removed
    }

    /// Run [`RateLimiter::sweep`] on a periodic timer until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                limiter.sweep();
            }
        })
    }
}

fn bucket_key(identifier: &str, endpoint: &str) -> String {
    format!("{endpoint}:{}", identifier.trim().to_lowercase())
}
