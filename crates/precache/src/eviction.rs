//! # Eviction Manager
//!
//! Keeps the runtime partition bounded: entries older than the TTL are
//! expired, and after every insertion the oldest entries are trimmed until
//! the partition is back at its capacity.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::partition::{EntryMeta, Partition, PartitionResult};

#[derive(Debug, Default)]
struct LimiterState {
    last_run: Option<Instant>,
    in_flight: bool,
}

/// Lets an operation run at most once per interval, and never twice at once
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Claim the next run. Returns `None` while throttled or in flight.
    pub fn try_acquire(&self) -> Option<RateLimitGuard<'_>> {
        let mut state = self.state.lock();
        if state.in_flight {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = state.last_run {
            if now.duration_since(last) < self.interval {
                return None;
            }
        }
        state.last_run = Some(now);
        state.in_flight = true;
        Some(RateLimitGuard { limiter: self })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Marks a run in flight until dropped
pub struct RateLimitGuard<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for RateLimitGuard<'_> {
    fn drop(&mut self) {
        self.limiter.state.lock().in_flight = false;
    }
}

pub struct EvictionManager {
    ttl: Duration,
    max_entries: usize,
    limiter: Arc<RateLimiter>,
}

impl EvictionManager {
    pub fn new(ttl: Duration, max_entries: usize, limiter: Arc<RateLimiter>) -> Self {
        Self {
            ttl,
            max_entries,
            limiter,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn is_expired(&self, entry: &EntryMeta, now: DateTime<Utc>) -> bool {
        let Some(stamp) = entry.timestamp() else {
            return false;
        };
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return false;
        };
        now.signed_duration_since(stamp) > ttl
    }

    /// Delete every entry older than the TTL as of `now`.
    pub async fn expire(&self, partition: &dyn Partition, now: DateTime<Utc>) -> PartitionResult<usize> {
        let stale: Vec<String> = partition
            .entries()
            .await?
            .into_iter()
            .filter(|entry| self.is_expired(entry, now))
            .map(|entry| entry.key)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let results = join_all(stale.iter().map(|key| partition.delete(key))).await;
        let mut removed = 0;
        for result in results {
            if result? {
                removed += 1;
            }
        }

        debug!(partition = partition.name(), removed, "Expired stale entries");
        Ok(removed)
    }

    /// Run [`expire`](Self::expire) unless the rate limiter says it ran recently.
    ///
    /// Returns the number of removed entries, or `None` when throttled.
    pub async fn maybe_expire(&self, partition: &dyn Partition) -> Option<usize> {
        let _guard = self.limiter.try_acquire()?;
        match self.expire(partition, Utc::now()).await {
            Ok(removed) => Some(removed),
            Err(e) => {
                warn!(partition = partition.name(), error = %e, "Expiry pass failed");
                Some(0)
            }
        }
    }

    /// Delete the oldest entries until at most `max_entries` remain.
    pub async fn trim(&self, partition: &dyn Partition) -> PartitionResult<usize> {
        let mut entries = partition.entries().await?;
        if entries.len() <= self.max_entries {
            return Ok(0);
        }

        let entries = oldest_first(entries);
        let excess = entries.len() - self.max_entries;

        let results = join_all(
            entries
                .iter()
                .take(excess)
                .map(|entry| partition.delete(&entry.key)),
        )
        .await;
        for result in results {
            result?;
        }

        debug!(partition = partition.name(), removed = excess, "Trimmed partition to capacity");
        Ok(excess)
    }
}

/// Order entries oldest first by timestamp, then insertion order.
///
/// An entry without a timestamp counts as no older than the newest entry
/// inserted before it.
fn oldest_first(mut entries: Vec<EntryMeta>) -> Vec<EntryMeta> {
    entries.sort_by_key(|entry| entry.sequence);

    let mut newest: Option<DateTime<Utc>> = None;
    let mut ranked: Vec<(Option<DateTime<Utc>>, EntryMeta)> = entries
        .into_iter()
        .map(|entry| {
            if let Some(stamp) = entry.timestamp() {
                newest = newest.max(Some(stamp));
            }
            (entry.timestamp().or(newest), entry)
        })
        .collect();

    ranked.sort_by_key(|(stamp, entry)| (*stamp, entry.sequence));
    ranked.into_iter().map(|(_, entry)| entry).collect()
}
