//! Per-peer exponential backoff for dial attempts

use parking_lot::Mutex;
use rand::Rng;
use reth_network_peers::PeerId;
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

/// Consecutive failures after which an address is given up on
pub const MAX_DIAL_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    failures: u32,
    next_attempt: Instant,
}

/// Tracks failed dials per peer and when the next attempt is allowed.
#[derive(Debug)]
pub struct DialBackoff {
    base: Duration,
    max: Duration,
    max_jitter: Duration,
    entries: Mutex<HashMap<PeerId, BackoffEntry>>,
}

impl DialBackoff {
    /// Create new backoff tracker
    pub fn new(base: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            max,
            max_jitter,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic part of the delay after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Ids that may not be dialed at `now`
    pub fn blocked_ids(&self, now: Instant) -> HashSet<PeerId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.next_attempt > now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Consecutive failures recorded for `id`
    pub fn failures(&self, id: &PeerId) -> u32 {
        self.entries.lock().get(id).map_or(0, |entry| entry.failures)
    }

    /// Record a failed dial; returns the new failure count.
    pub fn record_failure(&self, id: &PeerId, now: Instant) -> u32 {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.max_jitter)
        };

        let mut entries = self.entries.lock();
        let entry = entries.entry(*id).or_insert(BackoffEntry {
            failures: 0,
            next_attempt: now,
        });
        entry.failures = entry.failures.saturating_add(1);
        entry.next_attempt = now + self.delay_for(entry.failures) + jitter;
        entry.failures
    }

    /// Forget `id`, after a success or when it is dropped from the book.
    pub fn reset(&self, id: &PeerId) {
        self.entries.lock().remove(id);
    }

    /// Number of peers currently tracked
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DialBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(10 * 60),
            Duration::from_secs(3),
        )
    }
}
