//! Message dedup cache: loop and storm prevention
//!
//! Maps message id to first-seen timestamp. A control message whose id is
//! already cached is dropped without reprocessing, which is what stops a
//! broadcast from echoing around the mesh forever. The cache is bounded
//! two ways: entries expire after `CACHE_TTL_SECS`, and beyond
//! `MAX_CACHE_SIZE` the oldest entry is evicted first.

use std::collections::{HashMap, VecDeque};

/// Entries expire after this many seconds.
pub const CACHE_TTL_SECS: u64 = 300;

/// Hard cap on cached ids.
pub const MAX_CACHE_SIZE: usize = 500;

/// Bounded first-seen cache over message ids.
#[derive(Debug, Default)]
pub struct DedupCache {
    /// message id -> first-seen unix seconds
    seen: HashMap<String, u64>,
    /// insertion order, oldest at the front
    order: VecDeque<String>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message id. Returns `true` when the id is new (process the
    /// message) and `false` when it was already seen and unexpired (drop).
    pub fn insert(&mut self, message_id: &str, now: u64) -> bool {
        if let Some(&first_seen) = self.seen.get(message_id) {
            if now.saturating_sub(first_seen) < CACHE_TTL_SECS {
                return false;
            }
            // Expired: treat as unseen, refresh the first-seen timestamp.
            if let Some(pos) = self.order.iter().position(|id| id == message_id) {
                self.order.remove(pos);
            }
        }

        if self.seen.len() >= MAX_CACHE_SIZE && !self.seen.contains_key(message_id) {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        self.seen.insert(message_id.to_string(), now);
        self.order.push_back(message_id.to_string());
        true
    }

    /// Whether an id is cached and unexpired.
    pub fn contains(&self, message_id: &str, now: u64) -> bool {
        self.seen
            .get(message_id)
            .map(|&first_seen| now.saturating_sub(first_seen) < CACHE_TTL_SECS)
            .unwrap_or(false)
    }

    /// Drop expired entries, then enforce the size cap oldest-first.
    /// Returns the number of entries removed.
    pub fn prune(&mut self, now: u64) -> usize {
        let before = self.seen.len();

        self.seen
            .retain(|_, &mut first_seen| now.saturating_sub(first_seen) < CACHE_TTL_SECS);
        self.order.retain(|id| self.seen.contains_key(id));

        while self.seen.len() > MAX_CACHE_SIZE {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            } else {
                break;
            }
        }

        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
