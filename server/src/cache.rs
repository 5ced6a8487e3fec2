//! Negative-lookup cache for queue entries
//!
//! A process-local advisory cache marking queue entries as "not claimable"
//! for a short soft TTL. It is written on every claim and inline expiration
//! so that concurrent pollers skip entries that just went away instead of
//! piling transaction aborts onto them. Entries are never trusted for
//! correctness: a wrong entry costs up to one TTL of latency, nothing more.

use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct NegativeCache {
    /// Map of queue-entry key to expiration timestamp (ms).
    entries: Mutex<HashMap<String, i64>>,
    ttl_ms: i64,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl NegativeCache {
    pub fn new(ttl_secs: u32, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms: (ttl_secs as i64) * 1000,
            capacity,
            clock,
        }
    }

    /// Marks a queue entry as not claimable for one TTL.
    pub fn mark(&self, key: &str) {
        let now = self.clock.now_ms();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            entries.retain(|_, expires| *expires > now);
            if entries.len() >= self.capacity {
                // Still full of live entries. Dropping them all is safe: the
                // cache is advisory and a cold cache only costs contention.
                debug!(capacity = self.capacity, "Negative cache full, clearing");
                entries.clear();
            }
        }
        entries.insert(key.to_string(), now + self.ttl_ms);
    }

    /// True when the entry was recently marked not claimable.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(key) {
            Some(expires) if *expires > now => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Drops expired entries. Called periodically from a background task.
    pub fn cleanup(&self) {
        let now = self.clock.now_ms();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = entries.len();
        entries.retain(|_, expires| *expires > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Negative cache cleanup");
        }
    }

    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
