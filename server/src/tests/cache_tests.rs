//! Tests for the negative-lookup cache

use crate::cache::NegativeCache;
use crate::clock::{Clock, FakeClock};
use std::sync::Arc;

fn cache_with_clock(ttl_secs: u32, capacity: usize) -> (NegativeCache, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::new(1_700_000_000_000));
    let cache = NegativeCache::new(ttl_secs, capacity, Arc::clone(&clock) as Arc<dyn Clock>);
    (cache, clock)
}

#[test]
fn test_entries_expire_after_ttl() {
    let (cache, clock) = cache_with_clock(15, 100);

    cache.mark("entry-1");
    assert!(cache.contains("entry-1"));

    clock.advance_secs(14);
    assert!(cache.contains("entry-1"));

    clock.advance_secs(2);
    assert!(!cache.contains("entry-1"));
    // The expired entry was dropped on lookup.
    assert_eq!(cache.len(), 0);
}

#[test]
fn test_unknown_entries_are_absent() {
    let (cache, _clock) = cache_with_clock(15, 100);
    assert!(!cache.contains("never-marked"));
}

#[test]
fn test_remark_refreshes_ttl() {
    let (cache, clock) = cache_with_clock(15, 100);

    cache.mark("entry-1");
    clock.advance_secs(10);
    cache.mark("entry-1");
    clock.advance_secs(10);
    // 20s after the first mark, 10s after the refresh.
    assert!(cache.contains("entry-1"));
}

#[test]
fn test_cleanup_drops_expired_entries() {
    let (cache, clock) = cache_with_clock(15, 100);

    cache.mark("a");
    cache.mark("b");
    clock.advance_secs(16);
    cache.mark("c");

    cache.cleanup();
    assert_eq!(cache.len(), 1);
    assert!(cache.contains("c"));
}

#[test]
fn test_capacity_overflow_clears_live_entries() {
    let (cache, _clock) = cache_with_clock(15, 3);

    cache.mark("a");
    cache.mark("b");
    cache.mark("c");
    // Everything is live, so the overflow wipes the cache before adding.
    cache.mark("d");

    assert!(cache.contains("d"));
    assert!(!cache.contains("a"));
    assert_eq!(cache.len(), 1);
}
