//! Lock-free exact-address fast path in front of the interval map.
//!
//! The hot cache is a probabilistic filter, not a source of truth: an
//! address missing here may still be in the interval map, and eviction may
//! drop entries that are still hot. Both are fine because every miss falls
//! through to the authoritative map.
//!
//! # Eviction
//!
//! When the cache reaches capacity, exactly one thread wins a CAS that
//! drops the size counter by half the capacity and then removes that many
//! arbitrary entries. Under contention the cache can transiently shrink
//! below half capacity; that loss is accepted, correctness never depends
//! on an entry staying resident.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use vortex_core::spin::AdaptiveSpin;

/// Bounded concurrent exact-key cache.
#[derive(Debug)]
pub struct HotCache<V> {
    entries: DashMap<u64, V>,
    capacity: usize,
    size: AtomicUsize,
    lookups: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> HotCache<V> {
    /// Create a cache bounded to `capacity` entries (minimum 2).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(2),
            size: AtomicUsize::new(0),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up `addr`, counting the lookup and any hit.
    #[inline]
    pub fn try_get(&self, addr: u64) -> Option<V> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let value = self.entries.get(&addr).map(|e| e.value().clone());
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Membership test without touching the stats counters.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Insert `addr -> value` unless present. Returns true on insert.
    pub fn insert_if_absent(&self, addr: u64, value: V) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                self.size.fetch_add(1, Ordering::Relaxed);
                self.maybe_evict();
                true
            }
        }
    }

    /// Overwrite the value only when `addr` is already cached.
    pub fn update_if_present(&self, addr: u64, value: V) -> bool {
        match self.entries.get_mut(&addr) {
            Some(mut entry) => {
                *entry = value;
                true
            }
            None => false,
        }
    }

    /// Remove one entry.
    pub fn remove(&self, addr: u64) -> Option<V> {
        let removed = self.entries.remove(&addr).map(|(_, v)| v);
        if removed.is_some() {
            self.debit(1);
        }
        removed
    }

    /// Remove every cached address in `[start, end)`.
    ///
    /// Used when a guest range is invalidated: stabbing promotions may have
    /// cached interior addresses of the range.
    pub fn remove_range(&self, start: u64, end: u64) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|addr, _| {
            let evict = start <= *addr && *addr < end;
            if evict {
                removed += 1;
            }
            !evict
        });
        if removed > 0 {
            self.debit(removed);
        }
        removed
    }

    /// Drop every entry and reset the size counter.
    pub fn clear(&self) {
        self.entries.clear();
        self.size.store(0, Ordering::Relaxed);
    }

    /// Current entry count.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the stats counters.
    pub fn stats(&self) -> HotCacheStats {
        HotCacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.entries.len(),
        }
    }

    /// Best-effort size debit; eviction races can make the counter lag the
    /// map, so never underflow.
    fn debit(&self, n: usize) {
        let _ = self
            .size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| {
                Some(s.saturating_sub(n))
            });
    }

    /// Elect one thread to halve the cache when full.
    fn maybe_evict(&self) {
        let half = self.capacity / 2;
        let mut backoff = AdaptiveSpin::new();
        loop {
            let size = self.size.load(Ordering::Relaxed);
            if size < self.capacity {
                return;
            }
            match self.size.compare_exchange(
                size,
                size - half,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.evict(half);
                    return;
                }
                // Another thread is claiming the eviction; re-check.
                Err(_) => backoff.snooze(),
            }
        }
    }

    /// Remove up to `count` arbitrary entries.
    fn evict(&self, count: usize) {
        // Collect keys first: removing while iterating a shard would
        // deadlock on the shard lock.
        let victims: Vec<u64> = self
            .entries
            .iter()
            .take(count)
            .map(|e| *e.key())
            .collect();
        for key in victims {
            self.entries.remove(&key);
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counter snapshot for the hot cache.
#[derive(Debug, Default, Clone)]
pub struct HotCacheStats {
    /// Total lookups served.
    pub lookups: u64,
    /// Lookups that hit.
    pub hits: u64,
    /// Eviction sweeps performed.
    pub evictions: u64,
    /// Entries resident at snapshot time.
    pub len: usize,
}

impl HotCacheStats {
    /// Hits over lookups, 0.0 when nothing was looked up.
    #[inline]
    pub fn hit_ratio(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
