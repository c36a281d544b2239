//! Public surface of the address-range → artifact store.
//!
//! Composes the lock-free [`HotCache`] with the authoritative
//! [`IntervalMap`] behind a writer-fair read/write lock. The hot path
//! (`try_get` on a cached address) never blocks; map reads share the read
//! side; all mutations serialize on the write side and keep both layers
//! consistent.
//!
//! A successful insert happens-before any later `try_get` observing it:
//! the write-lock release / read-lock acquire pair orders the map update,
//! and hot-cache promotion goes through its own internal synchronization.

use crate::hot_cache::{HotCache, HotCacheStats};
use crate::interval_map::{ConflictResolver, IntervalError, IntervalMap};
use parking_lot::RwLock;

/// Interval-indexed artifact cache with an exact-address fast path.
pub struct TranslationCache<T: Clone> {
    hot: HotCache<T>,
    map: RwLock<IntervalMap<T>>,
}

impl<T: Clone> TranslationCache<T> {
    /// Create a cache whose hot layer holds up to `hot_capacity` entries.
    pub fn new(hot_capacity: usize) -> Self {
        Self {
            hot: HotCache::new(hot_capacity),
            map: RwLock::new(IntervalMap::new()),
        }
    }

    /// Look up the artifact covering `addr`.
    ///
    /// Hot-cache hits return without touching the lock. Map hits are
    /// opportunistically promoted into the hot cache.
    pub fn try_get(&self, addr: u64) -> Option<T> {
        if let Some(artifact) = self.hot.try_get(addr) {
            return Some(artifact);
        }
        let map = self.map.read();
        let artifact = map.try_get(addr).cloned()?;
        drop(map);
        self.hot.insert_if_absent(addr, artifact.clone());
        Some(artifact)
    }

    /// Insert `[addr, addr + size)` unless the exact range is already
    /// present or would overlap another range. Returns true on insert.
    pub fn try_add(&self, addr: u64, size: u64, artifact: T) -> bool {
        let mut map = self.map.write();
        match map.insert_if_absent(addr, addr + size, artifact.clone()) {
            Ok(true) => {
                self.hot.insert_if_absent(addr, artifact);
                true
            }
            Ok(false) | Err(_) => false,
        }
    }

    /// Insert or update `[addr, addr + size)`.
    ///
    /// Overlap with differently-keyed ranges requires `on_conflict`, which
    /// is applied once per clashing range (see
    /// [`IntervalMap::add_or_update`]). The hot entry at `addr` is
    /// refreshed only when already resident; hot entries inside clashing
    /// ranges are purged so stale artifacts cannot be served.
    pub fn add_or_update(
        &self,
        addr: u64,
        size: u64,
        artifact: T,
        on_conflict: Option<ConflictResolver<'_, T>>,
    ) -> Result<bool, IntervalError> {
        let end = addr + size;
        let mut map = self.map.write();
        let mut clashes = Vec::new();
        map.get_overlap_ranges(addr, end, &mut clashes);
        // The exact key is refreshed in place below, not purged.
        clashes.retain(|&(s, e)| !(s == addr && e == end));
        let created = map.add_or_update(addr, end, artifact, on_conflict)?;
        for (s, e) in clashes {
            self.hot.remove_range(s, e);
        }
        if let Some(current) = map.try_get(addr) {
            self.hot.update_if_present(addr, current.clone());
        }
        Ok(created)
    }

    /// Return the authoritative artifact for `[addr, addr + size)`,
    /// inserting `artifact` when absent. The result is promoted into the
    /// hot cache.
    pub fn get_or_add(&self, addr: u64, size: u64, artifact: T) -> Result<T, IntervalError> {
        let mut map = self.map.write();
        let value = map.get_or_add(addr, addr + size, artifact)?;
        self.hot.insert_if_absent(addr, value.clone());
        Ok(value)
    }

    /// Remove every range starting at `addr`, purging hot entries the
    /// removed ranges may have promoted. Returns true when anything was
    /// removed.
    pub fn remove(&self, addr: u64) -> bool {
        let mut map = self.map.write();
        let removed = map.remove_intervals(addr);
        for &(start, end) in removed.iter() {
            self.hot.remove_range(start, end);
        }
        !removed.is_empty()
    }

    /// True when some cached range contains `addr`. Does not perturb the
    /// hot-cache hit statistics.
    pub fn contains_key(&self, addr: u64) -> bool {
        if self.hot.contains(addr) {
            return true;
        }
        self.map.read().contains_key(addr)
    }

    /// Number of cached ranges.
    pub fn count(&self) -> usize {
        self.map.read().len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut map = self.map.write();
        map.clear();
        self.hot.clear();
    }

    /// All artifacts in range order.
    pub fn as_list(&self) -> Vec<T> {
        self.map.read().values()
    }

    /// Starts of all ranges intersecting `[start, end)`.
    pub fn get_overlaps(&self, start: u64, end: u64, out: &mut Vec<u64>) -> usize {
        self.map.read().get_overlaps(start, end, out)
    }

    /// Hot-layer counters (lookups, hits, evictions).
    pub fn stats(&self) -> HotCacheStats {
        self.hot.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_miss_then_insert_then_hot_hit() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        assert_eq!(cache.try_get(0x1000), None);
        assert!(cache.try_add(0x1000, 0x10, 42));
        assert_eq!(cache.try_get(0x1000), Some(42));

        let stats = cache.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_interior_lookup_promotes() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        cache.try_add(0x1000, 0x100, 7);
        // Interior address: hot miss, map hit, promotion.
        assert_eq!(cache.try_get(0x1080), Some(7));
        // Second interior lookup is a hot hit.
        assert_eq!(cache.try_get(0x1080), Some(7));
        let stats = cache.stats();
        assert!(stats.hits >= 1);
    }

    #[test]
    fn test_try_add_rejects_duplicate_and_overlap() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        assert!(cache.try_add(0x1000, 0x10, 1));
        assert!(!cache.try_add(0x1000, 0x10, 2));
        assert!(!cache.try_add(0x1008, 0x10, 3));
        assert_eq!(cache.try_get(0x1000), Some(1));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_remove_purges_promoted_interior_entries() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        cache.try_add(0x1000, 0x100, 7);
        // Promote an interior address into the hot layer.
        assert_eq!(cache.try_get(0x1040), Some(7));
        assert!(cache.remove(0x1000));
        // Neither the start nor the promoted interior address survives.
        assert_eq!(cache.try_get(0x1000), None);
        assert_eq!(cache.try_get(0x1040), None);
        assert!(!cache.remove(0x1000));
    }

    #[test]
    fn test_add_or_update_requires_resolver_on_overlap() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        cache.try_add(0x1000, 0x10, 1);
        assert_eq!(
            cache.add_or_update(0x1008, 0x10, 2, None),
            Err(IntervalError::Overlap)
        );
        let mut resolve = |_addr: u64, old: &u64| old + 100;
        assert_eq!(cache.add_or_update(0x1008, 0x10, 2, Some(&mut resolve)), Ok(false));
        assert_eq!(cache.try_get(0x1000), Some(101));
    }

    #[test]
    fn test_add_or_update_refreshes_resident_hot_entry() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        cache.try_add(0x1000, 0x10, 1);
        assert_eq!(cache.try_get(0x1000), Some(1));
        assert_eq!(cache.add_or_update(0x1000, 0x10, 9, None), Ok(false));
        // The hot entry was refreshed in place, not served stale.
        assert_eq!(cache.try_get(0x1000), Some(9));
    }

    #[test]
    fn test_get_or_add_returns_existing() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        assert_eq!(cache.get_or_add(0x1000, 0x10, 5), Ok(5));
        assert_eq!(cache.get_or_add(0x1000, 0x10, 6), Ok(5));
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_clear() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        cache.try_add(0x1000, 0x10, 1);
        cache.try_add(0x2000, 0x10, 2);
        cache.clear();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.try_get(0x1000), None);
    }

    #[test]
    fn test_as_list_and_overlaps() {
        let cache: TranslationCache<u64> = TranslationCache::new(16);
        cache.try_add(0x2000, 0x10, 2);
        cache.try_add(0x1000, 0x10, 1);
        assert_eq!(cache.as_list(), vec![1, 2]);

        let mut out = Vec::new();
        assert_eq!(cache.get_overlaps(0x0, 0x3000, &mut out), 2);
        assert_eq!(out, vec![0x1000, 0x2000]);
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let cache: Arc<TranslationCache<u64>> = Arc::new(TranslationCache::new(1024));
        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..1000u64 {
                    cache.try_add(i * 0x20, 0x20, i);
                }
            })
        };
        let mut readers = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            readers.push(thread::spawn(move || {
                let mut seen = 0u64;
                for _ in 0..10 {
                    for i in 0..1000u64 {
                        if let Some(v) = cache.try_get(i * 0x20 + 4) {
                            assert_eq!(v, i);
                            seen += 1;
                        }
                    }
                }
                seen
            }));
        }
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        // Every range is now visible.
        for i in 0..1000u64 {
            assert_eq!(cache.try_get(i * 0x20), Some(i));
        }
    }
}
