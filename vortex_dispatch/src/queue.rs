//! Multi-level translation request queue with priority aging.
//!
//! Five FIFO bands indexed Critical..Background, a dedup set bounding each
//! address to one live request, and a condition variable coordinating
//! blocked consumers.
//!
//! # Ordering
//!
//! Across bands, lower index always wins. Within a band, pops are LIFO:
//! hot code arrives in bursts and the newest request is the most likely to
//! be executed next.
//!
//! # Aging
//!
//! Every dequeue first promotes starved requests. Bands are scanned from
//! Background upward and the original enqueue tick is kept, so a request
//! older than its band's threshold cascades through the remaining bands in
//! a single pass — once starved, it goes straight to Critical rather than
//! re-waiting per band.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use vortex_core::capability::ExecMode;
use vortex_core::clock::monotonic_ms;

/// Number of priority bands.
pub const BAND_COUNT: usize = 5;

// =============================================================================
// Priority
// =============================================================================

/// Request priority; doubles as the band index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl Priority {
    /// Band index of this priority.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Priority for a band index, if valid.
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            4 => Some(Priority::Background),
            _ => None,
        }
    }
}

// =============================================================================
// Request
// =============================================================================

/// A queued translation request.
#[derive(Debug, Clone)]
pub struct RejitRequest {
    /// Guest address to translate.
    pub addr: u64,
    /// Target tier.
    pub mode: ExecMode,
    /// Current band index (0 = Critical).
    pub priority: u8,
    /// Millisecond tick of the original enqueue; preserved across aging
    /// promotions so starvation is measured from first submission.
    pub enqueued_tick: u64,
    /// Number of aging promotions this request has received.
    pub promotions: u8,
}

// =============================================================================
// Queue
// =============================================================================

struct QueueInner {
    bands: [VecDeque<RejitRequest>; BAND_COUNT],
    dedup: FxHashSet<u64>,
    count: usize,
    closed: bool,
}

impl QueueInner {
    fn pop_highest(&mut self) -> Option<RejitRequest> {
        for band in self.bands.iter_mut() {
            if let Some(req) = band.pop_back() {
                self.dedup.remove(&req.addr);
                self.count -= 1;
                return Some(req);
            }
        }
        None
    }
}

/// Five-band aged MPMC queue of translation requests.
pub struct RejitQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    age_unit_ms: u64,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    duplicates: AtomicU64,
    promotions: AtomicU64,
}

impl RejitQueue {
    /// Create a queue with the given aging quantum.
    pub fn new(age_unit_ms: u64) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                bands: std::array::from_fn(|_| VecDeque::new()),
                dedup: FxHashSet::default(),
                count: 0,
                closed: false,
            }),
            available: Condvar::new(),
            age_unit_ms: age_unit_ms.max(1),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
        }
    }

    /// Submit a request. Returns false when the queue is closed or the
    /// address already has a live request.
    pub fn enqueue(&self, addr: u64, mode: ExecMode, priority: Priority) -> bool {
        self.enqueue_at(addr, mode, priority, monotonic_ms())
    }

    /// [`enqueue`](Self::enqueue) with an explicit tick, for replayable
    /// tests and trace-driven tuning.
    pub fn enqueue_at(&self, addr: u64, mode: ExecMode, priority: Priority, now_ms: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        if !inner.dedup.insert(addr) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.bands[priority.index()].push_back(RejitRequest {
            addr,
            mode,
            priority: priority.index() as u8,
            enqueued_tick: now_ms,
            promotions: 0,
        });
        inner.count += 1;
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Take the highest-priority request, optionally blocking until one is
    /// available or the queue is closed.
    pub fn try_dequeue(&self, blocking: bool) -> Option<RejitRequest> {
        let mut inner = self.inner.lock();
        loop {
            self.promote_aged_locked(&mut inner, monotonic_ms());
            if let Some(req) = inner.pop_highest() {
                self.dequeued.fetch_add(1, Ordering::Relaxed);
                return Some(req);
            }
            if inner.closed || !blocking {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Non-blocking dequeue at an explicit tick, for replayable tests.
    pub fn try_dequeue_at(&self, now_ms: u64) -> Option<RejitRequest> {
        let mut inner = self.inner.lock();
        self.promote_aged_locked(&mut inner, now_ms);
        let req = inner.pop_highest();
        if req.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        req
    }

    /// Drain up to `max` requests into `out`, highest priority first.
    /// Never blocks; returns the number drained.
    pub fn try_dequeue_batch(&self, max: usize, out: &mut Vec<RejitRequest>) -> usize {
        let mut inner = self.inner.lock();
        self.promote_aged_locked(&mut inner, monotonic_ms());
        let mut drained = 0;
        while drained < max {
            match inner.pop_highest() {
                Some(req) => {
                    out.push(req);
                    drained += 1;
                }
                None => break,
            }
        }
        self.dequeued.fetch_add(drained as u64, Ordering::Relaxed);
        drained
    }

    /// Bounded wait for pending work. Returns true when at least one
    /// request is queued.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            return true;
        }
        if inner.closed {
            return false;
        }
        let _ = self.available.wait_for(&mut inner, timeout);
        inner.count > 0
    }

    /// Move a queued request to the Critical band. Returns false when the
    /// address has no live request outside Critical.
    pub fn boost(&self, addr: u64) -> bool {
        let mut inner = self.inner.lock();
        for band_idx in 1..BAND_COUNT {
            let band = &mut inner.bands[band_idx];
            if let Some(pos) = band.iter().position(|r| r.addr == addr) {
                let mut req = band.remove(pos).expect("position came from iter");
                req.priority = Priority::Critical.index() as u8;
                inner.bands[Priority::Critical.index()].push_back(req);
                drop(inner);
                self.available.notify_one();
                return true;
            }
        }
        false
    }

    /// Run one aging pass at an explicit tick. Normally invoked from the
    /// dequeue side; exposed for replayable tests.
    pub fn promote_aged(&self, now_ms: u64) {
        let mut inner = self.inner.lock();
        self.promote_aged_locked(&mut inner, now_ms);
    }

    /// Drop all pending requests.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for band in inner.bands.iter_mut() {
            band.clear();
        }
        inner.dedup.clear();
        inner.count = 0;
    }

    /// Close the queue: wake all waiters, reject further enqueues.
    /// Pending requests remain drainable.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of pending requests.
    pub fn pending(&self) -> usize {
        self.inner.lock().count
    }

    /// Whether `addr` currently has a live request.
    pub fn contains(&self, addr: u64) -> bool {
        self.inner.lock().dedup.contains(&addr)
    }

    /// Band index currently holding `addr`, if queued.
    pub fn band_of(&self, addr: u64) -> Option<usize> {
        let inner = self.inner.lock();
        for (idx, band) in inner.bands.iter().enumerate() {
            if band.iter().any(|r| r.addr == addr) {
                return Some(idx);
            }
        }
        None
    }

    /// Counter snapshot.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Promote starved requests, scanning Background→High so a request past
    /// several thresholds cascades to Critical in one pass.
    fn promote_aged_locked(&self, inner: &mut QueueInner, now_ms: u64) {
        let mut moved = 0u64;
        for band_idx in (1..BAND_COUNT).rev() {
            let threshold = self.age_unit_ms * (band_idx as u64 + 1);
            let (dest, src) = inner.bands.split_at_mut(band_idx);
            let band = &mut src[0];
            let mut i = 0;
            while i < band.len() {
                if now_ms.saturating_sub(band[i].enqueued_tick) > threshold {
                    let mut req = band.remove(i).expect("index in bounds");
                    req.priority = (band_idx - 1) as u8;
                    req.promotions += 1;
                    dest[band_idx - 1].push_back(req);
                    moved += 1;
                } else {
                    i += 1;
                }
            }
        }
        if moved > 0 {
            self.promotions.fetch_add(moved, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let inner = self.inner.lock();
        let total: usize = inner.bands.iter().map(|b| b.len()).sum();
        assert_eq!(total, inner.count);
        assert_eq!(inner.dedup.len(), inner.count);
        let mut seen = FxHashSet::default();
        for band in inner.bands.iter() {
            for req in band {
                assert!(seen.insert(req.addr), "address in two bands");
                assert!(inner.dedup.contains(&req.addr));
            }
        }
    }
}

/// Counter snapshot for the request queue.
#[derive(Debug, Default, Clone)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub duplicates: u64,
    pub promotions: u64,
    pub pending: usize,
}

// =============================================================================
// Tests
// =============================================================================
