//! Speculative translation from observed branch and call targets.
//!
//! The executor reports executions, branches and calls through the
//! `record_*` hooks. Once an address has executed often enough, its
//! recorded successors are queued for opportunistic translation on a
//! single low-priority thread, chasing successor chains up to a bounded
//! depth. Everything here is best-effort: full queues, deep chains and
//! already-cached targets are dropped silently and only counted.

use dashmap::{DashMap, DashSet};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vortex_cache::TranslationCache;
use vortex_core::capability::{ExecMode, Translator};
use vortex_core::config::FabricConfig;
use vortex_core::pool::ObjectPool;
use vortex_core::ring::SpscRing;

/// Most branch targets remembered per source address.
pub const MAX_BRANCH_TARGETS: usize = 8;

/// Pending requests drained per wakeup.
const DRAIN_BATCH: usize = 16;

/// Bounded wait between wakeups.
const WAKE_TIMEOUT: Duration = Duration::from_millis(100);

// =============================================================================
// Configuration
// =============================================================================

/// Tuning knobs for the tracer.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Execution count at which an address arms successor fan-out.
    pub threshold: u32,
    /// Maximum successor-chain depth.
    pub max_depth: u8,
    /// Soft cap on queued speculative addresses.
    pub queue_cap: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            max_depth: 4,
            queue_cap: 256,
        }
    }
}

impl From<&FabricConfig> for TracerConfig {
    fn from(config: &FabricConfig) -> Self {
        Self {
            threshold: config.spec_threshold,
            max_depth: config.max_spec_depth,
            queue_cap: config.queue_max_size,
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct SharedStats {
    enqueued: AtomicU64,
    compiled: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    depth_drops: AtomicU64,
    full_drops: AtomicU64,
}

/// Counter snapshot for the tracer.
#[derive(Debug, Default, Clone)]
pub struct TracerStats {
    /// Addresses accepted into the speculative queue.
    pub enqueued: u64,
    /// Speculative compiles that produced an artifact.
    pub compiled: u64,
    /// Speculative compiles that failed (swallowed).
    pub failures: u64,
    /// Enqueues skipped because the cache already held the address.
    pub cache_hits: u64,
    /// Enqueues dropped at the depth bound.
    pub depth_drops: u64,
    /// Enqueues dropped because the queue was full.
    pub full_drops: u64,
}

// =============================================================================
// Tracer
// =============================================================================

struct Shared<T: Clone + Send + Sync + 'static> {
    exec_counts: DashMap<u64, u32>,
    branch_targets: DashMap<u64, SmallVec<[u64; MAX_BRANCH_TARGETS]>>,
    in_flight: DashSet<u64>,
    pending: Mutex<VecDeque<(u64, u8)>>,
    pending_len: AtomicUsize,
    wake: Condvar,
    running: AtomicBool,
    cache: Arc<TranslationCache<T>>,
    translator: Arc<dyn Translator<Artifact = T>>,
    completions: Vec<Arc<SpscRing<u64>>>,
    scratch: ObjectPool<Vec<(u64, u8)>>,
    config: TracerConfig,
    stats: SharedStats,
}

/// Branch/call-graph observer with an opportunistic compile thread.
pub struct SpeculativeTracer<T: Clone + Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T: Clone + Send + Sync + 'static> SpeculativeTracer<T> {
    /// Create the tracer and spawn its worker thread.
    ///
    /// `completions` are the worker pool's per-worker rings; the tracer is
    /// their single consumer and fans out successors of every completed
    /// demand translation.
    pub fn start(
        cache: Arc<TranslationCache<T>>,
        translator: Arc<dyn Translator<Artifact = T>>,
        completions: Vec<Arc<SpscRing<u64>>>,
        config: TracerConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            exec_counts: DashMap::new(),
            branch_targets: DashMap::new(),
            in_flight: DashSet::new(),
            pending: Mutex::new(VecDeque::new()),
            pending_len: AtomicUsize::new(0),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            cache,
            translator,
            completions,
            scratch: ObjectPool::new(|| Vec::with_capacity(DRAIN_BATCH)),
            config,
            stats: SharedStats::default(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("vortex-spec".into())
                .spawn(move || run_loop(&shared))
                .expect("failed to spawn tracer thread")
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Executor hook: `addr` was executed once more.
    ///
    /// The first crossing of the execution threshold fans out every branch
    /// target recorded so far.
    pub fn record_execution(&self, addr: u64) {
        let crossed = {
            let mut count = self.shared.exec_counts.entry(addr).or_insert(0);
            *count = count.saturating_add(1);
            *count == self.shared.config.threshold
        };
        if crossed {
            fan_out(&self.shared, addr, 0);
        }
    }

    /// Executor hook: a branch from `src` to `tgt` was taken.
    pub fn record_branch(&self, src: u64, tgt: u64) {
        remember_target(&self.shared, src, tgt);
        let armed = self
            .shared
            .exec_counts
            .get(&src)
            .map_or(false, |count| *count >= self.shared.config.threshold);
        if armed {
            spec_enqueue(&self.shared, tgt, 0);
        }
    }

    /// Executor hook: `caller` invoked `callee`. Call targets queue
    /// unconditionally; calls are the strongest next-execution signal.
    pub fn record_call(&self, caller: u64, callee: u64) {
        remember_target(&self.shared, caller, callee);
        spec_enqueue(&self.shared, callee, 0);
    }

    /// Recorded execution count for `addr`.
    pub fn exec_count(&self, addr: u64) -> u32 {
        self.shared.exec_counts.get(&addr).map_or(0, |c| *c)
    }

    /// Recorded successor targets of `addr`.
    pub fn targets_of(&self, addr: u64) -> Vec<u64> {
        self.shared
            .branch_targets
            .get(&addr)
            .map(|t| t.to_vec())
            .unwrap_or_default()
    }

    /// Number of queued speculative addresses.
    pub fn pending(&self) -> usize {
        self.shared.pending_len.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TracerStats {
        let stats = &self.shared.stats;
        TracerStats {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            compiled: stats.compiled.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            cache_hits: stats.cache_hits.load(Ordering::Relaxed),
            depth_drops: stats.depth_drops.load(Ordering::Relaxed),
            full_drops: stats.full_drops.load(Ordering::Relaxed),
        }
    }

    /// Forget all observations and queued work (ROM switch).
    pub fn reset(&self) {
        self.shared.exec_counts.clear();
        self.shared.branch_targets.clear();
        self.shared.in_flight.clear();
        let mut pending = self.shared.pending.lock();
        pending.clear();
        self.shared.pending_len.store(0, Ordering::Relaxed);
    }

    /// Stop the worker thread, joining with a one-second deadline.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + Duration::from_secs(1);
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for SpeculativeTracer<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Internals
// =============================================================================

fn remember_target<T: Clone + Send + Sync + 'static>(shared: &Shared<T>, src: u64, tgt: u64) {
    let mut targets = shared.branch_targets.entry(src).or_default();
    if targets.len() < MAX_BRANCH_TARGETS && !targets.contains(&tgt) {
        targets.push(tgt);
    }
}

/// Queue every recorded successor of `src` at `depth`.
fn fan_out<T: Clone + Send + Sync + 'static>(shared: &Shared<T>, src: u64, depth: u8) {
    // Clone out of the map before enqueueing; spec_enqueue touches other
    // shards and must not run under this entry's lock.
    let targets: SmallVec<[u64; MAX_BRANCH_TARGETS]> = match shared.branch_targets.get(&src) {
        Some(entry) => entry.clone(),
        None => return,
    };
    for tgt in targets {
        spec_enqueue(shared, tgt, depth);
    }
}

fn spec_enqueue<T: Clone + Send + Sync + 'static>(shared: &Shared<T>, addr: u64, depth: u8) -> bool {
    let stats = &shared.stats;
    if depth >= shared.config.max_depth {
        stats.depth_drops.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    if shared.pending_len.load(Ordering::Relaxed) >= shared.config.queue_cap {
        stats.full_drops.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    if shared.cache.contains_key(addr) {
        stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        return false;
    }
    if !shared.in_flight.insert(addr) {
        return false;
    }
    shared.pending.lock().push_back((addr, depth));
    shared.pending_len.fetch_add(1, Ordering::Relaxed);
    stats.enqueued.fetch_add(1, Ordering::Relaxed);
    shared.wake.notify_one();
    true
}

fn run_loop<T: Clone + Send + Sync + 'static>(shared: &Shared<T>) {
    while shared.running.load(Ordering::Acquire) {
        // Demand completions first: code that just materialized is the
        // freshest hint for what runs next.
        for ring in &shared.completions {
            while let Some(addr) = ring.pop() {
                fan_out(shared, addr, 1);
            }
        }

        let mut batch = shared.scratch.acquire();
        batch.clear();
        {
            let mut pending = shared.pending.lock();
            if pending.is_empty() {
                let _ = shared.wake.wait_for(&mut pending, WAKE_TIMEOUT);
            }
            while batch.len() < DRAIN_BATCH {
                match pending.pop_front() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }
        }

        for (addr, depth) in batch.drain(..) {
            shared.in_flight.remove(&addr);
            shared.pending_len.fetch_sub(1, Ordering::Relaxed);
            if !shared.cache.contains_key(addr) {
                match shared.translator.compile(addr, ExecMode::Baseline) {
                    Ok(unit) => {
                        // Zero-length units are uncacheable successes.
                        if unit.guest_len > 0 {
                            shared.cache.try_add(addr, unit.guest_len, unit.artifact);
                            shared.stats.compiled.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(_) => {
                        shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            fan_out(shared, addr, depth.saturating_add(1));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
