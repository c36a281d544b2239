//! Worker pool draining the translation request queue.
//!
//! Each worker loops: bounded wait on the queue, drain a small batch,
//! translate each request through the external compiler capability, and
//! register the artifacts with the translation cache. Successful compiles
//! are published to a per-worker SPSC ring so the speculative tracer can
//! fan out successors without the workers taking its locks.
//!
//! # Failure policy
//!
//! A failed compile is logged, counted and dropped. The queue's dedup set
//! has already released the address, so the next demand hit retries it
//! synchronously; the pool itself never re-enqueues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vortex_cache::TranslationCache;
use vortex_core::capability::Translator;
use vortex_core::pool::ObjectPool;
use vortex_core::ring::SpscRing;

use crate::queue::{RejitQueue, RejitRequest};

/// Capacity of each worker's completion ring.
const COMPLETION_RING_CAP: usize = 256;

/// How long a joining shutdown waits before abandoning a worker.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Default)]
struct SharedStats {
    compiled: AtomicU64,
    failures: AtomicU64,
    batches: AtomicU64,
    dropped_completions: AtomicU64,
}

/// Counter snapshot for the worker pool.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    /// Artifacts produced and registered.
    pub compiled: u64,
    /// Requests dropped after a failed compile.
    pub failures: u64,
    /// Batches drained.
    pub batches: u64,
    /// Completion events dropped because a ring was full.
    pub dropped_completions: u64,
}

// =============================================================================
// Pool
// =============================================================================

/// Pool of translation worker threads.
pub struct WorkerPool {
    queue: Arc<RejitQueue>,
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
    completions: Vec<Arc<SpscRing<u64>>>,
    stats: Arc<SharedStats>,
}

impl WorkerPool {
    /// Spawn `workers` threads draining `queue` through `translator` into
    /// `cache`.
    pub fn start<C>(
        queue: Arc<RejitQueue>,
        cache: Arc<TranslationCache<C::Artifact>>,
        translator: Arc<C>,
        workers: usize,
        batch: usize,
        wait: Duration,
    ) -> Self
    where
        C: Translator + 'static,
    {
        let workers = workers.max(1);
        let batch = batch.max(1);
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(SharedStats::default());
        let batch_pool: Arc<ObjectPool<Vec<RejitRequest>>> =
            Arc::new(ObjectPool::new(move || Vec::with_capacity(batch)));

        let mut handles = Vec::with_capacity(workers);
        let mut completions = Vec::with_capacity(workers);
        for index in 0..workers {
            let ring = Arc::new(SpscRing::with_capacity(COMPLETION_RING_CAP));
            completions.push(Arc::clone(&ring));

            let queue = Arc::clone(&queue);
            let cache = Arc::clone(&cache);
            let translator = Arc::clone(&translator);
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            let batch_pool = Arc::clone(&batch_pool);
            let handle = thread::Builder::new()
                .name(format!("vortex-worker-{index}"))
                .spawn(move || {
                    worker_loop(
                        &queue,
                        &cache,
                        translator.as_ref(),
                        &ring,
                        &running,
                        &stats,
                        &batch_pool,
                        batch,
                        wait,
                    );
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            queue,
            running,
            handles,
            completions,
            stats,
        }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.completions.len()
    }

    /// Per-worker completion rings, in worker order. The tracer is the
    /// single consumer of each.
    pub fn completion_rings(&self) -> &[Arc<SpscRing<u64>>] {
        &self.completions
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            compiled: self.stats.compiled.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            dropped_completions: self.stats.dropped_completions.load(Ordering::Relaxed),
        }
    }

    /// Stop the pool: close the queue, wake every worker, join each with a
    /// one-second deadline. Workers past the deadline are abandoned.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.queue.close();
        let deadline = Instant::now() + JOIN_TIMEOUT;
        for handle in self.handles.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
            // Unfinished workers are detached; they observe the running
            // flag at their next wakeup.
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<C>(
    queue: &RejitQueue,
    cache: &TranslationCache<C::Artifact>,
    translator: &C,
    ring: &SpscRing<u64>,
    running: &AtomicBool,
    stats: &SharedStats,
    batch_pool: &ObjectPool<Vec<RejitRequest>>,
    batch: usize,
    wait: Duration,
) where
    C: Translator,
{
    while running.load(Ordering::Acquire) {
        if !queue.wait_for_work(wait) {
            if queue.is_closed() {
                break;
            }
            continue;
        }

        let mut requests = batch_pool.acquire();
        requests.clear();
        queue.try_dequeue_batch(batch, &mut requests);
        if requests.is_empty() {
            continue;
        }
        stats.batches.fetch_add(1, Ordering::Relaxed);

        for req in requests.drain(..) {
            // A racing demand translate may have beaten this request.
            if cache.contains_key(req.addr) {
                continue;
            }
            match translator.compile(req.addr, req.mode) {
                Ok(unit) => {
                    // Zero-length units are uncacheable successes, not
                    // failures; only the demand path can serve them.
                    if unit.guest_len == 0 {
                        continue;
                    }
                    cache.try_add(req.addr, unit.guest_len, unit.artifact);
                    stats.compiled.fetch_add(1, Ordering::Relaxed);
                    if ring.push(req.addr).is_err() {
                        stats.dropped_completions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(err) => {
                    log::warn!("translation of {:#x} failed: {err}", req.addr);
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use vortex_core::capability::{CompileError, CompiledUnit, ExecMode};

    struct ScriptedTranslator {
        /// Addresses that fail to compile.
        poison: HashSet<u64>,
        /// Every compile call, in order.
        calls: Mutex<Vec<u64>>,
        delay: Duration,
    }

    impl ScriptedTranslator {
        fn new() -> Self {
            Self {
                poison: HashSet::new(),
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_poison(addrs: &[u64]) -> Self {
            Self {
                poison: addrs.iter().copied().collect(),
                ..Self::new()
            }
        }
    }

    impl Translator for ScriptedTranslator {
        type Artifact = u64;

        fn compile(
            &self,
            addr: u64,
            _mode: ExecMode,
        ) -> Result<CompiledUnit<u64>, CompileError> {
            self.calls.lock().unwrap().push(addr);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.poison.contains(&addr) {
                return Err(CompileError::InvalidAddress(addr));
            }
            Ok(CompiledUnit::new(addr ^ 0xFFFF, 0x10))
        }
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_pool_drains_and_registers() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::new(64));
        let translator = Arc::new(ScriptedTranslator::new());
        let mut pool = WorkerPool::start(
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&translator),
            2,
            4,
            Duration::from_millis(10),
        );

        for addr in (0x1000u64..0x1100).step_by(0x10) {
            queue.enqueue(addr, ExecMode::Baseline, Priority::Normal);
        }
        assert!(wait_until(2000, || cache.count() == 16));
        for addr in (0x1000u64..0x1100).step_by(0x10) {
            assert_eq!(cache.try_get(addr), Some(addr ^ 0xFFFF));
        }
        assert_eq!(pool.stats().compiled, 16);
        pool.shutdown();
    }

    #[test]
    fn test_failures_counted_and_dropped() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::new(64));
        let translator = Arc::new(ScriptedTranslator::with_poison(&[0x2000]));
        let mut pool = WorkerPool::start(
            Arc::clone(&queue),
            Arc::clone(&cache),
            translator,
            1,
            4,
            Duration::from_millis(10),
        );

        queue.enqueue(0x1000, ExecMode::Baseline, Priority::Normal);
        queue.enqueue(0x2000, ExecMode::Baseline, Priority::Normal);
        assert!(wait_until(2000, || pool.stats().failures == 1
            && pool.stats().compiled == 1));
        assert!(cache.try_get(0x1000).is_some());
        assert!(cache.try_get(0x2000).is_none());
        pool.shutdown();
    }

    #[test]
    fn test_completions_published_to_rings() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::new(64));
        let translator = Arc::new(ScriptedTranslator::new());
        let mut pool = WorkerPool::start(
            Arc::clone(&queue),
            Arc::clone(&cache),
            translator,
            1,
            4,
            Duration::from_millis(10),
        );

        queue.enqueue(0x1000, ExecMode::Baseline, Priority::Critical);
        assert!(wait_until(2000, || cache.count() == 1));
        let rings = pool.completion_rings();
        assert!(wait_until(500, || !rings[0].is_empty()));
        assert_eq!(rings[0].pop(), Some(0x1000));
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_with_pending_backlog() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache = Arc::new(TranslationCache::new(2048));
        let translator = Arc::new(ScriptedTranslator::new());
        let mut pool = WorkerPool::start(
            Arc::clone(&queue),
            Arc::clone(&cache),
            translator,
            2,
            8,
            Duration::from_millis(50),
        );

        for addr in 0..1000u64 {
            queue.enqueue(addr * 0x10 + 1, ExecMode::Baseline, Priority::Background);
        }
        let before = Instant::now();
        pool.shutdown();
        // Close + bounded waits: shutdown must not hang on the backlog.
        assert!(before.elapsed() < Duration::from_secs(3));
        assert!(!queue.enqueue(0x9999, ExecMode::Baseline, Priority::Normal));
    }

    #[test]
    fn test_shutdown_idempotent() {
        let queue = Arc::new(RejitQueue::new(500));
        let cache: Arc<TranslationCache<u64>> = Arc::new(TranslationCache::new(64));
        let translator = Arc::new(ScriptedTranslator::new());
        let mut pool = WorkerPool::start(queue, cache, translator, 1, 4, Duration::from_millis(10));
        pool.shutdown();
        pool.shutdown();
    }
}
