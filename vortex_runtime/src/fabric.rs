//! The fabric: translation cache, dispatch and pacing wired together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vortex_cache::hot_cache::HotCacheStats;
use vortex_cache::TranslationCache;
use vortex_core::capability::{CompileError, CompiledUnit, ExecMode, GuestMemory, Translator};
use vortex_core::config::{ConfigError, FabricConfig};
use vortex_dispatch::{
    Priority, QueueStats, RejitQueue, SpeculativeTracer, TracerConfig, TracerStats, WorkerPool,
    WorkerStats,
};
use vortex_pacing::{
    ControllerStats, FrameController, ScheduleOutcome, SchedulerStats, WorkPriority, WorkScheduler,
};

use crate::prewarm;

/// Process-wide dispatch fabric between the executor, the translators and
/// the render loop.
///
/// Constructed once at startup, [`reset`](Fabric::reset) on ROM switch,
/// [`shutdown`](Fabric::shutdown) before process exit.
pub struct Fabric<C: Translator + 'static> {
    config: FabricConfig,
    translator: Arc<C>,
    cache: Arc<TranslationCache<C::Artifact>>,
    queue: Arc<RejitQueue>,
    workers: WorkerPool,
    tracer: SpeculativeTracer<C::Artifact>,
    controller: Arc<FrameController>,
    scheduler: WorkScheduler,
    demand_compiles: AtomicU64,
    demand_failures: AtomicU64,
}

impl<C: Translator + 'static> Fabric<C> {
    /// Validate `config` and bring every subsystem up.
    pub fn new(config: FabricConfig, translator: Arc<C>) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = Arc::new(TranslationCache::new(config.hot_cache_cap));
        let queue = Arc::new(RejitQueue::new(config.age_unit_ms));
        let workers = WorkerPool::start(
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&translator),
            config.resolved_worker_count(),
            config.worker_batch,
            Duration::from_millis(config.worker_wait_ms),
        );
        let tracer = SpeculativeTracer::start(
            Arc::clone(&cache),
            Arc::clone(&translator) as Arc<dyn Translator<Artifact = C::Artifact>>,
            workers.completion_rings().to_vec(),
            TracerConfig::from(&config),
        );
        let controller = Arc::new(FrameController::new(&config));
        let scheduler = WorkScheduler::start(Arc::clone(&controller));

        Ok(Self {
            config,
            translator,
            cache,
            queue,
            workers,
            tracer,
            controller,
            scheduler,
            demand_compiles: AtomicU64::new(0),
            demand_failures: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Demand path
    // =========================================================================

    /// Cached artifact covering `addr`, if any. Lock-free on the hot path.
    #[inline]
    pub fn try_get(&self, addr: u64) -> Option<C::Artifact> {
        self.cache.try_get(addr)
    }

    /// Artifact for `addr`, translating synchronously on miss.
    ///
    /// The only path that surfaces compile failures to the caller; every
    /// background path swallows them.
    pub fn artifact_for(&self, addr: u64, mode: ExecMode) -> Result<C::Artifact, CompileError> {
        if let Some(artifact) = self.cache.try_get(addr) {
            return Ok(artifact);
        }
        let unit = self.translator.compile(addr, mode).map_err(|err| {
            self.demand_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("demand translation of {addr:#x} failed: {err}");
            err
        })?;
        self.demand_compiles.fetch_add(1, Ordering::Relaxed);
        if unit.guest_len == 0 {
            // Uncacheable; serve it once.
            return Ok(unit.artifact);
        }
        match self
            .cache
            .get_or_add(addr, unit.guest_len, unit.artifact.clone())
        {
            Ok(authoritative) => Ok(authoritative),
            // A stale overlapping range is still registered; serve the
            // fresh artifact without caching it.
            Err(_) => Ok(unit.artifact),
        }
    }

    /// Queue a background translation. Returns false when the queue is
    /// closed or `addr` already has a live request.
    pub fn request_translation(&self, addr: u64, mode: ExecMode, priority: Priority) -> bool {
        self.queue.enqueue(addr, mode, priority)
    }

    /// Promote a queued request to Critical.
    pub fn boost(&self, addr: u64) -> bool {
        self.queue.boost(addr)
    }

    /// Idempotently register an externally produced artifact.
    pub fn register(&self, addr: u64, unit: CompiledUnit<C::Artifact>) -> bool {
        if unit.guest_len == 0 {
            return false;
        }
        self.cache.try_add(addr, unit.guest_len, unit.artifact)
    }

    /// Drop every artifact whose range starts at `addr` (rejit support).
    pub fn invalidate(&self, addr: u64) -> bool {
        self.cache.remove(addr)
    }

    // =========================================================================
    // Executor hooks
    // =========================================================================

    /// `addr` was executed.
    #[inline]
    pub fn on_execute(&self, addr: u64) {
        self.tracer.record_execution(addr);
    }

    /// A branch from `src` to `tgt` was taken.
    #[inline]
    pub fn on_branch(&self, src: u64, tgt: u64) {
        self.tracer.record_branch(src, tgt);
    }

    /// `caller` invoked `callee`.
    #[inline]
    pub fn on_call(&self, caller: u64, callee: u64) {
        self.tracer.record_call(caller, callee);
    }

    // =========================================================================
    // Render-loop hooks
    // =========================================================================

    /// A shader was compiled this frame.
    #[inline]
    pub fn record_shader(&self) {
        self.controller.record_shader();
    }

    /// A texture was uploaded this frame.
    #[inline]
    pub fn record_texture(&self) {
        self.controller.record_texture();
    }

    /// A buffer upload happened this frame.
    #[inline]
    pub fn record_buffer_upload(&self) {
        self.controller.record_buffer_upload();
    }

    /// Frame boundary: advance the pacing state machine, then drain
    /// deferred work inside the new frame's budget.
    pub fn end_frame(&self) {
        self.controller.end_frame();
        self.scheduler.process_deferred();
    }

    /// Gate a background work item through the deferral policy.
    pub fn schedule_background(
        &self,
        priority: WorkPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> ScheduleOutcome {
        self.scheduler.schedule(priority, work)
    }

    // =========================================================================
    // Bulk scan
    // =========================================================================

    /// Walk `[start, end)` through the memory capability and queue every
    /// plausible, untranslated code word at Background priority. Returns
    /// the number of addresses queued.
    pub fn prewarm_region(&self, start: u64, end: u64, memory: &dyn GuestMemory) -> usize {
        prewarm::scan_range(memory, start, end, |addr| {
            !self.cache.contains_key(addr)
                && self
                    .queue
                    .enqueue(addr, ExecMode::Baseline, Priority::Background)
        })
    }

    // =========================================================================
    // Lifecycle / introspection
    // =========================================================================

    /// Forget all cached artifacts, queued work and pacing state
    /// (ROM switch). Threads keep running.
    pub fn reset(&self) {
        self.queue.clear();
        self.cache.clear();
        self.tracer.reset();
        self.controller.reset();
    }

    /// Stop every fabric thread. Pending queue entries are dropped once
    /// the workers drain or the join deadline passes.
    pub fn shutdown(&mut self) {
        self.queue.close();
        self.workers.shutdown();
        self.tracer.shutdown();
        self.scheduler.shutdown();
    }

    /// The translation cache handle.
    pub fn cache(&self) -> &Arc<TranslationCache<C::Artifact>> {
        &self.cache
    }

    /// The demand request queue handle.
    pub fn queue(&self) -> &Arc<RejitQueue> {
        &self.queue
    }

    /// The frame controller handle (process-wide policy surface).
    pub fn controller(&self) -> &Arc<FrameController> {
        &self.controller
    }

    /// The deferral gate.
    pub fn scheduler(&self) -> &WorkScheduler {
        &self.scheduler
    }

    /// The speculative tracer.
    pub fn tracer(&self) -> &SpeculativeTracer<C::Artifact> {
        &self.tracer
    }

    /// Active configuration.
    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    /// Aggregated counter snapshot across every subsystem.
    pub fn stats(&self) -> FabricStats {
        FabricStats {
            cache: self.cache.stats(),
            queue: self.queue.stats(),
            workers: self.workers.stats(),
            tracer: self.tracer.stats(),
            controller: self.controller.stats(),
            scheduler: self.scheduler.stats(),
            demand_compiles: self.demand_compiles.load(Ordering::Relaxed),
            demand_failures: self.demand_failures.load(Ordering::Relaxed),
            cached_ranges: self.cache.count(),
        }
    }
}

/// Aggregated fabric counters.
#[derive(Debug, Default, Clone)]
pub struct FabricStats {
    pub cache: HotCacheStats,
    pub queue: QueueStats,
    pub workers: WorkerStats,
    pub tracer: TracerStats,
    pub controller: ControllerStats,
    pub scheduler: SchedulerStats,
    pub demand_compiles: u64,
    pub demand_failures: u64,
    pub cached_ranges: usize,
}
