//! GPU program pipeline: hash-keyed cache plus gated background builds.
//!
//! Programs are artifacts like any other, keyed by their source hash, so
//! the pipeline stores them in a [`TranslationCache`] with unit-length
//! ranges and gets the same hot-path/promotion behavior the translation
//! side has. Builds are accounted against the frame controller and routed
//! through the deferral gate when the frame loop is under pressure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vortex_cache::hot_cache::HotCacheStats;
use vortex_cache::TranslationCache;
use vortex_core::capability::{ProgramError, ProgramFactory, ProgramInfo, ShaderSource};
use vortex_pacing::{FrameController, ScheduleOutcome, WorkPriority, WorkScheduler};

/// Hash-keyed program cache in front of a renderer's program factory.
pub struct ShaderPipeline<F: ProgramFactory + 'static> {
    factory: Arc<F>,
    programs: Arc<TranslationCache<F::Program>>,
    controller: Arc<FrameController>,
    builds: AtomicU64,
    build_failures: AtomicU64,
    warmup_requests: AtomicU64,
}

impl<F: ProgramFactory + 'static> ShaderPipeline<F> {
    /// Create a pipeline with a hot-program cache of `hot_capacity`.
    pub fn new(factory: Arc<F>, controller: Arc<FrameController>, hot_capacity: usize) -> Self {
        Self {
            factory,
            programs: Arc::new(TranslationCache::new(hot_capacity)),
            controller,
            builds: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            warmup_requests: AtomicU64::new(0),
        }
    }

    /// Cached program for `source_hash`, if built.
    #[inline]
    pub fn get(&self, source_hash: u64) -> Option<F::Program> {
        self.programs.try_get(source_hash)
    }

    /// Build (or fetch) the program for `info.source_hash` on the calling
    /// thread, accounting the build against the current frame.
    pub fn build_now(
        &self,
        sources: &[ShaderSource],
        info: &ProgramInfo,
    ) -> Result<F::Program, ProgramError> {
        if let Some(program) = self.programs.try_get(info.source_hash) {
            return Ok(program);
        }
        self.controller.record_shader();
        let program = self.factory.create_program(sources, info).map_err(|err| {
            self.build_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("program build {:#x} failed: {err}", info.source_hash);
            err
        })?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.programs
            .try_add(info.source_hash, 1, program.clone());
        Ok(program)
    }

    /// Route a build through the deferral gate: inline when the frame can
    /// afford it, parked otherwise. Already-built programs short-circuit.
    pub fn request_build(
        self: &Arc<Self>,
        scheduler: &WorkScheduler,
        sources: Vec<ShaderSource>,
        info: ProgramInfo,
    ) -> ScheduleOutcome {
        if self.programs.contains_key(info.source_hash) {
            return ScheduleOutcome::RanInline;
        }
        let priority = if self.controller.should_defer_shader_build() {
            WorkPriority::Low
        } else {
            WorkPriority::Normal
        };
        let pipeline = Arc::clone(self);
        scheduler.schedule(priority, move || {
            // Failures were already counted and logged.
            let _ = pipeline.build_now(&sources, &info);
        })
    }

    /// Warmup accounting sink: records that a prewarm pass wanted this
    /// program without forcing a build. Feeds the build-rate counters the
    /// frontends display.
    pub fn note_warmup_request(&self) {
        self.warmup_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ShaderPipelineStats {
        ShaderPipelineStats {
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            warmup_requests: self.warmup_requests.load(Ordering::Relaxed),
            cached_programs: self.programs.count(),
            hot: self.programs.stats(),
        }
    }

    /// Drop every cached program (device loss, ROM switch).
    pub fn clear(&self) {
        self.programs.clear();
    }
}

/// Counter snapshot for the shader pipeline.
#[derive(Debug, Default, Clone)]
pub struct ShaderPipelineStats {
    pub builds: u64,
    pub build_failures: u64,
    pub warmup_requests: u64,
    pub cached_programs: usize,
    pub hot: HotCacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use vortex_core::capability::ShaderStage;
    use vortex_core::config::FabricConfig;

    struct CountingFactory {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl ProgramFactory for CountingFactory {
        type Program = u64;

        fn create_program(
            &self,
            _sources: &[ShaderSource],
            info: &ProgramInfo,
        ) -> Result<u64, ProgramError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProgramError::Backend("link failed".into()));
            }
            Ok(info.source_hash ^ 0xABCD)
        }
    }

    fn controller() -> Arc<FrameController> {
        Arc::new(FrameController::new(&FabricConfig::default()))
    }

    fn sources() -> Vec<ShaderSource> {
        vec![
            ShaderSource::new(ShaderStage::Vertex, vec![1, 2, 3]),
            ShaderSource::new(ShaderStage::Fragment, vec![4, 5, 6]),
        ]
    }

    #[test]
    fn test_build_now_caches() {
        let factory = Arc::new(CountingFactory::new());
        let pipeline = ShaderPipeline::new(Arc::clone(&factory), controller(), 64);
        let info = ProgramInfo {
            source_hash: 0x9000,
            label: None,
        };
        let first = pipeline.build_now(&sources(), &info).unwrap();
        let second = pipeline.build_now(&sources(), &info).unwrap();
        assert_eq!(first, second);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.stats().builds, 1);
        assert_eq!(pipeline.stats().cached_programs, 1);
    }

    #[test]
    fn test_build_accounts_to_controller() {
        let controller = controller();
        let factory = Arc::new(CountingFactory::new());
        let pipeline = ShaderPipeline::new(factory, Arc::clone(&controller), 64);
        let info = ProgramInfo {
            source_hash: 0x9100,
            label: None,
        };
        pipeline.build_now(&sources(), &info).unwrap();
        assert_eq!(controller.shaders_this_frame(), 1);
    }

    #[test]
    fn test_failure_counted() {
        let factory = Arc::new(CountingFactory {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let pipeline = ShaderPipeline::new(factory, controller(), 64);
        let info = ProgramInfo {
            source_hash: 0x9200,
            label: None,
        };
        assert!(pipeline.build_now(&sources(), &info).is_err());
        let stats = pipeline.stats();
        assert_eq!(stats.build_failures, 1);
        assert_eq!(stats.builds, 0);
        assert_eq!(stats.cached_programs, 0);
    }

    #[test]
    fn test_warmup_is_accounting_only() {
        let factory = Arc::new(CountingFactory::new());
        let pipeline = ShaderPipeline::new(Arc::clone(&factory), controller(), 64);
        pipeline.note_warmup_request();
        pipeline.note_warmup_request();
        assert_eq!(pipeline.stats().warmup_requests, 2);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear() {
        let factory = Arc::new(CountingFactory::new());
        let pipeline = ShaderPipeline::new(Arc::clone(&factory), controller(), 64);
        let info = ProgramInfo {
            source_hash: 0x9300,
            label: None,
        };
        pipeline.build_now(&sources(), &info).unwrap();
        pipeline.clear();
        assert_eq!(pipeline.stats().cached_programs, 0);
        pipeline.build_now(&sources(), &info).unwrap();
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
    }
}
