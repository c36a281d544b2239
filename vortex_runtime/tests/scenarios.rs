//! End-to-end fabric scenarios with a scripted translator.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use vortex_runtime::{
    CompileError, CompiledUnit, ExecMode, Fabric, FabricConfig, GuestMemory, Priority, RejitQueue,
    TransitionState, Translator,
};

// =============================================================================
// Scripted Translator
// =============================================================================

struct ScriptedTranslator {
    delay: Duration,
    unit_len: u64,
    /// Addresses that always fail.
    poison: HashSet<u64>,
    /// Addresses that fail exactly once.
    flaky: Mutex<HashSet<u64>>,
    calls: Mutex<Vec<u64>>,
}

impl ScriptedTranslator {
    fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
            unit_len: 0x10,
            poison: HashSet::new(),
            flaky: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::instant()
        }
    }

    fn with_unit_len(unit_len: u64) -> Self {
        Self {
            unit_len,
            ..Self::instant()
        }
    }

    fn with_flaky(addrs: &[u64]) -> Self {
        Self {
            flaky: Mutex::new(addrs.iter().copied().collect()),
            ..Self::instant()
        }
    }
}

impl Translator for ScriptedTranslator {
    type Artifact = u64;

    fn compile(&self, addr: u64, _mode: ExecMode) -> Result<CompiledUnit<u64>, CompileError> {
        self.calls.lock().unwrap().push(addr);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.poison.contains(&addr) {
            return Err(CompileError::InvalidAddress(addr));
        }
        if self.flaky.lock().unwrap().remove(&addr) {
            return Err(CompileError::Backend("transient encoder fault".into()));
        }
        Ok(CompiledUnit::new(addr | 0x8000_0000, self.unit_len))
    }
}

fn small_fabric(translator: ScriptedTranslator) -> Fabric<ScriptedTranslator> {
    let config = FabricConfig {
        worker_count: Some(2),
        worker_wait_ms: 10,
        ..FabricConfig::default()
    };
    Fabric::new(config, Arc::new(translator)).expect("valid config")
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

// =============================================================================
// Demand translate, then hot-path hit
// =============================================================================

#[test]
fn scenario_demand_insert_then_hot_hit() {
    let mut fabric = small_fabric(ScriptedTranslator::instant());

    assert!(fabric.try_get(0x1000).is_none());
    assert!(fabric.register(0x1000, CompiledUnit::new(0xA1, 0x10)));
    assert_eq!(fabric.try_get(0x1000), Some(0xA1));

    let stats = fabric.stats();
    assert_eq!(stats.cache.lookups, 2);
    assert_eq!(stats.cache.hits, 1);
    assert!((stats.cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    fabric.shutdown();
}

#[test]
fn scenario_demand_path_compiles_on_miss() {
    let mut fabric = small_fabric(ScriptedTranslator::instant());

    let artifact = fabric.artifact_for(0x2000, ExecMode::Baseline).unwrap();
    assert_eq!(artifact, 0x2000 | 0x8000_0000);
    // Second request is a pure cache hit.
    assert_eq!(fabric.artifact_for(0x2000, ExecMode::Baseline).unwrap(), artifact);
    assert_eq!(fabric.stats().demand_compiles, 1);
    fabric.shutdown();
}

#[test]
fn scenario_demand_failure_retries_next_call() {
    let mut fabric = small_fabric(ScriptedTranslator::with_flaky(&[0x3000]));

    // One-off hitch, not a crash.
    assert!(fabric.artifact_for(0x3000, ExecMode::Baseline).is_err());
    assert_eq!(fabric.stats().demand_failures, 1);
    // The retry on the next lookup succeeds.
    assert!(fabric.artifact_for(0x3000, ExecMode::Baseline).is_ok());
    assert!(fabric.try_get(0x3000).is_some());
    fabric.shutdown();
}

// =============================================================================
// Speculative fan-out
// =============================================================================

#[test]
fn scenario_speculative_fanout() {
    let mut fabric = small_fabric(ScriptedTranslator::instant());

    fabric.on_branch(0x100, 0x200);
    fabric.on_branch(0x100, 0x300);
    for _ in 0..3 {
        fabric.on_execute(0x100);
    }

    assert!(wait_until(2000, || {
        fabric.cache().contains_key(0x200) && fabric.cache().contains_key(0x300)
    }));
    fabric.shutdown();
}

#[test]
fn scenario_worker_completion_feeds_tracer() {
    let mut fabric = small_fabric(ScriptedTranslator::instant());

    // Successor known before the demand compile lands.
    fabric.on_branch(0x5000, 0x6000);
    fabric.request_translation(0x5000, ExecMode::Baseline, Priority::High);

    // The worker compiles 0x5000, the tracer picks up the completion and
    // chases 0x6000.
    assert!(wait_until(2000, || {
        fabric.cache().contains_key(0x5000) && fabric.cache().contains_key(0x6000)
    }));
    fabric.shutdown();
}

// =============================================================================
// Aging promotion
// =============================================================================

#[test]
fn scenario_aging_promotion_background_to_critical() {
    let queue = RejitQueue::new(500);
    assert!(queue.enqueue_at(0xA, ExecMode::Baseline, Priority::Background, 0));

    queue.promote_aged(2600);
    assert_eq!(queue.band_of(0xA), Some(0));

    let req = queue.try_dequeue_at(2600).expect("request must drain");
    assert_eq!(req.addr, 0xA);
    assert_eq!(req.priority, 0);
    assert_eq!(req.promotions, 4);
    assert!(queue.try_dequeue_at(2600).is_none());
}

// =============================================================================
// Transition throttle
// =============================================================================

#[test]
fn scenario_transition_throttle() {
    let mut fabric = small_fabric(ScriptedTranslator::instant());
    let controller = Arc::clone(fabric.controller());

    // 30 quiet frames at 16 ms.
    let mut now = 0u64;
    for _ in 0..30 {
        now += 16;
        controller.end_frame_at(now);
    }
    assert_eq!(controller.state(), TransitionState::Idle);

    // One heavy frame: 5 shaders, 6 textures, 30 ms.
    for _ in 0..5 {
        fabric.record_shader();
    }
    for _ in 0..6 {
        fabric.record_texture();
    }
    now += 30;
    controller.end_frame_at(now);

    assert_eq!(controller.state(), TransitionState::Grace);
    assert_eq!(controller.max_shaders_this_frame(), 1);
    assert_eq!(controller.max_textures_this_frame(), 2);

    // 20+ light frames settle back through ExtendedGrace to Idle within
    // 450 ms of simulated time.
    let spike_at = now;
    let mut saw_extended = false;
    let mut idle_at = None;
    for _ in 0..40 {
        now += 14;
        controller.end_frame_at(now);
        match controller.state() {
            TransitionState::ExtendedGrace => saw_extended = true,
            TransitionState::Idle => {
                idle_at = Some(now);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_extended);
    let idle_at = idle_at.expect("controller never returned to idle");
    assert!(idle_at - spike_at <= 450);
    fabric.shutdown();
}

// =============================================================================
// Queue dedup and boost
// =============================================================================

#[test]
fn scenario_queue_dedup() {
    let queue = RejitQueue::new(500);
    assert!(queue.enqueue(0xABCD, ExecMode::Baseline, Priority::Normal));
    assert!(!queue.enqueue(0xABCD, ExecMode::Baseline, Priority::Critical));
    assert_eq!(queue.pending(), 1);
    assert_eq!(queue.band_of(0xABCD), Some(Priority::Normal.index()));
}

#[test]
fn scenario_queue_boost() {
    let queue = RejitQueue::new(500);
    queue.enqueue(0xABCD, ExecMode::Baseline, Priority::Normal);
    assert!(queue.boost(0xABCD));
    assert_eq!(queue.band_of(0xABCD), Some(Priority::Critical.index()));
    assert_eq!(queue.pending(), 1);
}

// =============================================================================
// Graceful shutdown
// =============================================================================

#[test]
fn scenario_graceful_shutdown_with_backlog() {
    let mut fabric = small_fabric(ScriptedTranslator::with_delay(Duration::from_millis(1)));

    for i in 0..1000u64 {
        fabric.request_translation(0x10_0000 + i * 0x10, ExecMode::Baseline, Priority::Background);
    }

    let before = Instant::now();
    fabric.shutdown();
    assert!(before.elapsed() < Duration::from_secs(3));

    // Closed for business, and the books balance.
    assert!(!fabric.request_translation(0x1, ExecMode::Baseline, Priority::Critical));
    let stats = fabric.stats();
    assert_eq!(
        stats.queue.pending as u64,
        stats.queue.enqueued - stats.queue.dequeued
    );
}

// =============================================================================
// Bulk scan
// =============================================================================

struct FlatMemory {
    base: u64,
    words: Vec<u32>,
}

impl GuestMemory for FlatMemory {
    fn is_mapped(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + (self.words.len() as u64) * 4
    }

    fn read_u32(&self, addr: u64) -> u32 {
        self.words[((addr - self.base) / 4) as usize]
    }
}

#[test]
fn scenario_prewarm_region_translates_in_background() {
    let mut fabric = small_fabric(ScriptedTranslator::with_unit_len(4));
    let memory = FlatMemory {
        base: 0x4000,
        words: vec![0x1111_1111; 8],
    };

    let queued = fabric.prewarm_region(0x4000, 0x4020, &memory);
    assert_eq!(queued, 8);

    assert!(wait_until(2000, || fabric.cache().count() == 8));
    for addr in (0x4000u64..0x4020).step_by(4) {
        assert!(fabric.cache().contains_key(addr));
    }
    fabric.shutdown();
}

// =============================================================================
// Reset (ROM switch)
// =============================================================================

#[test]
fn scenario_reset_clears_everything() {
    let mut fabric = small_fabric(ScriptedTranslator::instant());

    fabric.artifact_for(0x7000, ExecMode::Baseline).unwrap();
    fabric.on_branch(0x7000, 0x7100);
    assert!(fabric.cache().count() > 0);

    fabric.reset();
    assert_eq!(fabric.cache().count(), 0);
    assert!(fabric.try_get(0x7000).is_none());
    assert_eq!(fabric.controller().state(), TransitionState::Idle);
    fabric.shutdown();
}
