//! Deferral gate wrapping every opportunistic background producer.
//!
//! `schedule` asks the [`FrameController`] whether a work item may run on
//! the calling thread right now; otherwise the item is parked in one of
//! three bands. Deferred work drains from two places:
//!
//! - `process_deferred`, called once per frame boundary, drains bands in
//!   priority order inside the controller's per-frame budget and an 8 ms
//!   wall-clock cap
//! - a background thread drains the Low band whenever the controller is
//!   neither in a transition episode nor under a heavy-load pattern,
//!   yielding between items

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::controller::{FrameController, TransitionState};

/// Wall-clock budget for the per-frame drain.
const FRAME_DRAIN_BUDGET: Duration = Duration::from_millis(8);

/// Sleep between background-drained items, yielding to the frame loop.
const BACKGROUND_ITEM_PAUSE: Duration = Duration::from_millis(1);

/// Background thread nap while throttled or out of work.
const BACKGROUND_IDLE_WAIT: Duration = Duration::from_millis(50);

type WorkItem = Box<dyn FnOnce() + Send>;

// =============================================================================
// Priority / Outcome
// =============================================================================

/// Deferral band for background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum WorkPriority {
    /// Drained last; the background thread's only diet.
    Low = 0,
    /// Drained at frame boundaries when budget allows.
    Normal = 1,
    /// Never deferred.
    Critical = 2,
}

/// What `schedule` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Ran on the calling thread before returning.
    RanInline,
    /// Parked for a later drain.
    Deferred,
}

// =============================================================================
// Scheduler
// =============================================================================

#[derive(Default)]
struct Bands {
    low: VecDeque<WorkItem>,
    normal: VecDeque<WorkItem>,
    critical: VecDeque<WorkItem>,
}

impl Bands {
    fn len(&self) -> usize {
        self.low.len() + self.normal.len() + self.critical.len()
    }

    /// Highest-priority parked item.
    fn pop_prioritized(&mut self) -> Option<WorkItem> {
        self.critical
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

#[derive(Debug, Default)]
struct SharedStats {
    ran_inline: AtomicU64,
    deferred: AtomicU64,
    frame_drained: AtomicU64,
    background_drained: AtomicU64,
}

/// Admission gate and deferred-work store for background producers.
pub struct WorkScheduler {
    controller: Arc<FrameController>,
    bands: Arc<Mutex<Bands>>,
    wake: Arc<Condvar>,
    running: Arc<AtomicBool>,
    work_this_frame: AtomicU32,
    external_signal: AtomicBool,
    stats: Arc<SharedStats>,
    background: Option<thread::JoinHandle<()>>,
}

impl WorkScheduler {
    /// Create the scheduler and spawn its background drain thread.
    pub fn start(controller: Arc<FrameController>) -> Self {
        let bands = Arc::new(Mutex::new(Bands::default()));
        let wake = Arc::new(Condvar::new());
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(SharedStats::default());

        let background = {
            let controller = Arc::clone(&controller);
            let bands = Arc::clone(&bands);
            let wake = Arc::clone(&wake);
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("vortex-deferred".into())
                .spawn(move || background_loop(&controller, &bands, &wake, &running, &stats))
                .expect("failed to spawn deferred-work thread")
        };

        Self {
            controller,
            bands,
            wake,
            running,
            work_this_frame: AtomicU32::new(0),
            external_signal: AtomicBool::new(false),
            stats,
            background: Some(background),
        }
    }

    /// Admit `work`: run it inline when the frame can afford it, otherwise
    /// park it in `priority`'s band.
    pub fn schedule(
        &self,
        priority: WorkPriority,
        work: impl FnOnce() + Send + 'static,
    ) -> ScheduleOutcome {
        if priority == WorkPriority::Critical {
            // Critical work always runs now; it still consumes frame budget.
            self.work_this_frame.fetch_add(1, Ordering::Relaxed);
            self.stats.ran_inline.fetch_add(1, Ordering::Relaxed);
            work();
            return ScheduleOutcome::RanInline;
        }

        let state = self.controller.state();
        let throttled = matches!(state, TransitionState::Grace | TransitionState::Transition)
            || self.controller.is_heavy_load()
            || self.external_signal.load(Ordering::Relaxed);
        if !throttled
            && self.work_this_frame.load(Ordering::Relaxed)
                < self.controller.max_work_items_this_frame()
        {
            self.work_this_frame.fetch_add(1, Ordering::Relaxed);
            self.stats.ran_inline.fetch_add(1, Ordering::Relaxed);
            work();
            return ScheduleOutcome::RanInline;
        }

        self.defer(priority, Box::new(work));
        ScheduleOutcome::Deferred
    }

    /// Frame boundary: reset the per-frame budget, then drain parked work
    /// in priority order until the budget or 8 ms is spent.
    pub fn process_deferred(&self) {
        self.work_this_frame.store(0, Ordering::Relaxed);
        let budget = self.controller.max_work_items_this_frame();
        let started = Instant::now();
        loop {
            if self.work_this_frame.load(Ordering::Relaxed) >= budget
                || started.elapsed() >= FRAME_DRAIN_BUDGET
            {
                return;
            }
            let Some(work) = self.bands.lock().pop_prioritized() else {
                return;
            };
            self.work_this_frame.fetch_add(1, Ordering::Relaxed);
            self.stats.frame_drained.fetch_add(1, Ordering::Relaxed);
            work();
        }
    }

    /// Signal that a higher-priority external consumer is active; while
    /// set, non-critical work is always deferred.
    pub fn set_external_signal(&self, active: bool) {
        self.external_signal.store(active, Ordering::Relaxed);
    }

    /// Number of parked items.
    pub fn pending(&self) -> usize {
        self.bands.lock().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ran_inline: self.stats.ran_inline.load(Ordering::Relaxed),
            deferred: self.stats.deferred.load(Ordering::Relaxed),
            frame_drained: self.stats.frame_drained.load(Ordering::Relaxed),
            background_drained: self.stats.background_drained.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Drop parked work and stop the background thread.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.wake.notify_all();
        if let Some(handle) = self.background.take() {
            let deadline = Instant::now() + Duration::from_secs(1);
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        let mut bands = self.bands.lock();
        bands.low.clear();
        bands.normal.clear();
        bands.critical.clear();
    }

    fn defer(&self, priority: WorkPriority, work: WorkItem) {
        let mut bands = self.bands.lock();
        match priority {
            WorkPriority::Low => bands.low.push_back(work),
            WorkPriority::Normal => bands.normal.push_back(work),
            WorkPriority::Critical => bands.critical.push_back(work),
        }
        drop(bands);
        self.stats.deferred.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
    }
}

impl Drop for WorkScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background drain: Low band only, and only while the frame loop is
/// comfortable.
fn background_loop(
    controller: &FrameController,
    bands: &Mutex<Bands>,
    wake: &Condvar,
    running: &AtomicBool,
    stats: &SharedStats,
) {
    while running.load(Ordering::Acquire) {
        let calm = matches!(
            controller.state(),
            TransitionState::Idle | TransitionState::ExtendedGrace
        ) && !controller.is_heavy_load();

        if !calm {
            thread::sleep(BACKGROUND_IDLE_WAIT);
            continue;
        }

        let work = {
            let mut guard = bands.lock();
            match guard.low.pop_front() {
                Some(work) => Some(work),
                None => {
                    let _ = wake.wait_for(&mut guard, BACKGROUND_IDLE_WAIT);
                    None
                }
            }
        };
        if let Some(work) = work {
            stats.background_drained.fetch_add(1, Ordering::Relaxed);
            work();
            thread::sleep(BACKGROUND_ITEM_PAUSE);
        }
    }
}

/// Counter snapshot for the scheduler.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    pub ran_inline: u64,
    pub deferred: u64,
    pub frame_drained: u64,
    pub background_drained: u64,
    pub pending: usize,
}

// =============================================================================
// Tests
// =============================================================================
