//! Scene-transition detection and frame-pacing state machine.
//!
//! The render thread is the single writer: it reports shader builds,
//! texture uploads and frame boundaries. `end_frame` is the only place
//! state changes. Worker threads read throttling decisions through
//! atomics that are published after all bookkeeping, so a reader always
//! sees a consistent (state, thresholds) snapshot.
//!
//! # State machine
//!
//! ```text
//!        spike                    grace up               ext-grace up
//! Idle ───────▶ Transition+Grace ──────────▶ ExtendedGrace ──────────▶ Idle
//!                    │                              ▲
//!                    │ 20 light frames or 1s        │
//!                    └──────────────────────────────┘
//! ```
//!
//! `Grace` and `ExtendedGrace` are the first, strictest phases of a
//! transition episode; the reported state is whichever window is live.

use crate::metrics::FrameHistory;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use vortex_core::clock::monotonic_ms;
use vortex_core::config::FabricConfig;

/// Consecutive light frames that end a transition early.
const LIGHT_FRAMES_TO_EXIT: u32 = 20;

/// Spiky frames in the history window that count as a heavy pattern.
const HEAVY_PATTERN_FRAMES: usize = 3;

/// Exponential moving-average rate for the adaptive spike thresholds.
const THRESHOLD_EMA_RATE: f64 = 0.01;

/// Weight of the observed per-frame activity in the threshold target.
const OBSERVED_WEIGHT: f64 = 0.8;

// =============================================================================
// State
// =============================================================================

/// Current throttling phase. Exactly one is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransitionState {
    /// Steady state; background work runs freely.
    Idle = 0,
    /// Transition episode past its grace windows.
    Transition = 1,
    /// Strict window right after a spike.
    Grace = 2,
    /// Relaxed window chained after grace, and after a transition ends.
    ExtendedGrace = 3,
}

impl TransitionState {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TransitionState::Transition,
            2 => TransitionState::Grace,
            3 => TransitionState::ExtendedGrace,
            _ => TransitionState::Idle,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug, Clone)]
struct PacingConfig {
    grace_ms: u64,
    extended_grace_ms: u64,
    cooldown_ms: u64,
    spike_frame_ms: f64,
    shader_spike_base: f64,
    texture_spike_base: f64,
}

#[derive(Debug)]
struct Inner {
    history: FrameHistory,
    last_frame_at: Option<u64>,
    in_transition: bool,
    transition_started_at: u64,
    transition_frames: u32,
    consecutive_light: u32,
    consecutive_heavy: u32,
    grace_ends_at: Option<u64>,
    ext_grace_ends_at: Option<u64>,
    last_transition_ended_at: Option<u64>,
    shader_threshold: f64,
    texture_threshold: f64,
}

/// Frame-activity observer and throttling policy surface.
pub struct FrameController {
    inner: Mutex<Inner>,
    config: PacingConfig,

    // Published snapshot, written by end_frame (state last).
    state: AtomicU8,
    heavy: AtomicBool,
    shader_threshold_bits: AtomicU64,
    texture_threshold_bits: AtomicU64,
    last_frame_time_bits: AtomicU64,

    // Per-frame activity, reset at each frame boundary.
    shaders: AtomicU32,
    textures: AtomicU32,
    buffer_uploads: AtomicU32,

    // Lifetime counters.
    frames: AtomicU64,
    transitions: AtomicU64,
    total_shaders: AtomicU64,
    total_textures: AtomicU64,
    total_buffer_uploads: AtomicU64,
}

impl FrameController {
    /// Create a controller with the pacing knobs from `config`.
    pub fn new(config: &FabricConfig) -> Self {
        let pacing = PacingConfig {
            grace_ms: config.grace_ms,
            extended_grace_ms: config.extended_grace_ms,
            cooldown_ms: config.transition_cooldown_ms,
            spike_frame_ms: config.spike_frame_ms,
            shader_spike_base: f64::from(config.shader_spike_base),
            texture_spike_base: f64::from(config.texture_spike_base),
        };
        let shader_threshold = pacing.shader_spike_base;
        let texture_threshold = pacing.texture_spike_base;
        Self {
            inner: Mutex::new(Inner {
                history: FrameHistory::new(),
                last_frame_at: None,
                in_transition: false,
                transition_started_at: 0,
                transition_frames: 0,
                consecutive_light: 0,
                consecutive_heavy: 0,
                grace_ends_at: None,
                ext_grace_ends_at: None,
                last_transition_ended_at: None,
                shader_threshold,
                texture_threshold,
            }),
            config: pacing,
            state: AtomicU8::new(TransitionState::Idle as u8),
            heavy: AtomicBool::new(false),
            shader_threshold_bits: AtomicU64::new(shader_threshold.to_bits()),
            texture_threshold_bits: AtomicU64::new(texture_threshold.to_bits()),
            last_frame_time_bits: AtomicU64::new(0f64.to_bits()),
            shaders: AtomicU32::new(0),
            textures: AtomicU32::new(0),
            buffer_uploads: AtomicU32::new(0),
            frames: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
            total_shaders: AtomicU64::new(0),
            total_textures: AtomicU64::new(0),
            total_buffer_uploads: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Render-thread inputs
    // =========================================================================

    /// A shader was compiled this frame.
    #[inline]
    pub fn record_shader(&self) {
        self.shaders.fetch_add(1, Ordering::Relaxed);
        self.total_shaders.fetch_add(1, Ordering::Relaxed);
    }

    /// A texture was uploaded this frame.
    #[inline]
    pub fn record_texture(&self) {
        self.textures.fetch_add(1, Ordering::Relaxed);
        self.total_textures.fetch_add(1, Ordering::Relaxed);
    }

    /// A buffer upload happened this frame.
    #[inline]
    pub fn record_buffer_upload(&self) {
        self.buffer_uploads.fetch_add(1, Ordering::Relaxed);
        self.total_buffer_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Frame boundary; the only state-transition point.
    pub fn end_frame(&self) {
        self.end_frame_at(monotonic_ms());
    }

    /// [`end_frame`](Self::end_frame) at an explicit tick. Every predicate
    /// is a pure function of counters, history and the tick, so feeding
    /// simulated timelines replays deterministically.
    pub fn end_frame_at(&self, now_ms: u64) {
        let shaders = self.shaders.swap(0, Ordering::AcqRel);
        let textures = self.textures.swap(0, Ordering::AcqRel);
        self.buffer_uploads.store(0, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        let config = &self.config;

        let frame_time = match inner.last_frame_at {
            Some(prev) => now_ms.saturating_sub(prev) as f64,
            None => 0.0,
        };
        inner.last_frame_at = Some(now_ms);
        inner.history.push(frame_time);

        if let Some(end) = inner.ext_grace_ends_at {
            if now_ms >= end {
                inner.ext_grace_ends_at = None;
            }
        }
        if let Some(end) = inner.grace_ends_at {
            if now_ms >= end {
                inner.grace_ends_at = None;
                inner.ext_grace_ends_at = Some(now_ms + config.extended_grace_ms);
            }
        }

        if inner.in_transition {
            inner.transition_frames += 1;
            let light = shaders < 2 && textures < 3 && frame_time < config.spike_frame_ms;
            if light {
                inner.consecutive_light += 1;
                inner.consecutive_heavy = 0;
            } else {
                inner.consecutive_heavy += 1;
                inner.consecutive_light = 0;
            }
            let elapsed = now_ms.saturating_sub(inner.transition_started_at);
            if elapsed >= config.cooldown_ms || inner.consecutive_light >= LIGHT_FRAMES_TO_EXIT {
                inner.in_transition = false;
                inner.grace_ends_at = None;
                inner.ext_grace_ends_at = Some(now_ms + config.extended_grace_ms);
                inner.last_transition_ended_at = Some(now_ms);
                log::debug!(
                    "scene transition ended after {} frames ({} ms, {} heavy)",
                    inner.transition_frames,
                    elapsed,
                    inner.consecutive_heavy
                );
            }
        } else {
            let cooled = inner
                .last_transition_ended_at
                .map_or(true, |ended| now_ms.saturating_sub(ended) > config.cooldown_ms);
            if cooled {
                let shader_spike = f64::from(shaders) >= inner.shader_threshold;
                let texture_spike = f64::from(textures) >= inner.texture_threshold;
                let combined = shaders >= 2 && textures >= 3;
                let frame_time_spike =
                    frame_time > config.spike_frame_ms && (shaders > 0 || textures > 2);
                let heavy_pattern =
                    inner.history.count_over(config.spike_frame_ms) >= HEAVY_PATTERN_FRAMES;
                if shader_spike || texture_spike || combined || frame_time_spike || heavy_pattern {
                    inner.in_transition = true;
                    inner.transition_started_at = now_ms;
                    inner.transition_frames = 0;
                    inner.consecutive_light = 0;
                    inner.consecutive_heavy = 0;
                    inner.grace_ends_at = Some(now_ms + config.grace_ms);
                    inner.ext_grace_ends_at = None;
                    self.transitions.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "scene transition started (shaders={shaders}, textures={textures}, \
                         frame_time={frame_time:.1} ms)"
                    );
                }
            }
        }

        // Adaptive thresholds chase the observed activity, floored at the
        // configured base.
        let shader_target = config.shader_spike_base.max(OBSERVED_WEIGHT * f64::from(shaders));
        inner.shader_threshold += THRESHOLD_EMA_RATE * (shader_target - inner.shader_threshold);
        let texture_target = config
            .texture_spike_base
            .max(OBSERVED_WEIGHT * f64::from(textures));
        inner.texture_threshold += THRESHOLD_EMA_RATE * (texture_target - inner.texture_threshold);

        let heavy = inner.history.count_over(config.spike_frame_ms) >= HEAVY_PATTERN_FRAMES;
        let state = if inner.grace_ends_at.is_some() {
            TransitionState::Grace
        } else if inner.ext_grace_ends_at.is_some() {
            TransitionState::ExtendedGrace
        } else if inner.in_transition {
            TransitionState::Transition
        } else {
            TransitionState::Idle
        };

        self.shader_threshold_bits
            .store(inner.shader_threshold.to_bits(), Ordering::Relaxed);
        self.texture_threshold_bits
            .store(inner.texture_threshold.to_bits(), Ordering::Relaxed);
        self.last_frame_time_bits
            .store(frame_time.to_bits(), Ordering::Relaxed);
        self.heavy.store(heavy, Ordering::Relaxed);
        drop(inner);
        // Published last: readers keying on the state see the snapshot
        // written above.
        self.state.store(state as u8, Ordering::Release);
    }

    /// Forget everything (ROM switch). Thresholds return to their bases.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.last_frame_at = None;
        inner.in_transition = false;
        inner.transition_frames = 0;
        inner.consecutive_light = 0;
        inner.consecutive_heavy = 0;
        inner.grace_ends_at = None;
        inner.ext_grace_ends_at = None;
        inner.last_transition_ended_at = None;
        inner.shader_threshold = self.config.shader_spike_base;
        inner.texture_threshold = self.config.texture_spike_base;
        drop(inner);
        self.shaders.store(0, Ordering::Relaxed);
        self.textures.store(0, Ordering::Relaxed);
        self.buffer_uploads.store(0, Ordering::Relaxed);
        self.heavy.store(false, Ordering::Relaxed);
        self.state
            .store(TransitionState::Idle as u8, Ordering::Release);
    }

    // =========================================================================
    // Policy queries
    // =========================================================================

    /// Current throttling phase.
    #[inline]
    pub fn state(&self) -> TransitionState {
        TransitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether shader builds should be pushed off the frame path.
    #[inline]
    pub fn should_defer_shader_build(&self) -> bool {
        matches!(
            self.state(),
            TransitionState::Grace | TransitionState::Transition
        )
    }

    /// Shader-build budget for the current frame.
    pub fn max_shaders_this_frame(&self) -> u32 {
        match self.state() {
            TransitionState::Idle => 8,
            TransitionState::Transition => 2,
            TransitionState::Grace => 1,
            TransitionState::ExtendedGrace => 2,
        }
    }

    /// Texture-upload budget for the current frame.
    pub fn max_textures_this_frame(&self) -> u32 {
        match self.state() {
            TransitionState::Idle => 16,
            TransitionState::Transition => 4,
            TransitionState::Grace => 2,
            TransitionState::ExtendedGrace => 3,
        }
    }

    /// Background work-item budget for the current frame.
    pub fn max_work_items_this_frame(&self) -> u32 {
        match self.state() {
            TransitionState::Idle => 12,
            TransitionState::Transition => 4,
            TransitionState::Grace => 2,
            TransitionState::ExtendedGrace => 6,
        }
    }

    /// Scale factor for synchronization timeouts; near zero while the
    /// pipeline needs every millisecond.
    pub fn sync_timeout_scale(&self) -> f64 {
        match self.state() {
            TransitionState::Idle => 1.0,
            TransitionState::Transition => 0.3,
            TransitionState::Grace => 0.05,
            TransitionState::ExtendedGrace => 0.1,
        }
    }

    /// Frames the presenter may skip right now (0 or 1).
    pub fn recommended_frame_skip(&self) -> u32 {
        let over_spike =
            f64::from_bits(self.last_frame_time_bits.load(Ordering::Relaxed)) > self.config.spike_frame_ms;
        if self.state() == TransitionState::Grace && over_spike {
            1
        } else {
            0
        }
    }

    /// Whether the recent history shows a sustained heavy pattern.
    #[inline]
    pub fn is_heavy_load(&self) -> bool {
        self.heavy.load(Ordering::Relaxed)
    }

    /// Shader builds recorded in the frame in progress.
    pub fn shaders_this_frame(&self) -> u32 {
        self.shaders.load(Ordering::Relaxed)
    }

    /// Texture uploads recorded in the frame in progress.
    pub fn textures_this_frame(&self) -> u32 {
        self.textures.load(Ordering::Relaxed)
    }

    /// Current adaptive shader spike threshold.
    pub fn shader_threshold(&self) -> f64 {
        f64::from_bits(self.shader_threshold_bits.load(Ordering::Relaxed))
    }

    /// Current adaptive texture spike threshold.
    pub fn texture_threshold(&self) -> f64 {
        f64::from_bits(self.texture_threshold_bits.load(Ordering::Relaxed))
    }

    /// Moving average over the frame-time window.
    pub fn average_frame_time(&self) -> f64 {
        self.inner.lock().history.average()
    }

    /// Lifetime counter snapshot.
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            frames: self.frames.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            total_shaders: self.total_shaders.load(Ordering::Relaxed),
            total_textures: self.total_textures.load(Ordering::Relaxed),
            total_buffer_uploads: self.total_buffer_uploads.load(Ordering::Relaxed),
        }
    }
}

/// Lifetime counters for the controller.
#[derive(Debug, Default, Clone)]
pub struct ControllerStats {
    pub frames: u64,
    pub transitions: u64,
    pub total_shaders: u64,
    pub total_textures: u64,
    pub total_buffer_uploads: u64,
}

// =============================================================================
// Tests
// =============================================================================
