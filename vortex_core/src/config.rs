//! Fabric configuration parameters.
//!
//! All thresholds and window lengths are tunable for different workloads.
//! Default values match the behavior the shipped frontends expect.

/// Configuration for the work-dispatch and caching fabric.
///
/// # Example
///
/// ```ignore
/// use vortex_core::FabricConfig;
///
/// // Aggressive speculation for CPU-heavy titles
/// let config = FabricConfig {
///     spec_threshold: 2,
///     max_spec_depth: 6,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct FabricConfig {
    // =========================================================================
    // Translation Cache
    // =========================================================================
    /// Maximum entries in the exact-address hot cache.
    ///
    /// The hot cache is a probabilistic filter in front of the interval map;
    /// halving happens when it fills, so the cap bounds memory, not hit rate.
    ///
    /// Default: 4096
    pub hot_cache_cap: usize,

    // =========================================================================
    // Speculative Tracer
    // =========================================================================
    /// Soft cap on queued speculative translations.
    ///
    /// Enqueues past the cap are dropped silently; speculation is
    /// opportunistic and never owed.
    ///
    /// Default: 256
    pub queue_max_size: usize,

    /// Execution count at which a traced address starts fanning out its
    /// recorded branch targets.
    ///
    /// Default: 3
    pub spec_threshold: u32,

    /// Maximum successor-chain depth the tracer follows.
    ///
    /// Default: 4
    pub max_spec_depth: u8,

    // =========================================================================
    // Frame Pacing
    // =========================================================================
    /// Strict grace window after a load spike, in milliseconds.
    ///
    /// Default: 300
    pub grace_ms: u64,

    /// Relaxed grace window chained after the strict one, in milliseconds.
    ///
    /// Default: 150
    pub extended_grace_ms: u64,

    /// Minimum gap between scene transitions, and the hard cap on a
    /// transition episode's length, in milliseconds.
    ///
    /// Default: 1000
    pub transition_cooldown_ms: u64,

    /// Frame time above which a frame counts as a spike, in milliseconds.
    ///
    /// Default: 25.0
    pub spike_frame_ms: f64,

    /// Initial adaptive threshold for shader-build spikes (per frame).
    ///
    /// Default: 3
    pub shader_spike_base: u32,

    /// Initial adaptive threshold for texture-load spikes (per frame).
    ///
    /// Default: 5
    pub texture_spike_base: u32,

    // =========================================================================
    // Worker Pool
    // =========================================================================
    /// Number of translation worker threads. `None` derives the count from
    /// the machine's core count.
    ///
    /// Default: None (derived)
    pub worker_count: Option<usize>,

    /// Maximum requests a worker drains per wakeup.
    ///
    /// Default: 6
    pub worker_batch: usize,

    /// Bounded wait on the request queue per worker loop iteration, in
    /// milliseconds. Bounds shutdown latency.
    ///
    /// Default: 75
    pub worker_wait_ms: u64,

    // =========================================================================
    // Request Queue
    // =========================================================================
    /// Aging quantum: a request in band `p` older than
    /// `age_unit_ms * (p + 1)` is promoted one band.
    ///
    /// Default: 500
    pub age_unit_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            hot_cache_cap: 4096,
            queue_max_size: 256,
            spec_threshold: 3,
            max_spec_depth: 4,
            grace_ms: 300,
            extended_grace_ms: 150,
            transition_cooldown_ms: 1000,
            spike_frame_ms: 25.0,
            shader_spike_base: 3,
            texture_spike_base: 5,
            worker_count: None,
            worker_batch: 6,
            worker_wait_ms: 75,
            age_unit_ms: 500,
        }
    }
}

impl FabricConfig {
    /// Configuration favoring frame-time stability over background
    /// throughput: longer grace windows, shallower speculation.
    pub fn low_latency() -> Self {
        Self {
            grace_ms: 450,
            extended_grace_ms: 250,
            max_spec_depth: 2,
            worker_batch: 4,
            ..Default::default()
        }
    }

    /// Small caps and eager thresholds for fast unit tests.
    pub fn for_testing() -> Self {
        Self {
            hot_cache_cap: 64,
            queue_max_size: 16,
            spec_threshold: 2,
            worker_count: Some(2),
            worker_wait_ms: 10,
            age_unit_ms: 50,
            ..Default::default()
        }
    }

    /// Worker count: configured value, or derived from the core count as
    /// `clamp(ceil((cores - 2) / 2 * 1.5), 2, max(8, cores - 2))`.
    pub fn resolved_worker_count(&self) -> usize {
        if let Some(count) = self.worker_count {
            return count.max(1);
        }
        let cores = available_cores();
        let spare = cores.saturating_sub(2);
        let derived = (spare as f64 / 2.0 * 1.5).ceil() as usize;
        derived.clamp(2, 8.max(spare))
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hot_cache_cap < 2 || self.hot_cache_cap % 2 != 0 {
            return Err(ConfigError::InvalidHotCacheCap);
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::InvalidQueueCap);
        }
        if self.spec_threshold == 0 {
            return Err(ConfigError::InvalidSpecThreshold);
        }
        if self.max_spec_depth == 0 {
            return Err(ConfigError::InvalidSpecDepth);
        }
        if !(self.spike_frame_ms > 0.0) {
            return Err(ConfigError::InvalidSpikeThreshold);
        }
        if self.age_unit_ms == 0 {
            return Err(ConfigError::InvalidAgeUnit);
        }
        if self.worker_batch == 0 {
            return Err(ConfigError::InvalidWorkerBatch);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Hot cache capacity must be even and at least 2.
    InvalidHotCacheCap,
    /// Speculative queue cap must be at least 1.
    InvalidQueueCap,
    /// Speculation threshold must be at least 1.
    InvalidSpecThreshold,
    /// Speculation depth must be at least 1.
    InvalidSpecDepth,
    /// Frame spike threshold must be positive.
    InvalidSpikeThreshold,
    /// Aging quantum must be at least 1 ms.
    InvalidAgeUnit,
    /// Worker batch size must be at least 1.
    InvalidWorkerBatch,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidHotCacheCap => {
                write!(f, "hot cache capacity must be even and at least 2")
            }
            ConfigError::InvalidQueueCap => {
                write!(f, "speculative queue capacity must be at least 1")
            }
            ConfigError::InvalidSpecThreshold => {
                write!(f, "speculation threshold must be at least 1")
            }
            ConfigError::InvalidSpecDepth => write!(f, "speculation depth must be at least 1"),
            ConfigError::InvalidSpikeThreshold => {
                write!(f, "frame spike threshold must be positive")
            }
            ConfigError::InvalidAgeUnit => write!(f, "aging quantum must be at least 1 ms"),
            ConfigError::InvalidWorkerBatch => write!(f, "worker batch size must be at least 1"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Get the number of available CPUs.
fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
