//! Process-wide monotonic millisecond clock.
//!
//! All aging, grace-window and frame-time arithmetic in the fabric runs on a
//! 64-bit millisecond tick taken from a single process-wide epoch, so ticks
//! from different components are directly comparable and never wrap in
//! practice (2^64 ms is ~584 million years).

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call in this process.
///
/// Monotonic and thread-safe; the first caller anchors the epoch.
#[inline]
pub fn monotonic_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Microseconds elapsed since the process epoch.
///
/// Used for fine-grained timing such as per-batch compile accounting.
#[inline]
pub fn monotonic_us() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}
