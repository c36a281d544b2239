//! Circular frame-time history.

/// Frames of history kept for spike detection (one second at 60 fps).
pub const FRAME_HISTORY_LEN: usize = 60;

/// Fixed-size circular buffer of frame times in milliseconds.
///
/// Single-writer (the render thread); readers take a snapshot under the
/// controller's lock.
#[derive(Debug, Clone)]
pub struct FrameHistory {
    samples: [f64; FRAME_HISTORY_LEN],
    head: usize,
    len: usize,
}

impl Default for FrameHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self {
            samples: [0.0; FRAME_HISTORY_LEN],
            head: 0,
            len: 0,
        }
    }

    /// Record one frame time, evicting the oldest once full.
    pub fn push(&mut self, frame_time_ms: f64) {
        self.samples[self.head] = frame_time_ms;
        self.head = (self.head + 1) % FRAME_HISTORY_LEN;
        self.len = (self.len + 1).min(FRAME_HISTORY_LEN);
    }

    /// Frames recorded, up to the window size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing has been recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Most recent frame time, if any.
    pub fn last(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + FRAME_HISTORY_LEN - 1) % FRAME_HISTORY_LEN;
        Some(self.samples[idx])
    }

    /// Moving average over the recorded window.
    pub fn average(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.samples[..self.len].iter().sum::<f64>() / self.len as f64
    }

    /// Number of recorded frames exceeding `threshold_ms`.
    pub fn count_over(&self, threshold_ms: f64) -> usize {
        self.samples[..self.len]
            .iter()
            .filter(|&&t| t > threshold_ms)
            .count()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}
