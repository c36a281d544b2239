//! Frame pacing and background-work throttling for the vortex fabric.
//!
//! The render thread reports per-frame activity to the
//! [`FrameController`], which detects load spikes and walks a small state
//! machine (Idle → Transition+Grace → ExtendedGrace → Idle). Every
//! background producer is wrapped by the [`WorkScheduler`], which consults
//! the controller before admitting work and drains deferred items inside
//! per-frame budgets.

pub mod controller;
pub mod metrics;
pub mod scheduler;

pub use controller::{ControllerStats, FrameController, TransitionState};
pub use metrics::{FrameHistory, FRAME_HISTORY_LEN};
pub use scheduler::{ScheduleOutcome, SchedulerStats, WorkPriority, WorkScheduler};
