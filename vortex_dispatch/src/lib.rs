//! Work dispatch for the vortex fabric: aged priority queues, the
//! translation worker pool, and the speculative tracer.
//!
//! ```text
//! executor hooks ──▶ SpeculativeTracer ──▶ (own low-priority thread)
//!                          ▲    │
//!            completions   │    ▼ opportunistic compiles
//! RejitQueue ──▶ WorkerPool ────▶ TranslationCache
//! ```
//!
//! Demand requests flow through [`RejitQueue`] into the [`WorkerPool`];
//! the [`SpeculativeTracer`] watches branch and call targets recorded by
//! the executor and compiles likely-next addresses before they are asked
//! for.

pub mod queue;
pub mod tracer;
pub mod worker;

pub use queue::{Priority, QueueStats, RejitQueue, RejitRequest};
pub use tracer::{SpeculativeTracer, TracerConfig, TracerStats};
pub use worker::{WorkerPool, WorkerStats};
