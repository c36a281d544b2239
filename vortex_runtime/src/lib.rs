//! Composition root for the vortex work-dispatch and caching fabric.
//!
//! A [`Fabric`] owns every subsystem and wires them together:
//!
//! ```text
//! ┌──────────────────────────── Fabric ────────────────────────────┐
//! │  ┌──────────────────┐   ┌────────────┐   ┌──────────────────┐  │
//! │  │ TranslationCache │◀──│ WorkerPool │◀──│    RejitQueue    │  │
//! │  └──────────────────┘   └─────┬──────┘   └──────────────────┘  │
//! │            ▲                  │ completions                    │
//! │            │            ┌─────▼──────────┐                     │
//! │            └────────────│ Speculative    │◀── executor hooks   │
//! │                         │ Tracer         │                     │
//! │                         └────────────────┘                     │
//! │  ┌─────────────────┐   ┌───────────────┐                       │
//! │  │ FrameController │◀──│ WorkScheduler │◀── background work    │
//! │  └─────────────────┘   └───────────────┘                       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components never reference each other directly; the fabric hands out
//! `Arc` handles, so there are no reference cycles to break.

pub mod fabric;
pub mod prewarm;
pub mod shader;

pub use fabric::{Fabric, FabricStats};
pub use shader::{ShaderPipeline, ShaderPipelineStats};

pub use vortex_cache::TranslationCache;
pub use vortex_core::capability::{
    CompileError, CompiledUnit, ExecMode, GuestMemory, ProgramError, ProgramFactory, ProgramInfo,
    ShaderSource, ShaderStage, Translator,
};
pub use vortex_core::config::{ConfigError, FabricConfig};
pub use vortex_dispatch::{Priority, RejitQueue};
pub use vortex_pacing::{FrameController, ScheduleOutcome, TransitionState, WorkPriority};
