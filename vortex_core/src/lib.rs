//! Core types and primitives for the vortex work-dispatch fabric.
//!
//! This crate carries everything the higher layers share:
//!
//! - **Capability contracts**: the translator / guest-memory / program-factory
//!   traits that decouple the fabric from the code generators and renderer
//! - **Configuration**: the [`FabricConfig`] options record with validation
//! - **Primitives**: monotonic millisecond clock, alignment helpers, adaptive
//!   spin backoff, a fixed-capacity SPSC ring, and a thread-local-cached
//!   object pool
//!
//! Nothing in this crate spawns threads or holds artifacts; it is the leaf
//! of the workspace dependency graph.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod align;
pub mod capability;
pub mod clock;
pub mod config;
pub mod pool;
pub mod ring;
pub mod spin;

pub use capability::{
    CompileError, CompiledUnit, ExecMode, GuestMemory, ProgramError, ProgramFactory, ProgramInfo,
    ShaderSource, ShaderStage, Translator,
};
pub use config::{ConfigError, FabricConfig};
