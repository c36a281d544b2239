//! Address-range translation cache for the vortex fabric.
//!
//! Three layers, composed front to back:
//!
//! - [`HotCache`]: lock-free exact-address filter, bounded, best-effort
//! - [`IntervalMap`]: authoritative ordered map from half-open guest
//!   address ranges to artifacts, with stabbing and overlap queries
//! - [`TranslationCache`]: the public surface — hot-path lookups never
//!   block, mutations go through a writer-fair read/write lock keeping
//!   both layers consistent
//!
//! ```text
//! ┌──────────┐  miss   ┌──────────────────┐
//! │ HotCache │ ──────▶ │ RwLock<Interval  │
//! │ (dashmap)│ ◀────── │       Map>       │
//! └──────────┘ promote └──────────────────┘
//! ```

pub mod hot_cache;
pub mod interval_map;
pub mod translation_cache;

pub use hot_cache::{HotCache, HotCacheStats};
pub use interval_map::{ConflictResolver, IntervalError, IntervalMap};
pub use translation_cache::TranslationCache;
