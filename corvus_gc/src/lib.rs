//! Corvus garbage collector.
//!
//! A non-moving, stop-the-world mark-sweep heap. The heap knows nothing about
//! stacks or compiled code: the runtime supplies roots through a
//! [`RootVisitor`] callback and decides when to collect by polling
//! [`Heap::needs_collection`] at safepoints.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                  Heap                      │
//! │  slot table (handle = index + 1)           │
//! │  ┌────────┬────────┬────────┬────────┐     │
//! │  │Instance│ Array  │  Str   │External│ ... │
//! │  └────────┴────────┴────────┴────────┘     │
//! │  free list · allocation counter · stats    │
//! └────────────────────────────────────────────┘
//!            ▲ RootVisitor::visit(&mut u64)
//!  frame maps · object pools · statics · natives
//! ```

pub mod config;
pub mod heap;
pub mod object;
pub mod stats;

pub use config::{ConfigError, GcConfig};
pub use heap::{CollectionOutcome, Heap, HeapError, RootVisitor};
pub use object::{ElementKind, ObjectRef, Traceable};
pub use stats::{GcStats, GcStatsSnapshot};
