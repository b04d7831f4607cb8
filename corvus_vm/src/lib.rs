//! Corvus runtime.
//!
//! Hosts compiled code: attaches mutator threads with native stacks, runs
//! the portable instruction set, services runtime traps and coordinates
//! stop-the-world collections.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── Runtime ─────────────────────────────┐
//! │  ClassRegistry   NativeRegistry   Monitors   Safepoint   strings  │
//! │        │                │             │          │                │
//! │  ┌─────▼────────────────▼─────────────▼──────────▼─────────┐     │
//! │  │  Machine (per activation) ─── traps ───► Jit / Heap      │     │
//! │  └──────────────────────────────────────────────────────────┘     │
//! │        ▲                                                          │
//! │  Thread ─ NativeContext { stack, trace records, handles }        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use corvus_vm::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::from_env()?)?;
//! runtime.define_class(&my_class)?;
//! let thread = runtime.attach_thread();
//! let main = runtime.find_method("app/Main", "run", "(I)I")?;
//! let result = runtime.invoke(&thread, &main, &[42])?;
//! ```

pub mod classes;
pub mod config;
pub mod error;
mod gc_roots;
pub mod logging;
mod machine;
pub mod monitor;
pub mod natives;
pub mod runtime;
pub mod safepoint;
pub mod thread;
mod traps;

pub use classes::{ClassLoader, ClassRegistry, MESSAGE_FIELD, bootstrap_classes, names};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{LinkError, NativeError, VmError};
pub use monitor::{MonitorError, Monitors};
pub use natives::{NativeCall, NativeFn, NativeRegistry};
pub use runtime::{Runtime, RuntimeStats};
pub use safepoint::Safepoint;
pub use thread::{StackFrame, Thread, ThreadId};
