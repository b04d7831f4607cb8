//! Adaptive method compiler for Corvus.
//!
//! Methods start out pointing at a compile thunk and are translated on
//! their first call:
//! - Single-pass driver over bytecode with an explicit worklist
//! - Event log replayed into exact per-call-site frame maps
//! - Thunks for lazy compilation, virtual dispatch and native calls
//! - Call-site table and method tree for patching and stack walks
//! - Exception unwinding and first-class continuations
//!
//! Code is emitted through the narrow [`backend::Assembler`] interface. The
//! shipped target is the portable instruction set executed by the runtime.

pub mod backend;
pub mod bitmap;
pub mod call_table;
pub mod code;
pub mod compiler;
pub mod continuation;
pub mod error;
pub mod frame;
pub mod method_tree;
pub mod model;
pub mod stats;
pub mod thunks;
pub mod unwind;

pub use bitmap::FrameBitmap;
pub use call_table::{CallFlags, CallNode, CallSiteTable};
pub use code::{CodeBlock, CodeSpace, CompiledCode};
pub use compiler::{Jit, JitOptions};
pub use continuation::Continuation;
pub use error::{AssemblerError, CompileError, ContinuationError, ResolveError};
pub use frame::FrameLayout;
pub use method_tree::MethodTree;
pub use model::{
    Class, ClassId, ClassParts, FieldInfo, InvokeKind, Method, MethodId, MethodParts,
    ResolvedField, Resolver, VtableEntry,
};
pub use stats::{JitStats, JitStatsSnapshot};
pub use thunks::{ThunkKind, Thunks};
pub use unwind::{FrameState, FrameWalker, JitFrame, StackMemory, UnwindHooks, UnwindTarget};
