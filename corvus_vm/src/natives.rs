//! Native method registry.
//!
//! Natives are registered under a symbol and bound to methods lazily, the
//! first time a method is invoked. A method `Class.name(descriptor)` looks
//! for the long symbol `Class.name(descriptor)` first and falls back to the
//! short symbol `Class.name`. A method with no matching symbol raises
//! `lang/UnsatisfiedLinkError` in its caller.
//!
//! A native receives its argument words (receiver first) and a
//! [`NativeCall`] giving access to the runtime and the calling thread.

use crate::classes::{MESSAGE_FIELD, names};
use crate::error::{NativeError, VmError};
use crate::runtime::Runtime;
use crate::thread::{ContextGuard, StackFrame};
use corvus_gc::HeapError;
use corvus_jit::{Continuation, ContinuationError, Method, MethodId};
use dashmap::DashMap;
use parking_lot::MutexGuard;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;

/// A native implementation.
pub type NativeFn =
    Arc<dyn Fn(&mut NativeCall<'_, '_>, &[u64]) -> Result<u64, NativeError> + Send + Sync>;

/// Symbol table plus per-method bindings.
pub struct NativeRegistry {
    symbols: DashMap<Arc<str>, NativeFn, FxBuildHasher>,
    bound: DashMap<MethodId, NativeFn, FxBuildHasher>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self {
            symbols: DashMap::with_hasher(FxBuildHasher),
            bound: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Registry with the built-in natives of the bootstrap classes.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtins(&registry);
        registry
    }

    /// Register `f` under `symbol`, replacing any previous definition.
    /// Methods already bound keep their implementation.
    pub fn register<F>(&self, symbol: impl Into<Arc<str>>, f: F)
    where
        F: Fn(&mut NativeCall<'_, '_>, &[u64]) -> Result<u64, NativeError> + Send + Sync + 'static,
    {
        self.symbols.insert(symbol.into(), Arc::new(f));
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains_key(symbol)
    }

    /// Implementation bound to `method`, binding it on first use.
    pub fn resolve(&self, method: &Method) -> Option<NativeFn> {
        if let Some(f) = self.bound.get(&method.id()) {
            return Some(f.value().clone());
        }
        let long = format!("{}.{}{}", method.class_name(), method.name(), method.descriptor());
        let short = format!("{}.{}", method.class_name(), method.name());
        let f = self
            .symbols
            .get(long.as_str())
            .or_else(|| self.symbols.get(short.as_str()))
            .map(|f| f.value().clone())?;
        tracing::trace!(method = %method, "native bound");
        Some(self.bound.entry(method.id()).or_insert(f).value().clone())
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("symbols", &self.symbols.len())
            .field("bound", &self.bound.len())
            .finish()
    }
}

// =============================================================================
// NativeCall
// =============================================================================

/// What a running native can do with its thread.
pub struct NativeCall<'a, 'g> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) ctx: &'a mut ContextGuard<'g>,
    pub(crate) method: &'a Arc<Method>,
}

impl NativeCall<'_, '_> {
    #[inline]
    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    /// The native method being executed.
    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        self.method
    }

    /// Compiled frames of the calling thread, innermost first.
    pub fn stack_trace(&self) -> Vec<StackFrame> {
        self.ctx.stack_trace(self.runtime.jit())
    }

    /// Call `method` on this thread. An uncaught exception comes back as
    /// [`VmError::Uncaught`]; return [`NativeError::Throw`] to rethrow it.
    pub fn invoke(&mut self, method: &Arc<Method>, args: &[u64]) -> Result<u64, VmError> {
        self.runtime.invoke_in(self.ctx, method, args)
    }

    /// Keep `object` alive until the native returns.
    pub fn root(&mut self, object: u64) -> u64 {
        if object != 0 {
            self.ctx.handles.push(object);
        }
        object
    }

    /// Allocate a rooted string.
    pub fn new_string(&mut self, text: &str) -> u64 {
        let handle = self.runtime.alloc_string(text);
        self.root(handle)
    }

    pub fn string(&self, object: u64) -> Result<Arc<str>, HeapError> {
        self.runtime.heap().string(object)
    }

    /// Run a full collection now.
    pub fn collect_garbage(&mut self) {
        self.runtime.collect_from(self.ctx);
    }

    /// Run `f` with the thread idle, so collections may proceed while it
    /// blocks. `f` must not touch the heap.
    pub fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        MutexGuard::unlocked(self.ctx, f)
    }

    /// Capture the compiled frames of the calling trace.
    pub fn capture(&mut self) -> Result<Arc<Continuation>, ContinuationError> {
        let (ip, fp) = self
            .ctx
            .traces
            .last()
            .and_then(|record| record.suspended.as_ref())
            .map(|start| (start.ip, start.fp))
            .ok_or(ContinuationError::NoFrames)?;
        let continuation = Continuation::capture(self.runtime.jit(), &self.ctx.stack, ip, fp)?;
        self.runtime.track_continuation(&continuation);
        self.ctx.captured = Some(continuation.clone());
        Ok(continuation)
    }
}

// =============================================================================
// Built-ins
// =============================================================================

fn register_builtins(registry: &NativeRegistry) {
    registry.register(format!("{}.stackDepth()I", names::RUNTIME), |call, _| {
        Ok(call.stack_trace().len() as u64)
    });

    registry.register(format!("{}.gc()V", names::RUNTIME), |call, _| {
        call.collect_garbage();
        Ok(0)
    });

    // The first return is 0; a resume returns the value it was given.
    registry.register(format!("{}.capture()I", names::CONTINUATIONS), |call, _| {
        call.capture()
            .map_err(|err| NativeError::raise(names::INTERNAL_ERROR, err.to_string()))?;
        Ok(0)
    });

    registry.register(format!("{}.getMessage", names::THROWABLE_CLASS), |call, args| {
        let receiver = args.first().copied().unwrap_or(0);
        call.runtime()
            .heap()
            .read_field(receiver, MESSAGE_FIELD)
            .map_err(|err| NativeError::raise(names::INTERNAL_ERROR, err.to_string()))
    });
}
