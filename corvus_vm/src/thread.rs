//! Mutator threads and their native stacks.
//!
//! Every attached thread owns a [`NativeContext`]: a word-addressed stack
//! that grows downward, the trace records of the machine activations
//! currently on it, native-local roots and the last captured continuation.
//!
//! ```text
//!  top ─►┌──────────────────────┐
//!        │ trace 0 (invoke)     │  base = top
//!        │   compiled frames    │
//!        │   native call args   │  ◄─ suspended at InvokeNative
//!        ├──────────────────────┤
//!        │ trace 1 (callback)   │  base = trace 0's sp
//!        │   compiled frames    │
//!        ├──────────────────────┤
//!        │         ...          │
//! limit ─┤ reserve              │
//!      0 └──────────────────────┘
//! ```
//!
//! The context sits behind a mutex that its thread holds for as long as it
//! runs code. Releasing the lock is what makes a thread idle: a collector on
//! another thread can then take it and scan the stack.

use corvus_jit::unwind::FrameWalker;
use corvus_jit::{Continuation, Jit, Method, StackMemory};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Runtime thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

// =============================================================================
// Native stack
// =============================================================================

/// One thread's stack. Addresses are word indices.
pub struct NativeStack {
    words: Box<[u64]>,
    reserve: u64,
}

impl NativeStack {
    pub fn new(words: usize, reserve: usize) -> Self {
        Self {
            words: vec![0; words].into_boxed_slice(),
            reserve: reserve as u64,
        }
    }

    /// One past the highest address.
    #[inline]
    pub fn top(&self) -> u64 {
        self.words.len() as u64
    }

    fn fatal(&self, address: u64) -> ! {
        tracing::error!(
            address = format_args!("{address:#x}"),
            len = self.words.len(),
            "stack access out of range"
        );
        panic!("native stack access at {address:#x} is out of range");
    }
}

impl StackMemory for NativeStack {
    #[inline]
    fn read(&self, address: u64) -> u64 {
        match self.words.get(address as usize) {
            Some(&word) => word,
            None => self.fatal(address),
        }
    }

    #[inline]
    fn write(&mut self, address: u64, value: u64) {
        match self.words.get_mut(address as usize) {
            Some(word) => *word = value,
            None => self.fatal(address),
        }
    }

    #[inline]
    fn limit(&self) -> u64 {
        self.reserve
    }
}

// =============================================================================
// Context
// =============================================================================

/// Arguments of a call stopped in a thunk. They are no longer covered by
/// the caller's frame map, so the callee's signature says which words are
/// references.
#[derive(Debug, Clone)]
pub struct PendingArgs {
    /// Address of the last argument; argument 0 is highest.
    pub first: u64,
    pub method: Arc<Method>,
}

impl PendingArgs {
    /// Stack addresses of the reference arguments.
    pub fn reference_slots(&self) -> impl Iterator<Item = u64> + '_ {
        let argc = u64::from(self.method.param_footprint());
        self.method
            .param_kinds()
            .enumerate()
            .filter(|(_, kind)| kind.is_reference())
            .map(move |(i, _)| self.first + (argc - 1 - i as u64))
    }
}

/// Where a stopped activation can be walked from.
#[derive(Debug, Clone)]
pub struct WalkStart {
    /// Return address into the innermost compiled frame.
    pub ip: u64,
    pub fp: u64,
    /// Lowest word in use.
    pub sp: u64,
    pub pending: Option<PendingArgs>,
}

/// One machine activation.
#[derive(Debug, Clone)]
pub(crate) struct TraceRecord {
    /// Highest address of the activation, exclusive.
    pub base: u64,
    /// Set whenever the activation is stopped in the runtime.
    pub suspended: Option<WalkStart>,
}

/// A `(method, bytecode offset)` pair reported by a stack walk.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub method: Arc<Method>,
    /// `None` while the method is still in its prologue.
    pub bytecode_offset: Option<u32>,
}

/// Per-thread execution state.
pub struct NativeContext {
    id: ThreadId,
    pub(crate) stack: NativeStack,
    pub(crate) traces: Vec<TraceRecord>,
    /// References held by running natives.
    pub(crate) handles: Vec<u64>,
    pub(crate) captured: Option<Arc<Continuation>>,
}

impl NativeContext {
    pub fn new(id: ThreadId, stack: NativeStack) -> Self {
        Self {
            id,
            stack,
            traces: Vec::new(),
            handles: Vec::new(),
            captured: None,
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn stack(&self) -> &NativeStack {
        &self.stack
    }

    /// Number of nested machine activations.
    #[inline]
    pub fn trace_depth(&self) -> usize {
        self.traces.len()
    }

    /// Lowest address in use, where the next activation starts.
    pub(crate) fn next_base(&self) -> u64 {
        match self.traces.last() {
            None => self.stack.top(),
            Some(record) => record.suspended.as_ref().map_or(record.base, |s| s.sp),
        }
    }

    pub(crate) fn suspend(&mut self, at: WalkStart) {
        if let Some(record) = self.traces.last_mut() {
            record.suspended = Some(at);
        }
    }

    /// Compiled frames of every activation, innermost first.
    pub fn stack_trace(&self, jit: &Jit) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        for record in self.traces.iter().rev() {
            let Some(start) = &record.suspended else {
                continue;
            };
            frames.extend(
                FrameWalker::new(jit, &self.stack, start.ip, start.fp).map(|frame| StackFrame {
                    bytecode_offset: frame.bytecode_offset(),
                    method: frame.method().clone(),
                }),
            );
        }
        frames
    }

    /// Continuation captured most recently on this thread.
    pub fn take_continuation(&mut self) -> Option<Arc<Continuation>> {
        self.captured.take()
    }
}

pub(crate) type ContextGuard<'a> = MutexGuard<'a, NativeContext>;

// =============================================================================
// Thread registry
// =============================================================================

pub(crate) struct ThreadShared {
    id: ThreadId,
    pub(crate) context: Mutex<NativeContext>,
}

impl ThreadShared {
    #[inline]
    pub(crate) fn id(&self) -> ThreadId {
        self.id
    }
}

/// Threads attached to one runtime.
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadShared>>>,
    next_id: AtomicU64,
}

impl ThreadRegistry {
    pub(crate) fn attach(self: &Arc<Self>, stack_words: usize, reserve: usize) -> Thread {
        let id = ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(ThreadShared {
            id,
            context: Mutex::new(NativeContext::new(id, NativeStack::new(stack_words, reserve))),
        });
        self.threads.lock().push(shared.clone());
        tracing::debug!(thread = id.0, stack_words, "thread attached");
        Thread {
            shared,
            registry: Arc::downgrade(self),
        }
    }

    fn detach(&self, id: ThreadId) {
        self.threads.lock().retain(|t| t.id != id);
        tracing::debug!(thread = id.0, "thread detached");
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ThreadShared>> {
        self.threads.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.lock().len()
    }
}

/// Handle of an attached mutator thread. Dropping it detaches the thread.
pub struct Thread {
    shared: Arc<ThreadShared>,
    registry: Weak<ThreadRegistry>,
}

impl Thread {
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.shared.id
    }

    /// Continuation captured most recently on this thread.
    pub fn take_continuation(&self) -> Option<Arc<Continuation>> {
        self.shared.context.lock().take_continuation()
    }

    pub(crate) fn shared(&self) -> &Arc<ThreadShared> {
        &self.shared
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<ThreadRegistry>) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Arc::as_ptr(registry))
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.shared.id);
        }
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread").field("id", &self.shared.id.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_reads_back_writes() {
        let mut stack = NativeStack::new(64, 8);
        stack.write(63, 7);
        stack.write(8, 9);
        assert_eq!(stack.read(63), 7);
        assert_eq!(stack.read(8), 9);
        assert_eq!(stack.top(), 64);
        assert_eq!(stack.limit(), 8);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_access_is_fatal() {
        let stack = NativeStack::new(16, 2);
        stack.read(16);
    }

    #[test]
    fn test_nested_activation_starts_below_suspended_one() {
        let mut ctx = NativeContext::new(ThreadId(0), NativeStack::new(64, 4));
        assert_eq!(ctx.next_base(), 64);
        ctx.traces.push(TraceRecord {
            base: 64,
            suspended: None,
        });
        assert_eq!(ctx.next_base(), 64);
        ctx.suspend(WalkStart {
            ip: 0,
            fp: 50,
            sp: 40,
            pending: None,
        });
        assert_eq!(ctx.next_base(), 40);
    }

    #[test]
    fn test_dropping_handle_detaches() {
        let registry = Arc::new(ThreadRegistry::default());
        let a = registry.attach(4096, 64);
        let b = registry.attach(4096, 64);
        assert_ne!(a.id(), b.id());
        assert!(a.belongs_to(&registry));
        assert_eq!(registry.len(), 2);
        drop(a);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].id(), b.id());
    }
}
