//! The runtime: one heap, one compiler, one class registry, many threads.
//!
//! ```text
//!  embedder ── invoke ──► compile entry ─► push args + return thunk
//!                                          │
//!                                          ▼
//!                           Machine::run (trace record pushed)
//!                              │        ▲
//!                 traps ───────┘        └─ natives re-enter via invoke_in
//!                   │
//!                   ├─ lazy compile + call-site / vtable patch
//!                   ├─ allocation polls ─► collect_from ─► stop the world
//!                   └─ exceptions ─► unwind ─► handler | boundary
//! ```
//!
//! Lock order: thread contexts, then the link lock, then interned strings,
//! then the heap.

use crate::classes::{ClassLoader, ClassRegistry, MESSAGE_FIELD, bootstrap_classes, names};
use crate::config::RuntimeConfig;
use crate::error::{LinkError, NativeError, VmError};
use crate::gc_roots;
use crate::machine::{Exit, Machine};
use crate::monitor::Monitors;
use crate::natives::{NativeCall, NativeRegistry};
use crate::safepoint::Safepoint;
use crate::thread::{ContextGuard, NativeContext, Thread, ThreadRegistry, TraceRecord};
use corvus_bytecode::{ClassDef, FieldRef, MethodRef, TypeKind};
use corvus_gc::{GcStatsSnapshot, Heap};
use corvus_jit::backend::Reg;
use corvus_jit::{
    Class, ClassId, Continuation, FrameState, InvokeKind, Jit, JitStatsSnapshot, Method,
    ResolveError, ResolvedField, Resolver, StackMemory, ThunkKind,
};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Deepest superclass chain the loader will follow.
const MAX_CLASS_DEPTH: usize = 256;

/// Counters across every layer.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub jit: JitStatsSnapshot,
    pub gc: GcStatsSnapshot,
    pub safepoint_pauses: u64,
    pub classes: usize,
    pub threads: usize,
}

pub struct Runtime {
    config: RuntimeConfig,
    heap: Heap,
    jit: Jit,
    classes: ClassRegistry,
    strings: Mutex<FxHashMap<Arc<str>, u64>>,
    natives: NativeRegistry,
    monitors: Monitors,
    safepoint: Safepoint,
    threads: Arc<ThreadRegistry>,
    continuations: Mutex<Vec<Weak<Continuation>>>,
    shut_down: AtomicBool,
    string_class: ClassId,
}

impl Runtime {
    /// Create a runtime with the bootstrap classes linked and the built-in
    /// natives registered.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, VmError> {
        config.validate()?;
        let jit = Jit::new(config.jit)?;
        let heap = Heap::new(config.gc.clone());
        let classes = ClassRegistry::new();

        let mut string_class = ClassId(0);
        for def in bootstrap_classes() {
            let superclass = def.superclass.as_deref().and_then(|name| classes.by_name(name));
            let class = classes.link(&def, superclass, &heap, &jit)?;
            if &*def.name == names::STRING_CLASS {
                string_class = class.id();
            }
        }
        tracing::debug!(
            classes = classes.len(),
            stack_words = config.stack_words,
            tail_calls = config.jit.tail_calls,
            "runtime created"
        );

        Ok(Arc::new(Self {
            config,
            heap,
            jit,
            classes,
            strings: Mutex::new(FxHashMap::default()),
            natives: NativeRegistry::with_builtins(),
            monitors: Monitors::new(),
            safepoint: Safepoint::new(),
            threads: Arc::new(ThreadRegistry::default()),
            continuations: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            string_class,
        }))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    #[inline]
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    #[inline]
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    #[inline]
    pub fn monitors(&self) -> &Monitors {
        &self.monitors
    }

    #[inline]
    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    /// Attach a new mutator thread with its own native stack.
    pub fn attach_thread(&self) -> Thread {
        self.threads
            .attach(self.config.stack_words, self.config.stack_reserve)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            jit: self.jit.stats().snapshot(),
            gc: self.heap.stats().snapshot(),
            safepoint_pauses: self.safepoint.pauses(),
            classes: self.classes.len(),
            threads: self.threads.len(),
        }
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// Consult `loader` whenever resolution names an unknown class.
    pub fn set_loader(&self, loader: impl ClassLoader + 'static) {
        self.classes.set_loader(Arc::new(loader));
    }

    /// Link and register `def`, loading its superclass chain if needed.
    pub fn define_class(&self, def: &ClassDef) -> Result<Arc<Class>, VmError> {
        self.define_at(def, 0)
    }

    fn define_at(&self, def: &ClassDef, depth: usize) -> Result<Arc<Class>, VmError> {
        let superclass = match &def.superclass {
            Some(name) => Some(self.load_at(name, depth + 1).map_err(LinkError::from)?),
            None => None,
        };
        if superclass.is_none() && &*def.name != names::OBJECT_CLASS {
            return Err(LinkError::MissingSuperclass(def.name.to_string()).into());
        }
        Ok(self.classes.link(def, superclass, &self.heap, &self.jit)?)
    }

    /// Class named `name`, asking the loader if it is not linked yet.
    pub fn load_class(&self, name: &str) -> Result<Arc<Class>, ResolveError> {
        self.load_at(name, 0)
    }

    fn load_at(&self, name: &str, depth: usize) -> Result<Arc<Class>, ResolveError> {
        if let Some(class) = self.classes.by_name(name) {
            return Ok(class);
        }
        if depth > MAX_CLASS_DEPTH {
            return Err(ResolveError::IncompatibleChange(format!(
                "superclass chain of {name} is circular or too deep"
            )));
        }
        let def = self
            .classes
            .loader()
            .and_then(|loader| loader.load(name))
            .ok_or_else(|| ResolveError::ClassNotFound(name.to_string()))?;
        if &*def.name != name {
            return Err(ResolveError::IncompatibleChange(format!(
                "loader returned {} for {name}",
                def.name
            )));
        }
        match self.define_at(&def, depth) {
            Ok(class) => Ok(class),
            // Another thread defined it first.
            Err(VmError::Link(LinkError::Duplicate(_))) => self
                .classes
                .by_name(name)
                .ok_or_else(|| ResolveError::ClassNotFound(name.to_string())),
            Err(VmError::Link(LinkError::Resolve(err))) => Err(err),
            Err(err) => Err(ResolveError::IncompatibleChange(err.to_string())),
        }
    }

    /// Method `name` with `descriptor` declared by `class` or inherited.
    pub fn find_method(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<Arc<Method>, VmError> {
        let owner = self.load_class(class).map_err(LinkError::from)?;
        owner
            .find_method(name, descriptor)
            .cloned()
            .ok_or_else(|| {
                LinkError::from(ResolveError::MethodNotFound {
                    class: class.to_string(),
                    name: name.to_string(),
                    descriptor: descriptor.to_string(),
                })
                .into()
            })
    }

    /// Compile `method` ahead of its first call.
    pub fn compile(&self, method: &Arc<Method>) -> Result<u64, VmError> {
        Ok(self.jit.compile(method, self)?)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Interned string for `text`. Interned strings live as long as the
    /// runtime.
    pub fn intern(&self, text: &str) -> u64 {
        let mut strings = self.strings.lock();
        if let Some(&handle) = strings.get(text) {
            return handle;
        }
        let handle = self.heap.alloc_string(self.string_class.0, text).raw();
        strings.insert(Arc::from(text), handle);
        handle
    }

    /// A fresh, unrooted string.
    pub fn alloc_string(&self, text: &str) -> u64 {
        self.heap.alloc_string(self.string_class.0, text).raw()
    }

    /// A new instance of throwable `class` carrying `message`.
    pub fn new_exception(&self, class: &str, message: Option<&str>) -> Result<u64, VmError> {
        let class = self.load_class(class).map_err(LinkError::from)?;
        let throwable = self
            .classes
            .by_name(names::THROWABLE_CLASS)
            .is_some_and(|t| class.is_subclass_of(t.id()));
        if !throwable {
            return Err(LinkError::from(ResolveError::IncompatibleChange(format!(
                "{} is not throwable",
                class.name()
            )))
            .into());
        }
        let message = message.map_or(0, |text| self.alloc_string(text));
        let exception = self
            .heap
            .alloc_instance(class.id().0, class.ref_map().clone())
            .raw();
        self.heap.write_field(exception, MESSAGE_FIELD, message)?;
        Ok(exception)
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    fn check_thread(&self, thread: &Thread) -> Result<(), VmError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(VmError::ShutDown);
        }
        if !thread.belongs_to(&self.threads) {
            return Err(VmError::ForeignThread);
        }
        Ok(())
    }

    /// Call `method` on `thread` with `args` (receiver first, one word per
    /// parameter).
    pub fn invoke(&self, thread: &Thread, method: &Arc<Method>, args: &[u64]) -> Result<u64, VmError> {
        self.check_thread(thread)?;
        let mut ctx = thread.shared().context.lock();
        self.invoke_in(&mut ctx, method, args)
    }

    /// Call `method` on the thread owning `ctx`, nesting a new activation
    /// below any suspended one.
    pub(crate) fn invoke_in(
        &self,
        ctx: &mut ContextGuard<'_>,
        method: &Arc<Method>,
        args: &[u64],
    ) -> Result<u64, VmError> {
        let expected = usize::from(method.param_footprint());
        if args.len() != expected {
            return Err(VmError::ArgumentCount {
                method: method.to_string(),
                expected,
                given: args.len(),
            });
        }

        if method.is_native() {
            let mark = ctx.handles.len();
            // Arguments of a direct native call are on no stack.
            ctx.handles.extend(
                method
                    .param_kinds()
                    .zip(args)
                    .filter(|(kind, arg)| kind.is_reference() && **arg != 0)
                    .map(|(_, &arg)| arg),
            );
            let result = self.call_native(ctx, method, args);
            ctx.handles.truncate(mark);
            return result.map_err(|err| self.native_failure(err));
        }

        let entry = self.jit.compile(method, self)?;
        let base = ctx.next_base();
        let count = args.len() as u64;
        let return_slot = base
            .checked_sub(count + 1)
            .filter(|&slot| slot > ctx.stack.limit())
            .ok_or(VmError::StackOverflow)?;
        for (i, &arg) in args.iter().enumerate() {
            ctx.stack.write(return_slot + count - i as u64, arg);
        }
        let boundary = self.jit.thunks().address(ThunkKind::InvocationReturn);
        ctx.stack.write(return_slot, boundary);

        let start = FrameState {
            ip: entry,
            fp: 0,
            sp: return_slot,
        };
        let exit = self.run_activation(ctx, base, start, None);
        match exit? {
            Exit::Returned(value) => Ok(normalize(method.return_kind(), value)),
            Exit::Threw(exception) => Err(self.uncaught(exception)),
        }
    }

    /// Continue a captured continuation on `thread`. `value` becomes the
    /// result of the capture call.
    pub fn resume(
        &self,
        thread: &Thread,
        continuation: &Arc<Continuation>,
        value: u64,
    ) -> Result<u64, VmError> {
        self.check_thread(thread)?;
        let mut ctx = thread.shared().context.lock();
        let base = ctx.next_base();
        let boundary = self.jit.thunks().address(ThunkKind::InvocationReturn);
        let start = continuation.restore(&mut ctx.stack, base, boundary, 0)?;
        tracing::debug!(
            thread = ctx.id().0,
            depth = continuation.depth(),
            method = %continuation.method(),
            "continuation resumed"
        );
        match self.run_activation(&mut ctx, base, start, Some(value))? {
            Exit::Returned(value) => Ok(value),
            Exit::Threw(exception) => Err(self.uncaught(exception)),
        }
    }

    fn run_activation(
        &self,
        ctx: &mut ContextGuard<'_>,
        base: u64,
        start: FrameState,
        result: Option<u64>,
    ) -> Result<Exit, VmError> {
        ctx.traces.push(TraceRecord {
            base,
            suspended: None,
        });
        let exit = {
            let mut machine = Machine::new(self, ctx, start);
            if let Some(value) = result {
                machine.set_reg(Reg::R0, value);
            }
            machine.run()
        };
        ctx.traces.pop();
        exit
    }

    /// Run the native implementation of `method`.
    pub(crate) fn call_native(
        &self,
        ctx: &mut ContextGuard<'_>,
        method: &Arc<Method>,
        args: &[u64],
    ) -> Result<u64, NativeError> {
        let Some(native) = self.natives.resolve(method) else {
            tracing::debug!(method = %method, "no native implementation");
            return Err(NativeError::raise(
                names::UNSATISFIED_LINK_ERROR,
                method.to_string(),
            ));
        };
        let mark = ctx.handles.len();
        let result = {
            let mut call = NativeCall {
                runtime: self,
                ctx: &mut *ctx,
                method,
            };
            native(&mut call, args)
        };
        ctx.handles.truncate(mark);
        result.map(|value| normalize(method.return_kind(), value))
    }

    fn native_failure(&self, err: NativeError) -> VmError {
        match err {
            NativeError::Throw(exception) => self.uncaught(exception),
            NativeError::Raise { class, message } => {
                match self.new_exception(&class, Some(&message)) {
                    Ok(exception) => self.uncaught(exception),
                    Err(err) => err,
                }
            }
        }
    }

    fn uncaught(&self, exception: u64) -> VmError {
        let class = self
            .heap
            .class_of(exception)
            .ok()
            .and_then(|id| self.classes.by_id(ClassId(id)))
            .map_or_else(|| "<unknown>".to_string(), |class| class.name().to_string());
        let message = self
            .heap
            .read_field(exception, MESSAGE_FIELD)
            .ok()
            .filter(|&handle| handle != 0)
            .and_then(|handle| self.heap.string(handle).ok())
            .map(|text| text.to_string());
        tracing::debug!(class = %class, message = ?message, "exception reached invocation boundary");
        VmError::Uncaught {
            class,
            message,
            exception,
        }
    }

    pub(crate) fn track_continuation(&self, continuation: &Arc<Continuation>) {
        let mut live = self.continuations.lock();
        live.retain(|c| c.strong_count() > 0);
        live.push(Arc::downgrade(continuation));
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Collect from a running thread. If another thread is already
    /// collecting, wait for it instead.
    pub(crate) fn collect_from(&self, ctx: &mut ContextGuard<'_>) {
        if !self.safepoint.try_begin() {
            MutexGuard::unlocked(ctx, || self.safepoint.park());
            return;
        }
        self.collect_stopped(Some(&mut **ctx));
    }

    /// Run a full collection from outside any attached thread.
    pub fn collect_garbage(&self) {
        while !self.safepoint.try_begin() {
            self.safepoint.park();
        }
        self.collect_stopped(None);
    }

    /// Stop every other thread, collect, and release them.
    fn collect_stopped(&self, own: Option<&mut NativeContext>) {
        let own_id = own.as_ref().map(|ctx| ctx.id());
        let threads = self.threads.snapshot();
        let mut guards: Vec<ContextGuard<'_>> = threads
            .iter()
            .filter(|thread| Some(thread.id()) != own_id)
            .map(|thread| thread.context.lock())
            .collect();
        let linking = self.classes.pause_linking();
        let mut strings = self.strings.lock();

        let classes = self.classes.all();
        let code = self.jit.method_tree().all();
        let continuations: Vec<Arc<Continuation>> = self
            .continuations
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut contexts: Vec<&mut NativeContext> = guards.iter_mut().map(|g| &mut **g).collect();
        contexts.extend(own);

        let jit = &self.jit;
        let monitors = &self.monitors;
        let outcome = self.heap.collect(|visitor| {
            for ctx in contexts.iter_mut() {
                gc_roots::scan_context(jit, ctx, visitor);
            }
            gc_roots::scan_code(&code, visitor);
            gc_roots::scan_classes(&classes, visitor);
            for handle in strings.values_mut() {
                visitor.visit(handle);
            }
            monitors.visit_roots(|object| visitor.visit_value(object));
            for continuation in &continuations {
                gc_roots::visit_continuation(continuation, visitor);
            }
        });

        drop(contexts);
        drop(strings);
        drop(linking);
        drop(guards);
        self.safepoint.finish();
        tracing::debug!(
            threads = threads.len(),
            marked = outcome.marked,
            freed = outcome.freed,
            "stop-the-world collection finished"
        );
    }

    /// Refuse further invocations and report counters.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let stats = self.stats();
        tracing::debug!(
            methods_compiled = stats.jit.methods_compiled,
            compile_failures = stats.jit.compile_failures,
            patches = stats.jit.patches,
            collections = stats.gc.collections,
            objects_freed = stats.gc.objects_freed,
            pauses = stats.safepoint_pauses,
            "runtime shut down"
        );
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("classes", &self.classes.len())
            .field("threads", &self.threads.len())
            .field("natives", &self.natives)
            .finish_non_exhaustive()
    }
}

/// Canonical form of a returned word.
fn normalize(kind: TypeKind, value: u64) -> u64 {
    match kind {
        TypeKind::Int => i64::from(value as i32) as u64,
        TypeKind::Void => 0,
        TypeKind::Long | TypeKind::Object => value,
    }
}

// =============================================================================
// Resolution
// =============================================================================

impl Resolver for Runtime {
    fn resolve_class(&self, name: &str) -> Result<Arc<Class>, ResolveError> {
        self.load_class(name)
    }

    fn resolve_method(&self, reference: &MethodRef, kind: InvokeKind) -> Result<Arc<Method>, ResolveError> {
        let class = self.load_class(&reference.class)?;
        let method = class
            .find_method(&reference.name, &reference.descriptor)
            .cloned()
            .ok_or_else(|| ResolveError::MethodNotFound {
                class: reference.class.to_string(),
                name: reference.name.to_string(),
                descriptor: reference.descriptor.to_string(),
            })?;
        let expects_static = kind == InvokeKind::Static;
        if method.is_static() != expects_static {
            return Err(ResolveError::IncompatibleChange(format!(
                "{method} is {}static",
                if method.is_static() { "" } else { "not " }
            )));
        }
        Ok(method)
    }

    fn resolve_field(&self, reference: &FieldRef, is_static: bool) -> Result<ResolvedField, ResolveError> {
        let class = self.load_class(&reference.class)?;
        let not_found = || ResolveError::FieldNotFound {
            class: reference.class.to_string(),
            name: reference.name.to_string(),
        };
        let (owner, field) = if is_static {
            let (owner, field) = class.find_static_field(&reference.name).ok_or_else(not_found)?;
            let owner = self.classes.by_id(owner.id()).ok_or_else(not_found)?;
            (owner, field.clone())
        } else {
            let field = class.instance_field(&reference.name).ok_or_else(not_found)?.clone();
            (class.clone(), field)
        };
        if field.kind != reference.kind {
            return Err(ResolveError::IncompatibleChange(format!(
                "{}.{} is {:?}, not {:?}",
                reference.class, reference.name, field.kind, reference.kind
            )));
        }
        Ok(ResolvedField {
            owner,
            index: field.index,
            kind: field.kind,
        })
    }

    fn intern_string(&self, text: &str) -> Result<u64, ResolveError> {
        Ok(self.intern(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_bootstrap_classes_are_linked() {
        let rt = runtime();
        for name in [names::OBJECT_CLASS, names::NULL_POINTER_ERROR, names::RUNTIME] {
            assert!(rt.classes().by_name(name).is_some(), "{name}");
        }
        let npe = rt.classes().by_name(names::NULL_POINTER_ERROR).unwrap();
        let throwable = rt.classes().by_name(names::THROWABLE_CLASS).unwrap();
        assert!(npe.is_subclass_of(throwable.id()));
    }

    #[test]
    fn test_interning_returns_one_handle_per_text() {
        let rt = runtime();
        let a = rt.intern("hello");
        assert_eq!(rt.intern("hello"), a);
        assert_ne!(rt.intern("world"), a);
        assert_eq!(&*rt.heap().string(a).unwrap(), "hello");
    }

    #[test]
    fn test_exception_carries_message() {
        let rt = runtime();
        let e = rt
            .new_exception(names::ARITHMETIC_ERROR, Some("/ by zero"))
            .unwrap();
        let message = rt.heap().read_field(e, MESSAGE_FIELD).unwrap();
        assert_eq!(&*rt.heap().string(message).unwrap(), "/ by zero");
        assert!(rt.new_exception(names::OBJECT_CLASS, None).is_err());
    }

    #[test]
    fn test_missing_superclass_is_reported() {
        let rt = runtime();
        let err = rt
            .define_class(&ClassDef::new("app/A").extends("app/Missing"))
            .unwrap_err();
        assert_eq!(
            err,
            VmError::Link(LinkError::Resolve(ResolveError::ClassNotFound(
                "app/Missing".into()
            )))
        );
    }

    #[test]
    fn test_loader_supplies_superclass_chain() {
        let rt = runtime();
        rt.set_loader(|name: &str| match name {
            "app/Base" => Some(ClassDef::new("app/Base")),
            "app/Mid" => Some(ClassDef::new("app/Mid").extends("app/Base")),
            _ => None,
        });
        let leaf = rt
            .define_class(&ClassDef::new("app/Leaf").extends("app/Mid"))
            .unwrap();
        let base = rt.classes().by_name("app/Base").unwrap();
        assert!(leaf.is_subclass_of(base.id()));
    }

    #[test]
    fn test_circular_superclasses_are_rejected() {
        let rt = runtime();
        rt.set_loader(|name: &str| match name {
            "app/A" => Some(ClassDef::new("app/A").extends("app/B")),
            "app/B" => Some(ClassDef::new("app/B").extends("app/A")),
            _ => None,
        });
        let err = rt.load_class("app/A").unwrap_err();
        assert!(matches!(err, ResolveError::IncompatibleChange(_)));
    }

    #[test]
    fn test_foreign_thread_is_rejected() {
        let a = runtime();
        let b = runtime();
        let thread = b.attach_thread();
        let method = a.find_method(names::RUNTIME, "stackDepth", "()I").unwrap();
        assert_eq!(a.invoke(&thread, &method, &[]), Err(VmError::ForeignThread));
    }

    #[test]
    fn test_invoke_after_shutdown_fails() {
        let rt = runtime();
        let thread = rt.attach_thread();
        let method = rt.find_method(names::RUNTIME, "stackDepth", "()I").unwrap();
        assert_eq!(rt.invoke(&thread, &method, &[]), Ok(0));
        rt.shutdown();
        assert_eq!(rt.invoke(&thread, &method, &[]), Err(VmError::ShutDown));
    }

    #[test]
    fn test_int_results_are_sign_extended() {
        assert_eq!(normalize(TypeKind::Int, 0xffff_ffff), u64::MAX);
        assert_eq!(normalize(TypeKind::Void, 7), 0);
        assert_eq!(normalize(TypeKind::Long, 0xffff_ffff), 0xffff_ffff);
    }
}
