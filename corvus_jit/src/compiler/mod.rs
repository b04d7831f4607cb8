//! Method compiler.
//!
//! [`Jit`] owns the process-wide compilation state: the code space, the
//! method tree, the call-site table and the thunks. Compilation is
//! serialized by one lock; the common case (already compiled) never takes
//! it.
//!
//! Installation order is what keeps concurrent stack walks safe:
//!
//! ```text
//! reserve range ─► method tree insert ─► call nodes ─► attach code
//!                                                        │
//!                          release-publish entry address ◄┘
//! ```
//!
//! A thread that observes the new entry address is guaranteed to find the
//! code in the tree and every call site it contains.

pub mod driver;
pub mod event;
pub mod frame_map;
pub mod state;

pub use driver::{CallElement, Translation, translate};
pub use event::{ContextId, Event, EventLog};
pub use frame_map::FrameMaps;
pub use state::{AbstractFrame, SlotType};

use crate::call_table::{CallNode, CallSiteTable};
use crate::code::{CodeBlock, CodeMetadata, CodeSpace, CompiledCode};
use crate::error::{AssemblerError, CompileError};
use crate::method_tree::MethodTree;
use crate::model::{Method, Resolver, VtableEntry};
use crate::stats::JitStats;
use crate::thunks::{ThunkKind, Thunks};
use corvus_bytecode::MethodFlags;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Compiler options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitOptions {
    /// Compile calls in return position as frame-replacing jumps.
    pub tail_calls: bool,
    /// Poll for safepoints before backward branches.
    pub safepoint_polls: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            tail_calls: true,
            safepoint_polls: true,
        }
    }
}

/// Process-wide compiler state.
#[derive(Debug)]
pub struct Jit {
    options: JitOptions,
    space: CodeSpace,
    tree: MethodTree,
    calls: CallSiteTable,
    thunks: Thunks,
    lock: Mutex<()>,
    stats: JitStats,
}

impl Jit {
    pub fn new(options: JitOptions) -> Result<Self, AssemblerError> {
        let space = CodeSpace::new();
        let thunks = Thunks::generate(&space)?;
        Ok(Self {
            options,
            space,
            tree: MethodTree::new(),
            calls: CallSiteTable::new(),
            thunks,
            lock: Mutex::new(()),
            stats: JitStats::new(),
        })
    }

    #[inline]
    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    #[inline]
    pub fn thunks(&self) -> &Thunks {
        &self.thunks
    }

    #[inline]
    pub fn method_tree(&self) -> &MethodTree {
        &self.tree
    }

    #[inline]
    pub fn call_sites(&self) -> &CallSiteTable {
        &self.calls
    }

    #[inline]
    pub fn code_space(&self) -> &CodeSpace {
        &self.space
    }

    #[inline]
    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    /// Entry address a new method starts with.
    pub fn initial_address(&self, flags: MethodFlags) -> u64 {
        if flags.contains(MethodFlags::NATIVE) {
            self.thunks.address(ThunkKind::NativeInvoke)
        } else {
            self.thunks.address(ThunkKind::DefaultCompile)
        }
    }

    /// Initial address of a vtable slot for `method`.
    pub fn initial_vtable_address(&self, method: &Method) -> u64 {
        if method.is_native() {
            self.thunks.address(ThunkKind::NativeInvoke)
        } else {
            self.thunks.address(ThunkKind::VirtualCompile)
        }
    }

    /// Compile `method` unless it already has code, and return its entry.
    pub fn compile(&self, method: &Arc<Method>, resolver: &dyn Resolver) -> Result<u64, CompileError> {
        let address = method.code_address();
        if !self.thunks.is_unresolved(address) {
            return Ok(address);
        }
        if method.is_abstract() {
            return Err(CompileError::Abstract(method.to_string()));
        }

        let _guard = self.lock.lock();
        // Another thread may have won the race while we waited.
        let address = method.code_address();
        if !self.thunks.is_unresolved(address) {
            return Ok(address);
        }

        let span = tracing::debug_span!("compile", method = %method);
        let _enter = span.enter();
        let started = Instant::now();

        let translation = match translate(method, resolver, &self.options) {
            Ok(t) => t,
            Err(err) => {
                self.stats.record_failure();
                tracing::debug!(error = %err, "compilation failed");
                return Err(err);
            }
        };
        let maps = frame_map::build(
            &translation.log,
            &translation.visits,
            &translation.layout,
            translation.trace_count(),
        );
        let passes = maps.passes();
        let call_sites = translation.calls.len();
        let code = self.install(method, address, translation, maps);

        self.stats.record_compile(
            code.block().len(),
            call_sites,
            code.root_map_count(),
            passes,
            started.elapsed(),
        );
        tracing::debug!(
            start = format_args!("{:#x}", code.start()),
            len = code.block().len(),
            root_maps = code.root_map_count(),
            passes,
            "compiled"
        );
        Ok(code.start())
    }

    fn install(
        &self,
        method: &Arc<Method>,
        unresolved: u64,
        translation: Translation,
        maps: FrameMaps,
    ) -> Arc<CompiledCode> {
        let Translation {
            insts,
            layout,
            trace_offsets,
            calls,
            pool,
            ip_map,
            handlers,
            ..
        } = translation;

        let start = self.space.reserve(insts.len());
        let block = Arc::new(CodeBlock::new(start, insts));
        let root_maps = trace_offsets.into_iter().zip(maps.into_traces()).collect();
        let code = Arc::new(CompiledCode::new(
            method.clone(),
            block,
            layout,
            CodeMetadata {
                pool,
                root_maps,
                ip_map,
                handlers,
            },
        ));

        self.tree.insert(code.clone());
        for call in calls {
            let initial = call.target.code_address();
            self.calls.insert(CallNode::new(
                start + u64::from(call.offset),
                call.target,
                call.flags,
                initial,
            ));
        }
        method.attach_code(code.clone());
        if let Err(current) = method.publish(unresolved, start) {
            // Only reachable if an address was published outside the lock.
            tracing::error!(current = format_args!("{current:#x}"), "method entry changed during compilation");
            panic!("entry of {method} changed while it was being compiled");
        }
        code
    }

    /// Point a call site at `to` if it still targets `from`.
    pub fn patch_call_site(&self, node: &CallNode, from: u64, to: u64) -> bool {
        let patched = node.patch(from, to);
        if patched {
            self.stats.record_patch();
            tracing::trace!(
                site = format_args!("{:#x}", node.address()),
                target = %node.target(),
                to = format_args!("{to:#x}"),
                "call site patched"
            );
        }
        patched
    }

    /// Point a vtable slot at `to` if it is still unresolved.
    pub fn patch_vtable(&self, entry: &VtableEntry, to: u64) -> bool {
        let from = self.thunks.address(ThunkKind::VirtualCompile);
        let patched = entry.patch(from, to);
        if patched {
            self.stats.record_patch();
            tracing::trace!(method = %entry.method(), to = format_args!("{to:#x}"), "vtable slot patched");
        }
        patched
    }

    /// Compiled code containing `address`.
    #[inline]
    pub fn find_code(&self, address: u64) -> Option<Arc<CompiledCode>> {
        self.tree.find(address)
    }

    /// Call node whose return address is `address`.
    #[inline]
    pub fn find_call(&self, address: u64) -> Option<Arc<CallNode>> {
        self.calls.find(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_table::CallFlags;
    use crate::error::ResolveError;
    use crate::model::{Class, ClassId, InvokeKind, MethodId, MethodParts, ResolvedField};
    use corvus_bytecode::{CodeBody, CodeBuilder, FieldRef, Instruction, MethodDescriptor, MethodRef};

    struct OneCallee {
        callee: Arc<Method>,
    }

    impl Resolver for OneCallee {
        fn resolve_class(&self, name: &str) -> Result<Arc<Class>, ResolveError> {
            Err(ResolveError::ClassNotFound(name.to_string()))
        }

        fn resolve_method(&self, r: &MethodRef, _: InvokeKind) -> Result<Arc<Method>, ResolveError> {
            if &*r.name == self.callee.name() {
                Ok(self.callee.clone())
            } else {
                Err(ResolveError::MethodNotFound {
                    class: r.class.to_string(),
                    name: r.name.to_string(),
                    descriptor: r.descriptor.to_string(),
                })
            }
        }

        fn resolve_field(&self, r: &FieldRef, _: bool) -> Result<ResolvedField, ResolveError> {
            Err(ResolveError::ClassNotFound(r.class.to_string()))
        }

        fn intern_string(&self, _: &str) -> Result<u64, ResolveError> {
            Ok(1)
        }
    }

    fn method(jit: &Jit, id: u32, name: &str, code: CodeBody) -> Arc<Method> {
        let flags = MethodFlags::STATIC;
        Arc::new(Method::new(
            MethodParts {
                id: MethodId(id),
                class: ClassId(1),
                class_name: Arc::from("t/T"),
                name: Arc::from(name),
                descriptor: Arc::from("()I"),
                signature: MethodDescriptor::parse("()I").unwrap(),
                flags,
                code: Some(code),
                vtable_index: None,
            },
            jit.initial_address(flags),
        ))
    }

    fn returns_seven() -> CodeBody {
        let mut b = CodeBuilder::new(0);
        b.emit_all([Instruction::IConst(7), Instruction::IReturn]);
        b.finish().unwrap()
    }

    fn calls_callee() -> CodeBody {
        let mut b = CodeBuilder::new(0);
        b.emit_all([
            Instruction::InvokeStatic(MethodRef::new("t/T", "callee", "()I")),
            Instruction::IConst(1),
            Instruction::IAdd,
            Instruction::IReturn,
        ]);
        b.finish().unwrap()
    }

    #[test]
    fn test_install_publishes_after_tree_and_call_nodes() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let callee = method(&jit, 1, "callee", returns_seven());
        let caller = method(&jit, 2, "caller", calls_callee());
        let resolver = OneCallee {
            callee: callee.clone(),
        };

        let entry = jit.compile(&caller, &resolver).unwrap();
        assert_eq!(caller.code_address(), entry);
        let code = jit.find_code(entry).unwrap();
        assert!(Arc::ptr_eq(code.method(), &caller));
        assert!(Arc::ptr_eq(caller.compiled().unwrap(), &code));

        // The callee is still uncompiled, so its site points at the thunk.
        assert_eq!(jit.call_sites().len(), 1);
        let site = code.root_maps()[0].0;
        let node = jit.find_call(code.start() + u64::from(site)).unwrap();
        assert_eq!(node.resolved(), jit.thunks().address(ThunkKind::DefaultCompile));
        assert_eq!(node.flags(), CallFlags::NONE);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let m = method(&jit, 1, "callee", returns_seven());
        let resolver = OneCallee { callee: m.clone() };
        let first = jit.compile(&m, &resolver).unwrap();
        let second = jit.compile(&m, &resolver).unwrap();
        assert_eq!(first, second);
        assert_eq!(jit.stats().snapshot().methods_compiled, 1);
    }

    #[test]
    fn test_concurrent_first_callers_compile_once() {
        let jit = Arc::new(Jit::new(JitOptions::default()).unwrap());
        let m = method(&jit, 1, "callee", returns_seven());
        let resolver = Arc::new(OneCallee { callee: m.clone() });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (jit, m, resolver) = (jit.clone(), m.clone(), resolver.clone());
                std::thread::spawn(move || jit.compile(&m, &*resolver).unwrap())
            })
            .collect();
        let addresses: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(jit.stats().snapshot().methods_compiled, 1);
        assert_eq!(jit.method_tree().len(), 1);
    }

    #[test]
    fn test_failed_resolution_leaves_method_uncompiled() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let other = method(&jit, 1, "other", returns_seven());
        let caller = method(&jit, 2, "caller", calls_callee());
        let resolver = OneCallee { callee: other };

        assert!(matches!(
            jit.compile(&caller, &resolver),
            Err(CompileError::Resolve(ResolveError::MethodNotFound { .. }))
        ));
        assert!(jit.thunks().is_unresolved(caller.code_address()));
        assert!(jit.method_tree().is_empty());
    }
}
