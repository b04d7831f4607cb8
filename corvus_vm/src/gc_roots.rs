//! Root enumeration for stop-the-world collections.
//!
//! Every reference the collector must see comes from one of these places:
//!
//! ```text
//! per thread   compiled frames (exact frame maps at each return address)
//!              arguments pending in a thunk (callee signature)
//!              native handles and the last captured continuation
//! per runtime  object pools of compiled code
//!              class static storage
//!              interned strings
//!              objects whose monitor is held
//!              live continuations
//! ```
//!
//! The heap never moves objects, but slots are still read, visited and
//! written back so the walk stays correct for any visitor.

use crate::thread::NativeContext;
use corvus_gc::{RootVisitor, Traceable};
use corvus_jit::{Class, CompiledCode, Continuation, FrameWalker, Jit, StackMemory};
use smallvec::SmallVec;
use std::sync::Arc;

/// Visit every root held by one stopped thread.
pub(crate) fn scan_context(jit: &Jit, ctx: &mut NativeContext, visitor: &mut dyn RootVisitor) {
    let mut frames = 0usize;
    let mut slots: Vec<u64> = Vec::new();
    for record in &ctx.traces {
        let Some(start) = &record.suspended else {
            continue;
        };
        for frame in FrameWalker::new(jit, &ctx.stack, start.ip, start.fp) {
            frames += 1;
            slots.extend(frame.root_addresses());
        }
        if let Some(pending) = &start.pending {
            slots.extend(pending.reference_slots());
        }
    }

    for &address in &slots {
        let mut value = ctx.stack.read(address);
        visitor.visit(&mut value);
        ctx.stack.write(address, value);
    }
    for handle in ctx.handles.iter_mut() {
        visitor.visit(handle);
    }
    if let Some(continuation) = &ctx.captured {
        visit_continuation(continuation, visitor);
    }
    tracing::trace!(
        thread = ctx.id().0,
        frames,
        stack_roots = slots.len(),
        handles = ctx.handles.len(),
        "thread scanned"
    );
}

/// Visit the object pools of compiled code.
pub(crate) fn scan_code(code: &[Arc<CompiledCode>], visitor: &mut dyn RootVisitor) {
    for block in code {
        block.visit_pool(|slot| visitor.visit(slot));
    }
}

/// Visit class static storage.
pub(crate) fn scan_classes(classes: &[Arc<Class>], visitor: &mut dyn RootVisitor) {
    for class in classes {
        visitor.visit_value(class.statics());
    }
}

pub(crate) fn visit_continuation(continuation: &Continuation, visitor: &mut dyn RootVisitor) {
    let mut refs: SmallVec<[u64; 16]> = SmallVec::new();
    continuation.trace_refs(&mut |value| refs.push(value));
    for value in refs {
        visitor.visit_value(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{NativeStack, PendingArgs, ThreadId, TraceRecord, WalkStart};
    use corvus_bytecode::{MethodDescriptor, MethodFlags};
    use corvus_jit::{ClassId, JitOptions, Method, MethodId, MethodParts, ThunkKind};

    #[derive(Default)]
    struct Collect(Vec<u64>);

    impl RootVisitor for Collect {
        fn visit(&mut self, slot: &mut u64) {
            self.0.push(*slot);
        }
    }

    fn method(descriptor: &str, flags: MethodFlags) -> Arc<Method> {
        Arc::new(Method::new(
            MethodParts {
                id: MethodId(0),
                class: ClassId(0),
                class_name: Arc::from("t/T"),
                name: Arc::from("m"),
                descriptor: Arc::from(descriptor),
                signature: MethodDescriptor::parse(descriptor).unwrap(),
                flags,
                code: None,
                vtable_index: None,
            },
            0,
        ))
    }

    #[test]
    fn test_pending_arguments_use_callee_signature() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let mut ctx = NativeContext::new(ThreadId(0), NativeStack::new(64, 4));
        // Receiver, int, object: argument 0 is highest.
        ctx.stack.write(42, 0x30);
        ctx.stack.write(41, 7);
        ctx.stack.write(40, 0x31);
        ctx.traces.push(TraceRecord {
            base: 64,
            suspended: Some(WalkStart {
                ip: jit.thunks().address(ThunkKind::InvocationReturn),
                fp: 0,
                sp: 39,
                pending: Some(PendingArgs {
                    first: 40,
                    method: method("(ILt/T;)V", MethodFlags::NONE),
                }),
            }),
        });
        ctx.handles.push(0x50);

        let mut visitor = Collect::default();
        scan_context(&jit, &mut ctx, &mut visitor);
        visitor.0.sort();
        assert_eq!(visitor.0, vec![0x30, 0x31, 0x50]);
    }

    #[test]
    fn test_running_activation_is_skipped() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let mut ctx = NativeContext::new(ThreadId(0), NativeStack::new(64, 4));
        ctx.traces.push(TraceRecord {
            base: 64,
            suspended: None,
        });
        let mut visitor = Collect::default();
        scan_context(&jit, &mut ctx, &mut visitor);
        assert!(visitor.0.is_empty());
    }
}
