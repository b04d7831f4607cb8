//! Stack walking and exception unwinding.
//!
//! Compiled frames form a chain through their saved frame pointers. A walk
//! starts at a return address into compiled code and the frame pointer of
//! the frame that owns it, and ends at the invocation-return thunk, which
//! marks the boundary of the current native call trace.
//!
//! ```text
//!   (ip, fp) ──► method tree ──► CompiledCode
//!      │                             │
//!      │      ip' = [fp + 1]          ├── root map at ip  (GC)
//!      └───►  fp' = [fp]              ├── ip map at ip    (handler search)
//!                                     └── lock slot       (monitor release)
//! ```
//!
//! Stack memory is reached through [`StackMemory`], so the walk itself never
//! touches raw pointers.

use crate::code::CompiledCode;
use crate::compiler::Jit;
use crate::frame::RETURN_ADDRESS_OFFSET;
use crate::model::Method;
use crate::thunks::ThunkKind;
use corvus_bytecode::ClassRef;
use std::sync::Arc;

// =============================================================================
// Stack memory
// =============================================================================

/// Word-addressed view of one thread's native stack.
pub trait StackMemory {
    fn read(&self, address: u64) -> u64;

    fn write(&mut self, address: u64, value: u64);

    /// Lowest address frames may occupy.
    fn limit(&self) -> u64;
}

/// Address of the word at `fp + offset`.
#[inline]
pub fn slot_address(fp: u64, offset: i32) -> u64 {
    fp.wrapping_add_signed(i64::from(offset))
}

/// Machine state a walk starts from or a transfer resumes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameState {
    pub ip: u64,
    pub fp: u64,
    pub sp: u64,
}

// =============================================================================
// Frames
// =============================================================================

/// One compiled activation found by a walk.
#[derive(Debug, Clone)]
pub struct JitFrame {
    code: Arc<CompiledCode>,
    ip: u64,
    fp: u64,
}

impl JitFrame {
    #[inline]
    pub fn code(&self) -> &Arc<CompiledCode> {
        &self.code
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        self.code.method()
    }

    /// Address at which this activation will continue.
    #[inline]
    pub fn ip(&self) -> u64 {
        self.ip
    }

    #[inline]
    pub fn fp(&self) -> u64 {
        self.fp
    }

    /// Bytecode offset of the instruction in progress. `None` inside the
    /// prologue.
    #[inline]
    pub fn bytecode_offset(&self) -> Option<u32> {
        self.code.bytecode_offset(self.ip)
    }

    /// Stack addresses of every slot holding a reference at `ip`.
    ///
    /// A missing or mis-sized root map means the collector can no longer
    /// scan this stack, which is fatal.
    pub fn root_addresses(&self) -> impl Iterator<Item = u64> + '_ {
        let layout = self.code.layout();
        let bitmap = match self.code.root_map(self.ip) {
            Some(bitmap) if bitmap.len() == layout.slot_count() => bitmap,
            found => {
                tracing::error!(
                    method = %self.method(),
                    ip = format_args!("{:#x}", self.ip),
                    found = found.map(|b| b.len()),
                    expected = layout.slot_count(),
                    "no usable root map for frame"
                );
                panic!(
                    "frame map inconsistency in {} at {:#x}",
                    self.method(),
                    self.ip
                );
            }
        };
        bitmap
            .iter_ones()
            .map(move |slot| slot_address(self.fp, layout.offset(slot)))
    }

    /// Object held in the lock slot, for synchronized methods past their
    /// prologue.
    pub fn held_monitor<M: StackMemory + ?Sized>(&self, stack: &M) -> Option<u64> {
        let slot = self.code.layout().lock_slot()?;
        self.bytecode_offset()?;
        Some(stack.read(slot_address(self.fp, self.code.layout().offset(slot))))
    }
}

/// Iterator over the compiled frames of one call trace, innermost first.
pub struct FrameWalker<'a, M: ?Sized> {
    jit: &'a Jit,
    stack: &'a M,
    ip: u64,
    fp: u64,
    boundary: u64,
}

impl<'a, M: StackMemory + ?Sized> FrameWalker<'a, M> {
    pub fn new(jit: &'a Jit, stack: &'a M, ip: u64, fp: u64) -> Self {
        Self {
            jit,
            stack,
            ip,
            fp,
            boundary: jit.thunks().address(ThunkKind::InvocationReturn),
        }
    }

    /// Return address and frame pointer the walk will look at next. Once
    /// the walk is exhausted this is the state of the trace boundary.
    #[inline]
    pub fn position(&self) -> (u64, u64) {
        (self.ip, self.fp)
    }

    #[inline]
    pub fn at_boundary(&self) -> bool {
        self.ip == self.boundary
    }
}

impl<M: StackMemory + ?Sized> Iterator for FrameWalker<'_, M> {
    type Item = JitFrame;

    fn next(&mut self) -> Option<JitFrame> {
        if self.at_boundary() {
            return None;
        }
        let Some(code) = self.jit.find_code(self.ip) else {
            tracing::error!(
                ip = format_args!("{:#x}", self.ip),
                fp = format_args!("{:#x}", self.fp),
                "return address is not in any compiled method"
            );
            panic!("stack walk reached unmapped code address {:#x}", self.ip);
        };
        let frame = JitFrame {
            code,
            ip: self.ip,
            fp: self.fp,
        };
        self.ip = self
            .stack
            .read(slot_address(self.fp, RETURN_ADDRESS_OFFSET));
        self.fp = self.stack.read(self.fp);
        Some(frame)
    }
}

// =============================================================================
// Unwinding
// =============================================================================

/// Runtime services the unwinder needs.
pub trait UnwindHooks {
    /// Whether `exception` is an instance of `catch_type`. Types that cannot
    /// be resolved catch nothing.
    fn catches(&mut self, catch_type: &ClassRef, exception: u64) -> bool;

    /// Release a monitor held by a frame being discarded.
    fn release_monitor(&mut self, object: u64);
}

/// Where control continues after an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindTarget {
    /// A handler in a compiled frame. The exception is in operand slot 0.
    Handler(FrameState),
    /// No frame of this trace handles the exception; resume at the trace
    /// boundary as if the outermost frame had returned.
    Boundary(FrameState),
}

impl UnwindTarget {
    #[inline]
    pub fn state(&self) -> FrameState {
        match *self {
            UnwindTarget::Handler(state) | UnwindTarget::Boundary(state) => state,
        }
    }

    #[inline]
    pub fn is_handled(&self) -> bool {
        matches!(self, UnwindTarget::Handler(_))
    }
}

/// First handler of `frame` covering its current offset that catches
/// `exception`, as an absolute address.
fn find_handler<H: UnwindHooks + ?Sized>(frame: &JitFrame, exception: u64, hooks: &mut H) -> Option<u64> {
    let offset = frame.bytecode_offset()?;
    let body = frame.method().code()?;
    body.handlers.iter().enumerate().find_map(|(index, handler)| {
        if !handler.covers(offset) {
            return None;
        }
        let address = frame.code().handler_address(index)?;
        let matches = match &handler.catch_type {
            None => true,
            Some(catch_type) => hooks.catches(catch_type, exception),
        };
        matches.then_some(address)
    })
}

/// Unwind from `start` until a handler accepts `exception` or the trace
/// boundary is reached.
///
/// `start.ip` is the return address into the innermost compiled frame and
/// `start.fp` its frame pointer. Monitors of every discarded synchronized
/// frame are released.
pub fn unwind<M, H>(jit: &Jit, stack: &mut M, start: FrameState, exception: u64, hooks: &mut H) -> UnwindTarget
where
    M: StackMemory + ?Sized,
    H: UnwindHooks + ?Sized,
{
    let mut sp = start.sp;
    let found = {
        let mut walker = FrameWalker::new(jit, &*stack, start.ip, start.fp);
        let mut found = None;
        while let Some(frame) = walker.next() {
            if let Some(address) = find_handler(&frame, exception, hooks) {
                found = Some((frame, address));
                break;
            }
            if let Some(object) = frame.held_monitor(&*stack) {
                hooks.release_monitor(object);
            }
            tracing::trace!(method = %frame.method(), "frame discarded by unwind");
            // Where sp stands once this frame has returned.
            sp = slot_address(frame.fp(), RETURN_ADDRESS_OFFSET + 1);
        }
        match found {
            Some(found) => Ok(found),
            None => Err(walker.position()),
        }
    };

    match found {
        Ok((frame, address)) => {
            let layout = frame.code().layout();
            let slot = layout.offset(layout.stack_slot(0));
            stack.write(slot_address(frame.fp(), slot), exception);
            tracing::trace!(
                method = %frame.method(),
                handler = format_args!("{address:#x}"),
                "exception handler found"
            );
            UnwindTarget::Handler(FrameState {
                ip: address,
                fp: frame.fp(),
                sp: slot_address(frame.fp(), layout.bottom_offset()),
            })
        }
        Err((ip, fp)) => UnwindTarget::Boundary(FrameState { ip, fp, sp }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::JitOptions;
    use crate::error::ResolveError;
    use crate::model::{Class, ClassId, InvokeKind, MethodId, MethodParts, ResolvedField, Resolver};
    use corvus_bytecode::{
        CodeBody, CodeBuilder, FieldRef, Instruction, MethodDescriptor, MethodFlags, MethodRef,
    };

    /// Flat stack; addresses are indices.
    struct VecStack(Vec<u64>);

    impl StackMemory for VecStack {
        fn read(&self, address: u64) -> u64 {
            self.0[address as usize]
        }

        fn write(&mut self, address: u64, value: u64) {
            self.0[address as usize] = value;
        }

        fn limit(&self) -> u64 {
            0
        }
    }

    struct Empty;

    impl Resolver for Empty {
        fn resolve_class(&self, name: &str) -> Result<Arc<Class>, ResolveError> {
            Err(ResolveError::ClassNotFound(name.to_string()))
        }

        fn resolve_method(&self, r: &MethodRef, _: InvokeKind) -> Result<Arc<Method>, ResolveError> {
            Err(ResolveError::ClassNotFound(r.class.to_string()))
        }

        fn resolve_field(&self, r: &FieldRef, _: bool) -> Result<ResolvedField, ResolveError> {
            Err(ResolveError::ClassNotFound(r.class.to_string()))
        }

        fn intern_string(&self, _: &str) -> Result<u64, ResolveError> {
            Ok(1)
        }
    }

    #[derive(Default)]
    struct Recorder {
        released: Vec<u64>,
        asked: Vec<String>,
        catches: bool,
    }

    impl UnwindHooks for Recorder {
        fn catches(&mut self, catch_type: &ClassRef, _: u64) -> bool {
            self.asked.push(catch_type.name().to_string());
            self.catches
        }

        fn release_monitor(&mut self, object: u64) {
            self.released.push(object);
        }
    }

    fn compile(jit: &Jit, descriptor: &str, flags: MethodFlags, code: CodeBody) -> Arc<CompiledCode> {
        let method = Arc::new(Method::new(
            MethodParts {
                id: MethodId(0),
                class: ClassId(1),
                class_name: Arc::from("t/T"),
                name: Arc::from("m"),
                descriptor: Arc::from(descriptor),
                signature: MethodDescriptor::parse(descriptor).unwrap(),
                flags,
                code: Some(code),
                vtable_index: None,
            },
            jit.initial_address(flags),
        ));
        jit.compile(&method, &Empty).unwrap();
        method.compiled().unwrap().clone()
    }

    /// `a / b` inside a try range with two handlers.
    fn guarded_division() -> CodeBody {
        let mut b = CodeBuilder::new(2);
        let start = b.create_label();
        let end = b.create_label();
        let specific = b.create_label();
        let any = b.create_label();
        b.bind_label(start);
        b.emit_all([Instruction::ILoad(0), Instruction::ILoad(1), Instruction::IDiv]);
        b.bind_label(end);
        b.emit(Instruction::IReturn);
        b.bind_label(specific);
        b.emit_all([Instruction::Pop, Instruction::IConst(-1), Instruction::IReturn]);
        b.bind_label(any);
        b.emit_all([Instruction::Pop, Instruction::IConst(-2), Instruction::IReturn]);
        b.add_handler(start, end, specific, Some("lang/ArithmeticError"));
        b.add_handler(start, end, any, None);
        b.finish().unwrap()
    }

    /// Lay out one frame for `code` whose caller is the trace boundary.
    fn frame(jit: &Jit, stack: &mut VecStack, fp: u64) {
        stack.0[fp as usize] = 0;
        stack.0[fp as usize + 1] = jit.thunks().address(ThunkKind::InvocationReturn);
    }

    fn stub_return(code: &CompiledCode) -> u64 {
        code.start() + u64::from(code.root_maps()[0].0)
    }

    #[test]
    fn test_first_matching_handler_wins() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let code = compile(&jit, "(II)I", MethodFlags::STATIC, guarded_division());
        let mut stack = VecStack(vec![0; 64]);
        frame(&jit, &mut stack, 40);
        let start = FrameState {
            ip: stub_return(&code),
            fp: 40,
            sp: 30,
        };

        let mut hooks = Recorder {
            catches: true,
            ..Default::default()
        };
        let target = unwind(&jit, &mut stack, start, 0x77, &mut hooks);
        assert!(target.is_handled());
        assert_eq!(Some(target.state().ip), code.handler_address(0));
        assert_eq!(hooks.asked, vec!["lang/ArithmeticError".to_string()]);
        let slot0 = slot_address(40, code.layout().offset(code.layout().stack_slot(0)));
        assert_eq!(stack.read(slot0), 0x77);
    }

    #[test]
    fn test_catch_all_after_failed_match() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let code = compile(&jit, "(II)I", MethodFlags::STATIC, guarded_division());
        let mut stack = VecStack(vec![0; 64]);
        frame(&jit, &mut stack, 40);
        let start = FrameState {
            ip: stub_return(&code),
            fp: 40,
            sp: 30,
        };

        let mut hooks = Recorder::default();
        let target = unwind(&jit, &mut stack, start, 0x77, &mut hooks);
        assert_eq!(Some(target.state().ip), code.handler_address(1));
    }

    #[test]
    fn test_unhandled_reaches_boundary_and_releases_monitor() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let mut b = CodeBuilder::new(1);
        b.emit_all([Instruction::ALoad(0), Instruction::AThrow]);
        let code = compile(&jit, "()V", MethodFlags::SYNCHRONIZED, b.finish().unwrap());
        let layout = *code.layout();
        let mut stack = VecStack(vec![0; 64]);
        frame(&jit, &mut stack, 40);
        let lock = layout.lock_slot().unwrap();
        stack.write(slot_address(40, layout.offset(lock)), 0x55);

        // The throw is the last trace point; the prologue's lock is the first.
        let throw_return = code.start() + u64::from(code.root_maps().last().unwrap().0);
        let start = FrameState {
            ip: throw_return,
            fp: 40,
            sp: 30,
        };
        let mut hooks = Recorder::default();
        let target = unwind(&jit, &mut stack, start, 0x77, &mut hooks);

        assert!(!target.is_handled());
        assert_eq!(
            target.state(),
            FrameState {
                ip: jit.thunks().address(ThunkKind::InvocationReturn),
                fp: 0,
                sp: 42,
            }
        );
        assert_eq!(hooks.released, vec![0x55]);
    }

    #[test]
    fn test_walker_follows_frame_chain() {
        let jit = Jit::new(JitOptions::default()).unwrap();
        let code = compile(&jit, "(II)I", MethodFlags::STATIC, guarded_division());
        let ip = stub_return(&code);
        let mut stack = VecStack(vec![0; 64]);
        // Two activations of the same method, the outer one at fp 50.
        frame(&jit, &mut stack, 50);
        stack.write(30, 50);
        stack.write(31, ip);

        let mut walker = FrameWalker::new(&jit, &stack, ip, 30);
        let frames: Vec<u64> = walker.by_ref().map(|f| f.fp()).collect();
        assert_eq!(frames, vec![30, 50]);
        assert!(walker.at_boundary());
        assert_eq!(walker.position().1, 0);
    }
}
