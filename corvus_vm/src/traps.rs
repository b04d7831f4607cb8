//! Runtime routines reached through `Runtime` instructions.
//!
//! A trap either runs inside a compiled method (allocation, casts, monitors,
//! `athrow`) or inside a thunk that compiled code called (lazy compilation,
//! native calls, guard failures). The two differ in where the innermost
//! compiled frame is:
//!
//! ```text
//!  compiled trap   ip+1 is a traced offset of the current frame
//!  thunk trap      [sp] holds the return address into the caller;
//!                  the call's arguments sit just above it
//! ```
//!
//! Every place a trap may let a collection run is a poll: the activation
//! is first suspended at a walkable state, so the registers never hold the
//! only copy of a reference.

use crate::classes::names;
use crate::error::{NativeError, VmError};
use crate::machine::{Exit, Machine, Step};
use crate::runtime::Runtime;
use crate::thread::{PendingArgs, ThreadId, WalkStart};
use corvus_bytecode::ClassRef;
use corvus_jit::backend::{Reg, RuntimeRoutine};
use corvus_jit::unwind::unwind;
use corvus_jit::{
    CallFlags, ClassId, CompileError, FrameState, Method, ResolveError, StackMemory, ThunkKind,
    UnwindHooks, UnwindTarget,
};
use parking_lot::MutexGuard;
use smallvec::SmallVec;
use std::sync::Arc;

impl Machine<'_, '_> {
    /// Run `routine` for the instruction at `ip`.
    pub(crate) fn trap(&mut self, routine: RuntimeRoutine) -> Result<Step, VmError> {
        match routine {
            RuntimeRoutine::CompileCallee => self.compile_callee(),
            RuntimeRoutine::CompileVirtualCallee => self.compile_virtual_callee(),
            RuntimeRoutine::InvokeNative => self.invoke_native(),
            RuntimeRoutine::ThrowArrayBounds => {
                let array = self.reg(Reg::R1);
                let index = self.reg(Reg::R2) as i64;
                let len = self
                    .rt
                    .heap()
                    .array_length(array)
                    .map_err(|err| self.heap_fault(err))?;
                let message = format!("index {index} out of bounds for length {len}");
                self.raise(names::ARRAY_INDEX_ERROR, Some(message), self.origin())
            }
            RuntimeRoutine::ThrowNullPointer => {
                self.raise(names::NULL_POINTER_ERROR, None, self.origin())
            }
            RuntimeRoutine::ThrowDivideByZero => self.raise(
                names::ARITHMETIC_ERROR,
                Some("/ by zero".to_string()),
                self.origin(),
            ),
            RuntimeRoutine::New { class } => {
                let class = self.class(class);
                self.poll(self.walk_start(None));
                let object = self
                    .rt
                    .heap()
                    .alloc_instance(class.id().0, class.ref_map().clone());
                self.set_reg(Reg::R0, object.raw());
                Ok(Step::Next)
            }
            RuntimeRoutine::NewArray { kind, class } => {
                let len = self.reg(Reg::R1) as i32;
                if len < 0 {
                    return self.raise(
                        names::NEGATIVE_ARRAY_SIZE_ERROR,
                        Some(len.to_string()),
                        self.origin(),
                    );
                }
                self.poll(self.walk_start(None));
                let array = self.rt.heap().alloc_array(class.0, kind, len as usize);
                self.set_reg(Reg::R0, array.raw());
                Ok(Step::Next)
            }
            RuntimeRoutine::Throw => match self.reg(Reg::R1) {
                0 => self.raise(names::NULL_POINTER_ERROR, None, self.origin()),
                exception => Ok(self.throw(exception, self.origin())),
            },
            RuntimeRoutine::MonitorEnter => self.monitor_enter(),
            RuntimeRoutine::MonitorExit => {
                let object = self.reg(Reg::R1);
                if object == 0 {
                    return self.raise(names::NULL_POINTER_ERROR, None, self.origin());
                }
                match self.rt.monitors().exit(object, self.ctx.id()) {
                    Ok(()) => Ok(Step::Next),
                    Err(err) => self.raise(
                        names::ILLEGAL_MONITOR_STATE_ERROR,
                        Some(err.to_string()),
                        self.origin(),
                    ),
                }
            }
            RuntimeRoutine::CheckCast { class } => {
                let object = self.reg(Reg::R1);
                if object == 0 || self.is_instance(object, class)? {
                    return Ok(Step::Next);
                }
                let from = self.class_name_of(object)?;
                let to = self.class(class);
                let message = format!("{from} cannot be cast to {}", to.name());
                self.raise(names::CLASS_CAST_ERROR, Some(message), self.origin())
            }
            RuntimeRoutine::InstanceOf { class } => {
                let object = self.reg(Reg::R1);
                let result = object != 0 && self.is_instance(object, class)?;
                self.set_reg(Reg::R0, u64::from(result));
                Ok(Step::Next)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trap origin
    // -------------------------------------------------------------------------

    /// State of the innermost compiled frame, as exception unwinding wants it.
    fn origin(&self) -> FrameState {
        if self.code.is_some() {
            FrameState {
                ip: self.ip + 1,
                fp: self.fp,
                sp: self.sp,
            }
        } else {
            FrameState {
                ip: self.ctx.stack.read(self.sp),
                fp: self.fp,
                sp: self.sp + 1,
            }
        }
    }

    /// Walkable state for a poll at this trap.
    fn walk_start(&self, pending: Option<PendingArgs>) -> WalkStart {
        let ip = if self.code.is_some() {
            self.ip + 1
        } else {
            self.ctx.stack.read(self.sp)
        };
        WalkStart {
            ip,
            fp: self.fp,
            sp: self.sp,
            pending,
        }
    }

    /// Arguments of the call that entered the current thunk.
    fn pending(&self, method: &Arc<Method>) -> PendingArgs {
        PendingArgs {
            first: self.sp + 1,
            method: method.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Safepoints
    // -------------------------------------------------------------------------

    pub(crate) fn safepoint_poll(&mut self) -> Result<(), VmError> {
        let at = WalkStart {
            ip: self.ip + 1,
            fp: self.fp,
            sp: self.sp,
            pending: None,
        };
        self.poll(at);
        Ok(())
    }

    /// Stop here if a collection is pending, or run it if the heap asks for
    /// one.
    pub(crate) fn poll(&mut self, at: WalkStart) {
        let rt = self.rt;
        let collect = rt.heap().needs_collection();
        if !collect && !rt.safepoint().is_requested() {
            return;
        }
        self.ctx.suspend(at);
        if collect {
            rt.collect_from(self.ctx);
        } else {
            MutexGuard::unlocked(self.ctx, || rt.safepoint().park());
        }
    }

    // -------------------------------------------------------------------------
    // Calls through thunks
    // -------------------------------------------------------------------------

    fn compile_callee(&mut self) -> Result<Step, VmError> {
        let jit = self.rt.jit();
        let Some(node) = jit.find_call(self.reg(Reg::Site)) else {
            self.fatal("compile thunk entered from an unknown call site");
        };
        let method = node.target().clone();
        self.poll(self.walk_start(Some(self.pending(&method))));
        match jit.compile(&method, self.rt) {
            Ok(address) => {
                jit.patch_call_site(&node, jit.thunks().address(ThunkKind::DefaultCompile), address);
                self.set_reg(Reg::R0, address);
                Ok(Step::Next)
            }
            Err(err) => self.compile_failed(err),
        }
    }

    fn compile_virtual_callee(&mut self) -> Result<Step, VmError> {
        let class = self.class(ClassId(self.reg(Reg::ThunkClass) as u32));
        let index = self.reg(Reg::ThunkIndex) as usize;
        let Some(entry) = class.vtable().get(index) else {
            self.fatal("virtual compile thunk entered with a missing vtable slot");
        };
        let method = entry.method().clone();
        self.poll(self.walk_start(Some(self.pending(&method))));
        match self.rt.jit().compile(&method, self.rt) {
            Ok(address) => {
                self.rt.jit().patch_vtable(entry, address);
                self.set_reg(Reg::R0, address);
                Ok(Step::Next)
            }
            Err(err) => self.compile_failed(err),
        }
    }

    fn compile_failed(&mut self, err: CompileError) -> Result<Step, VmError> {
        let class = match &err {
            CompileError::Resolve(err) => resolve_error_class(err),
            CompileError::Abstract(_) => names::ABSTRACT_METHOD_ERROR,
            CompileError::Malformed { .. } => names::VERIFY_ERROR,
            CompileError::Assembler(_) => names::INTERNAL_ERROR,
        };
        tracing::debug!(error = %err, exception = class, "callee could not be compiled");
        self.raise(class, Some(err.to_string()), self.origin())
    }

    fn invoke_native(&mut self) -> Result<Step, VmError> {
        let Some(node) = self.rt.jit().find_call(self.reg(Reg::Site)) else {
            self.fatal("native thunk entered from an unknown call site");
        };
        let method = if node.flags().contains(CallFlags::VIRTUAL) {
            let class = self.class(ClassId(self.reg(Reg::ThunkClass) as u32));
            match class.vtable().get(self.reg(Reg::ThunkIndex) as usize) {
                Some(entry) => entry.method().clone(),
                None => self.fatal("native thunk entered with a missing vtable slot"),
            }
        } else {
            node.target().clone()
        };

        let at = self.walk_start(Some(self.pending(&method)));
        let first = self.sp + 1;
        let argc = u64::from(method.param_footprint());
        let args: SmallVec<[u64; 8]> = (0..argc)
            .map(|i| self.ctx.stack.read(first + (argc - 1 - i)))
            .collect();
        self.ctx.suspend(at.clone());
        self.poll(at);

        let from = self.origin();
        match self.rt.call_native(self.ctx, &method, &args) {
            Ok(value) => {
                self.set_reg(Reg::R0, value);
                Ok(Step::Next)
            }
            Err(NativeError::Throw(exception)) => Ok(self.throw(exception, from)),
            Err(NativeError::Raise { class, message }) => self.raise(&class, Some(message), from),
        }
    }

    // -------------------------------------------------------------------------
    // Monitors
    // -------------------------------------------------------------------------

    fn monitor_enter(&mut self) -> Result<Step, VmError> {
        let object = self.reg(Reg::R1);
        if object == 0 {
            return self.raise(names::NULL_POINTER_ERROR, None, self.origin());
        }
        let rt = self.rt;
        let thread = self.ctx.id();
        if !rt.monitors().try_enter(object, thread) {
            tracing::trace!(
                thread = thread.0,
                object = format_args!("{object:#x}"),
                "monitor contended"
            );
            let at = self.walk_start(None);
            self.ctx.suspend(at);
            MutexGuard::unlocked(self.ctx, || rt.monitors().enter(object, thread));
        }
        Ok(Step::Next)
    }

    // -------------------------------------------------------------------------
    // Exceptions
    // -------------------------------------------------------------------------

    /// Create an instance of `class` and throw it from `from`.
    pub(crate) fn raise(
        &mut self,
        class: &str,
        message: Option<String>,
        from: FrameState,
    ) -> Result<Step, VmError> {
        let exception = self.rt.new_exception(class, message.as_deref())?;
        Ok(self.throw(exception, from))
    }

    /// Unwind to the first handler for `exception`, or out of this
    /// activation.
    pub(crate) fn throw(&mut self, exception: u64, from: FrameState) -> Step {
        let mut hooks = Hooks {
            runtime: self.rt,
            thread: self.ctx.id(),
        };
        match unwind(self.rt.jit(), &mut self.ctx.stack, from, exception, &mut hooks) {
            UnwindTarget::Handler(state) => Step::Transfer(state),
            UnwindTarget::Boundary(_) => Step::Exit(Exit::Threw(exception)),
        }
    }

    // -------------------------------------------------------------------------
    // Classes
    // -------------------------------------------------------------------------

    fn class(&self, id: ClassId) -> Arc<corvus_jit::Class> {
        match self.rt.classes().by_id(id) {
            Some(class) => class,
            None => self.fatal(&format!("compiled code names unknown class {}", id.0)),
        }
    }

    fn is_instance(&self, object: u64, class: ClassId) -> Result<bool, VmError> {
        let id = self
            .rt
            .heap()
            .class_of(object)
            .map_err(|err| self.heap_fault(err))?;
        Ok(self.class(ClassId(id)).is_subclass_of(class))
    }

    fn class_name_of(&self, object: u64) -> Result<String, VmError> {
        let id = self
            .rt
            .heap()
            .class_of(object)
            .map_err(|err| self.heap_fault(err))?;
        Ok(self.class(ClassId(id)).name().to_string())
    }
}

/// Exception class raised for a resolution failure.
pub(crate) fn resolve_error_class(err: &ResolveError) -> &'static str {
    match err {
        ResolveError::ClassNotFound(_) => names::CLASS_NOT_FOUND_ERROR,
        ResolveError::MethodNotFound { .. } => names::NO_SUCH_METHOD_ERROR,
        ResolveError::FieldNotFound { .. } => names::NO_SUCH_FIELD_ERROR,
        ResolveError::IncompatibleChange(_) => names::INCOMPATIBLE_CLASS_CHANGE_ERROR,
    }
}

/// Catch-type checks and monitor release during unwinding.
struct Hooks<'a> {
    runtime: &'a Runtime,
    thread: ThreadId,
}

impl UnwindHooks for Hooks<'_> {
    fn catches(&mut self, catch_type: &ClassRef, exception: u64) -> bool {
        // A class nobody loaded has no instances.
        let Some(catch) = self.runtime.classes().by_name(catch_type.name()) else {
            return false;
        };
        self.runtime
            .heap()
            .class_of(exception)
            .ok()
            .and_then(|id| self.runtime.classes().by_id(ClassId(id)))
            .is_some_and(|class| class.is_subclass_of(catch.id()))
    }

    fn release_monitor(&mut self, object: u64) {
        if let Err(err) = self.runtime.monitors().exit(object, self.thread) {
            tracing::trace!(error = %err, "monitor of discarded frame was not held");
        }
    }
}
