//! Executor for the portable instruction set.
//!
//! One [`Machine`] runs one activation of compiled code on a thread's
//! native stack, from an entry state until the invocation-return thunk
//! halts it or an exception unwinds past the trace boundary.
//!
//! ```text
//!        ┌──────── fetch (block cache, method tree on miss) ◄──────┐
//!        ▼                                                         │
//!  Move/Binary/Branch ... ─────────────────────────── ip += 1 ─────┤
//!  Call/TailCall ───── site table / vtable / thunk ── ip = entry ──┤
//!  Runtime ─────────── traps ──┬─ Next ───────────── ip += 1 ──────┤
//!                              ├─ Transfer ───────── (ip,fp,sp) ───┘
//!                              └─ Exit
//!  Halt ─────────────────────────────────────────── Exit::Returned(R0)
//! ```
//!
//! Registers live in the machine, frames live on the stack. A machine is
//! never shared: it borrows its thread's context for the whole run.

use crate::error::VmError;
use crate::runtime::Runtime;
use crate::thread::ContextGuard;
use corvus_gc::HeapError;
use corvus_jit::backend::{BinaryOp, CallTarget, Cond, Inst, Operand, Reg, UnaryOp, Width};
use corvus_jit::frame::{FRAME_HEADER_WORDS, RETURN_ADDRESS_OFFSET};
use corvus_jit::unwind::slot_address;
use corvus_jit::{ClassId, CodeBlock, CompiledCode, FrameState, StackMemory};
use smallvec::SmallVec;
use std::sync::Arc;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    /// The outermost frame returned; the value is `R0`.
    Returned(u64),
    /// An exception reached the trace boundary.
    Threw(u64),
}

/// What to do after a runtime trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Continue with the next instruction.
    Next,
    /// Continue at a new machine state.
    Transfer(FrameState),
    Exit(Exit),
}

pub(crate) struct Machine<'a, 'g> {
    pub(crate) rt: &'a Runtime,
    pub(crate) ctx: &'a mut ContextGuard<'g>,
    pub(crate) regs: [u64; Reg::COUNT],
    pub(crate) ip: u64,
    pub(crate) fp: u64,
    pub(crate) sp: u64,
    block: Arc<CodeBlock>,
    /// Compiled code owning `block`; `None` while inside the thunks.
    pub(crate) code: Option<Arc<CompiledCode>>,
}

impl<'a, 'g> Machine<'a, 'g> {
    pub(crate) fn new(rt: &'a Runtime, ctx: &'a mut ContextGuard<'g>, state: FrameState) -> Self {
        Self {
            rt,
            ctx,
            regs: [0; Reg::COUNT],
            ip: state.ip,
            fp: state.fp,
            sp: state.sp,
            block: rt.jit().thunks().block().clone(),
            code: None,
        }
    }

    #[inline]
    pub(crate) fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.index()]
    }

    #[inline]
    pub(crate) fn set_reg(&mut self, reg: Reg, value: u64) {
        self.regs[reg.index()] = value;
    }

    /// Run until the activation exits.
    pub(crate) fn run(&mut self) -> Result<Exit, VmError> {
        loop {
            let inst = self.fetch();
            match inst {
                Inst::Move { dst, src } => {
                    let value = self.read(src)?;
                    self.write(dst, value)?;
                    self.ip += 1;
                }
                Inst::Binary {
                    op,
                    width,
                    dst,
                    lhs,
                    rhs,
                } => {
                    let value = binary(op, width, self.read(lhs)?, self.read(rhs)?);
                    self.set_reg(dst, value);
                    self.ip += 1;
                }
                Inst::Unary { op, dst, src } => {
                    let value = self.read(src)? as i64;
                    let result = match op {
                        UnaryOp::Neg => value.wrapping_neg(),
                        UnaryOp::Truncate32 => i64::from(value as i32),
                    };
                    self.set_reg(dst, result as u64);
                    self.ip += 1;
                }
                Inst::Branch {
                    cond,
                    width,
                    lhs,
                    rhs,
                    displacement,
                } => {
                    let taken = compare(cond, width, self.read(lhs)?, self.read(rhs)?);
                    self.ip += 1;
                    if taken {
                        self.ip = self.ip.wrapping_add_signed(i64::from(displacement));
                    }
                }
                Inst::Jump { displacement } => {
                    self.ip = (self.ip + 1).wrapping_add_signed(i64::from(displacement));
                }
                Inst::JumpIndirect { target } => {
                    self.ip = self.read(target)?;
                }
                Inst::Call { target, args_at } => self.call(target, args_at)?,
                Inst::TailCall {
                    target,
                    args_at,
                    argc,
                    caller_params,
                } => self.tail_call(target, args_at, argc, caller_params)?,
                Inst::Runtime { routine } => match self.trap(routine)? {
                    Step::Next => self.ip += 1,
                    Step::Transfer(state) => self.transfer(state),
                    Step::Exit(exit) => return Ok(exit),
                },
                Inst::Enter { frame_words } => {
                    if let Some(step) = self.enter(frame_words)? {
                        match step {
                            Step::Transfer(state) => self.transfer(state),
                            Step::Exit(exit) => return Ok(exit),
                            Step::Next => self.ip += 1,
                        }
                    }
                }
                Inst::Leave => {
                    self.sp = self.fp;
                    self.fp = self.ctx.stack.read(self.fp);
                    self.sp += 1;
                    self.ip += 1;
                }
                Inst::Return => {
                    self.ip = self.ctx.stack.read(self.sp);
                    self.sp += 1;
                }
                Inst::Safepoint => {
                    self.safepoint_poll()?;
                    self.ip += 1;
                }
                Inst::Halt => return Ok(Exit::Returned(self.reg(Reg::R0))),
            }
        }
    }

    pub(crate) fn transfer(&mut self, state: FrameState) {
        self.ip = state.ip;
        self.fp = state.fp;
        self.sp = state.sp;
    }

    // -------------------------------------------------------------------------
    // Fetch
    // -------------------------------------------------------------------------

    fn fetch(&mut self) -> Inst {
        if let Some(&inst) = self.block.at(self.ip) {
            return inst;
        }
        let jit = self.rt.jit();
        if jit.thunks().contains(self.ip) {
            self.block = jit.thunks().block().clone();
            self.code = None;
        } else if let Some(code) = jit.find_code(self.ip) {
            self.block = code.block().clone();
            self.code = Some(code);
        } else {
            self.fatal("jump to an address outside every code block");
        }
        match self.block.at(self.ip) {
            Some(&inst) => inst,
            None => self.fatal("code block does not contain the address it was found by"),
        }
    }

    /// Report a broken machine invariant and abort.
    pub(crate) fn fatal(&self, what: &str) -> ! {
        tracing::error!(
            ip = format_args!("{:#x}", self.ip),
            fp = format_args!("{:#x}", self.fp),
            sp = format_args!("{:#x}", self.sp),
            "{what}"
        );
        panic!("machine fault at {:#x}: {what}", self.ip);
    }

    // -------------------------------------------------------------------------
    // Operands
    // -------------------------------------------------------------------------

    fn read(&self, operand: Operand) -> Result<u64, VmError> {
        let heap = self.rt.heap();
        let value = match operand {
            Operand::Reg(reg) => self.reg(reg),
            Operand::Imm(value) => value as u64,
            Operand::Frame(offset) => self.ctx.stack.read(slot_address(self.fp, offset)),
            Operand::Pool(index) => match self.code.as_ref().and_then(|c| c.pool_entry(index)) {
                Some(value) => value,
                None => self.fatal("object pool entry out of range"),
            },
            Operand::Field { base, index } => heap
                .read_field(self.reg(base), index)
                .map_err(|err| self.heap_fault(err))?,
            Operand::Element { base, index } => heap
                .read_element(self.reg(base), self.reg(index) as i64)
                .map_err(|err| self.heap_fault(err))?,
            Operand::Length(reg) => heap
                .array_length(self.reg(reg))
                .map_err(|err| self.heap_fault(err))? as u64,
        };
        Ok(value)
    }

    fn write(&mut self, operand: Operand, value: u64) -> Result<(), VmError> {
        let heap = self.rt.heap();
        match operand {
            Operand::Reg(reg) => self.set_reg(reg, value),
            Operand::Frame(offset) => {
                let address = slot_address(self.fp, offset);
                self.ctx.stack.write(address, value);
            }
            Operand::Field { base, index } => heap
                .write_field(self.reg(base), index, value)
                .map_err(|err| self.heap_fault(err))?,
            Operand::Element { base, index } => heap
                .write_element(self.reg(base), self.reg(index) as i64, value)
                .map_err(|err| self.heap_fault(err))?,
            Operand::Imm(_) | Operand::Pool(_) | Operand::Length(_) => {
                self.fatal("store to a read-only operand")
            }
        }
        Ok(())
    }

    /// Guards run before every heap access, so only a dangling reference
    /// is unexpected enough to be fatal.
    pub(crate) fn heap_fault(&self, err: HeapError) -> VmError {
        if let HeapError::Dangling(_) = err {
            self.fatal(&format!("heap access through a freed reference: {err}"));
        }
        VmError::Heap(err)
    }

    // -------------------------------------------------------------------------
    // Calls and frames
    // -------------------------------------------------------------------------

    /// Where a call to `target` from return address `site` jumps, reading
    /// the receiver at `fp + args_at + argc - 1` for virtual calls.
    fn call_entry(&mut self, target: CallTarget, site: u64, args_at: i32) -> Result<u64, VmError> {
        let jit = self.rt.jit();
        match target {
            CallTarget::Site => match jit.find_call(site) {
                Some(node) => Ok(node.resolved()),
                None => self.fatal("call without a call-site entry"),
            },
            CallTarget::Virtual { vtable_index, argc } => {
                let receiver_at = slot_address(self.fp, args_at + i32::from(argc) - 1);
                let receiver = self.ctx.stack.read(receiver_at);
                let class = self
                    .rt
                    .heap()
                    .class_of(receiver)
                    .map_err(|err| self.heap_fault(err))?;
                self.set_reg(Reg::ThunkClass, u64::from(class));
                self.set_reg(Reg::ThunkIndex, u64::from(vtable_index));
                let entry = self
                    .rt
                    .classes()
                    .by_id(ClassId(class))
                    .and_then(|c| c.vtable().get(vtable_index as usize).map(|e| e.address()));
                match entry {
                    Some(address) => Ok(address),
                    None => self.fatal("virtual call through a missing vtable slot"),
                }
            }
            CallTarget::Thunk(kind) => Ok(jit.thunks().address(kind)),
        }
    }

    fn call(&mut self, target: CallTarget, args_at: i32) -> Result<(), VmError> {
        let site = self.ip + 1;
        let entry = self.call_entry(target, site, args_at)?;
        let slot = slot_address(self.fp, args_at - 1);
        self.ctx.stack.write(slot, site);
        self.sp = slot;
        self.set_reg(Reg::Site, site);
        self.ip = entry;
        Ok(())
    }

    /// Replace the current frame: move the arguments into the caller's
    /// argument area and jump with the caller's return address.
    fn tail_call(
        &mut self,
        target: CallTarget,
        args_at: i32,
        argc: u16,
        caller_params: u16,
    ) -> Result<(), VmError> {
        let site = self.ip + 1;
        let entry = self.call_entry(target, site, args_at)?;
        let stack = &mut self.ctx.stack;
        let args: SmallVec<[u64; 8]> = (0..i32::from(argc))
            .map(|i| stack.read(slot_address(self.fp, args_at + i)))
            .collect();
        let return_address = stack.read(slot_address(self.fp, RETURN_ADDRESS_OFFSET));
        let saved_fp = stack.read(self.fp);

        let top = slot_address(self.fp, FRAME_HEADER_WORDS + i32::from(caller_params));
        let first = top - u64::from(argc);
        for (i, &word) in args.iter().enumerate() {
            stack.write(first + i as u64, word);
        }
        let slot = first - 1;
        stack.write(slot, return_address);

        self.sp = slot;
        self.fp = saved_fp;
        self.set_reg(Reg::Site, site);
        self.ip = entry;
        Ok(())
    }

    /// Push a frame of `frame_words` below the return address at `sp`.
    /// Returns a step only if the frame does not fit.
    fn enter(&mut self, frame_words: u32) -> Result<Option<Step>, VmError> {
        let fp = self.sp - 1;
        let fits = fp
            .checked_sub(u64::from(frame_words))
            .is_some_and(|bottom| bottom >= self.ctx.stack.limit());
        if !fits {
            let from = FrameState {
                ip: self.ctx.stack.read(self.sp),
                fp: self.fp,
                sp: self.sp + 1,
            };
            tracing::debug!(thread = self.ctx.id().0, frame_words, "native stack exhausted");
            return self
                .raise(crate::classes::names::STACK_OVERFLOW_ERROR, None, from)
                .map(Some);
        }
        self.ctx.stack.write(fp, self.fp);
        self.fp = fp;
        self.sp = fp - u64::from(frame_words);
        self.ip += 1;
        Ok(None)
    }
}

// =============================================================================
// Arithmetic
// =============================================================================

fn binary(op: BinaryOp, width: Width, lhs: u64, rhs: u64) -> u64 {
    match width {
        Width::W64 => binary64(op, lhs as i64, rhs as i64) as u64,
        Width::W32 => i64::from(binary32(op, lhs as i32, rhs as i32)) as u64,
    }
}

fn binary64(op: BinaryOp, a: i64, b: i64) -> i64 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        // Divisors are checked by guard code.
        BinaryOp::Div => a.checked_div(b).unwrap_or(a),
        BinaryOp::Rem => a.checked_rem(b).unwrap_or(0),
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl((b & 63) as u32),
        BinaryOp::Shr => a.wrapping_shr((b & 63) as u32),
        BinaryOp::UShr => ((a as u64) >> (b & 63)) as i64,
        BinaryOp::Cmp => a.cmp(&b) as i64,
    }
}

fn binary32(op: BinaryOp, a: i32, b: i32) -> i32 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.checked_div(b).unwrap_or(a),
        BinaryOp::Rem => a.checked_rem(b).unwrap_or(0),
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => a.wrapping_shl((b & 31) as u32),
        BinaryOp::Shr => a.wrapping_shr((b & 31) as u32),
        BinaryOp::UShr => ((a as u32) >> (b & 31)) as i32,
        BinaryOp::Cmp => a.cmp(&b) as i32,
    }
}

fn compare(cond: Cond, width: Width, lhs: u64, rhs: u64) -> bool {
    let (signed, unsigned) = match width {
        Width::W64 => ((lhs as i64).cmp(&(rhs as i64)), lhs.cmp(&rhs)),
        Width::W32 => (
            (lhs as i32).cmp(&(rhs as i32)),
            (lhs as u32).cmp(&(rhs as u32)),
        ),
    };
    match cond {
        Cond::Eq => signed.is_eq(),
        Cond::Ne => signed.is_ne(),
        Cond::Lt => signed.is_lt(),
        Cond::Ge => signed.is_ge(),
        Cond::Gt => signed.is_gt(),
        Cond::Le => signed.is_le(),
        Cond::Below => unsigned.is_lt(),
        Cond::AboveOrEqual => unsigned.is_ge(),
    }
}
