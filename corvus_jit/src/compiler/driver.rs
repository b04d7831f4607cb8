//! Compilation driver.
//!
//! Translates a method's bytecode into backend operations in a single walk.
//! The walk follows control flow with an explicit worklist: every branch
//! forks the abstract frame into a pending item, and an instruction that has
//! already been translated is never translated again (the arrival is still
//! logged so the frame-map builder sees the merge).
//!
//! ```text
//! prologue ─► worklist ─► exception handlers ─► cold stubs
//!    │           │  ▲              │                 │
//!    │           └──┘ forks        │                 │
//!    ▼           ▼                 ▼                 ▼
//!  EventLog: Mark.. Ip Mark Clear Fork Trace .. Handler Ip ..
//! ```
//!
//! Operand-stack entries live in fixed frame slots, so every instruction is
//! lowered to moves between frame slots, registers and memory operands.

use super::JitOptions;
use super::event::{ContextId, Event, EventLog};
use super::state::{AbstractFrame, SlotType};
use crate::backend::{
    Assembler, BinaryOp, CallTarget, Cond, Inst, Label, Operand, PortableAssembler, Reg,
    RuntimeRoutine, UnaryOp, Width,
};
use crate::call_table::CallFlags;
use crate::error::CompileError;
use crate::frame::FrameLayout;
use crate::model::{ClassId, InvokeKind, Method, Resolver};
use crate::thunks::ThunkKind;
use corvus_bytecode::{ArrayKind, CodeBody, Instruction, MethodFlags, MethodRef, OBJECT_CLASS, TypeKind};
use corvus_gc::ElementKind;
use rustc_hash::FxHashMap;
use std::sync::Arc;

// =============================================================================
// Output
// =============================================================================

/// A call emitted into the method.
#[derive(Debug, Clone)]
pub struct CallElement {
    /// Native offset of the instruction after the call.
    pub offset: u32,
    pub target: Arc<Method>,
    pub flags: CallFlags,
}

/// Everything produced by translating one method, before placement.
#[derive(Debug)]
pub struct Translation {
    pub insts: Box<[Inst]>,
    pub layout: FrameLayout,
    pub log: EventLog,
    /// Arrivals per bytecode offset.
    pub visits: Vec<u16>,
    /// Native return offset of each trace point, indexed by trace id.
    pub trace_offsets: Vec<u32>,
    pub calls: Vec<CallElement>,
    pub pool: Vec<u64>,
    pub ip_map: Vec<(u32, u32)>,
    pub handlers: Vec<Option<u32>>,
}

impl Translation {
    #[inline]
    pub fn trace_count(&self) -> usize {
        self.trace_offsets.len()
    }
}

/// Translate `method`, resolving symbols through `resolver`.
pub fn translate(
    method: &Arc<Method>,
    resolver: &dyn Resolver,
    options: &JitOptions,
) -> Result<Translation, CompileError> {
    let Some(body) = method.code() else {
        return Err(CompileError::Malformed {
            method: method.to_string(),
            offset: 0,
            reason: "method has no code",
        });
    };
    let params = method.param_footprint();
    if body.is_empty() || params > body.max_locals {
        return Err(CompileError::Malformed {
            method: method.to_string(),
            offset: 0,
            reason: "parameters do not fit in locals",
        });
    }

    let layout = FrameLayout::new(params, body.max_locals, body.max_stack, method.is_synchronized());
    let mut driver = Driver::new(method, body, resolver, options, layout);

    let mut entry = AbstractFrame::new(body.max_locals);
    for (index, kind) in method.param_kinds().enumerate() {
        entry.set_local(index, kind.into());
    }
    driver.prologue(&entry)?;
    driver.run(
        WorkItem {
            ip: 0,
            frame: entry,
            context: 0,
        },
        false,
    )?;
    driver.drain()?;
    driver.exception_handlers()?;
    driver.emit_stubs();
    driver.finish()
}

// =============================================================================
// Driver
// =============================================================================

struct WorkItem {
    ip: u32,
    frame: AbstractFrame,
    context: ContextId,
}

/// Out-of-line guard failure path.
struct ColdStub {
    label: Label,
    kind: ThunkKind,
    trace: u32,
    ip: u32,
}

enum Flow {
    Next,
    Stop,
}

struct Driver<'a> {
    method: &'a Arc<Method>,
    body: &'a CodeBody,
    resolver: &'a dyn Resolver,
    options: &'a JitOptions,
    layout: FrameLayout,
    asm: PortableAssembler,
    log: EventLog,

    visits: Vec<u16>,
    depths: Vec<Option<u16>>,
    labels: Vec<Option<Label>>,
    native_offsets: Vec<Option<u32>>,
    local_snapshots: Vec<Option<Vec<SlotType>>>,
    worklist: Vec<WorkItem>,
    next_context: ContextId,

    traces: Vec<Option<u32>>,
    calls: Vec<CallElement>,
    stubs: Vec<ColdStub>,
    pool: Vec<u64>,
    pool_index: FxHashMap<u64, u32>,
    ip_map: Vec<(u32, u32)>,
    object_class: Option<ClassId>,
    ip: u32,
}

impl<'a> Driver<'a> {
    fn new(
        method: &'a Arc<Method>,
        body: &'a CodeBody,
        resolver: &'a dyn Resolver,
        options: &'a JitOptions,
        layout: FrameLayout,
    ) -> Self {
        let len = body.len();
        Self {
            method,
            body,
            resolver,
            options,
            layout,
            asm: PortableAssembler::new(),
            log: EventLog::new(),
            visits: vec![0; len],
            depths: vec![None; len],
            labels: vec![None; len],
            native_offsets: vec![None; len],
            local_snapshots: vec![None; len],
            worklist: Vec::new(),
            next_context: 1,
            traces: Vec::new(),
            calls: Vec::new(),
            stubs: Vec::new(),
            pool: Vec::new(),
            pool_index: FxHashMap::default(),
            ip_map: Vec::new(),
            object_class: None,
            ip: 0,
        }
    }

    fn malformed(&self, reason: &'static str) -> CompileError {
        CompileError::Malformed {
            method: self.method.to_string(),
            offset: self.ip,
            reason,
        }
    }

    // -------------------------------------------------------------------------
    // Walk
    // -------------------------------------------------------------------------

    fn prologue(&mut self, entry: &AbstractFrame) -> Result<(), CompileError> {
        for (slot, ty) in entry.locals().iter().enumerate() {
            if ty.is_reference() {
                self.log.push(Event::Mark(slot as u32));
            }
        }
        self.asm.enter(self.layout.frame_words());

        if let Some(lock_slot) = self.layout.lock_slot() {
            let lock = if self.method.is_static() {
                let class = self.resolver.resolve_class(self.method.class_name())?;
                Operand::Pool(self.pool_entry(class.statics()))
            } else {
                Operand::Frame(self.layout.offset(0))
            };
            self.asm.mov(Operand::Reg(Reg::R1), lock);
            self.asm
                .mov(Operand::Frame(self.layout.offset(lock_slot)), Operand::Reg(Reg::R1));
            self.log.push(Event::Mark(lock_slot as u32));
            self.runtime(RuntimeRoutine::MonitorEnter);
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<(), CompileError> {
        while let Some(item) = self.worklist.pop() {
            self.run(item, true)?;
        }
        Ok(())
    }

    /// Translate straight-line code starting at `item` until control leaves
    /// the path or reaches an instruction that was already translated.
    fn run(&mut self, item: WorkItem, resume: bool) -> Result<(), CompileError> {
        if resume {
            self.log.push(Event::Resume(item.context));
        }
        let WorkItem { mut ip, mut frame, .. } = item;
        let mut fell_through = false;

        loop {
            let index = ip as usize;
            if index >= self.body.len() {
                return Err(self.malformed("control falls off the end of the code"));
            }
            self.ip = ip;
            self.log.push(Event::Ip(ip));
            self.visits[index] = self.visits[index].saturating_add(1);

            if self.visits[index] > 1 {
                if self.depths[index] != Some(frame.depth() as u16) {
                    return Err(self.malformed("inconsistent stack depth at merge point"));
                }
                if let Some(snapshot) = &mut self.local_snapshots[index] {
                    for (mine, &theirs) in snapshot.iter_mut().zip(frame.locals()) {
                        *mine = mine.meet(theirs);
                    }
                }
                if fell_through {
                    let label = self.label(ip);
                    self.asm.jump(label);
                }
                return Ok(());
            }

            self.depths[index] = Some(frame.depth() as u16);
            self.local_snapshots[index] = Some(frame.locals().to_vec());
            let label = self.label(ip);
            self.asm.bind(label);
            let native = self.asm.offset();
            self.native_offsets[index] = Some(native);
            self.map_ip(native, ip);

            match self.instruction(ip, &mut frame)? {
                Flow::Next => {
                    ip += 1;
                    fell_through = true;
                }
                Flow::Stop => return Ok(()),
            }
        }
    }

    fn fork(&mut self, target: u32, frame: &AbstractFrame) -> Result<(), CompileError> {
        if target as usize >= self.body.len() {
            return Err(self.malformed("branch target out of range"));
        }
        let context = self.next_context;
        self.next_context += 1;
        self.log.push(Event::Fork(context));
        self.worklist.push(WorkItem {
            ip: target,
            frame: frame.clone(),
            context,
        });
        Ok(())
    }

    /// Start every handler whose protected range was reached, repeating
    /// until handler bodies reach no further protected ranges.
    fn exception_handlers(&mut self) -> Result<(), CompileError> {
        let body = self.body;
        let mut started = vec![false; body.handlers.len()];
        loop {
            let mut progressed = false;
            for (index, handler) in body.handlers.iter().enumerate() {
                if started[index] {
                    continue;
                }
                if handler.start >= handler.end
                    || handler.end as usize > body.len()
                    || handler.handler as usize >= body.len()
                {
                    self.ip = handler.start;
                    return Err(self.malformed("invalid exception handler range"));
                }
                let range = handler.start as usize..handler.end as usize;
                if !self.visits[range.clone()].iter().any(|&v| v > 0) {
                    continue;
                }
                started[index] = true;
                progressed = true;

                let mut frame = AbstractFrame::new(body.max_locals);
                let mut locals: Option<Vec<SlotType>> = None;
                for snapshot in self.local_snapshots[range].iter().flatten() {
                    match &mut locals {
                        Some(acc) => {
                            for (mine, &theirs) in acc.iter_mut().zip(snapshot) {
                                *mine = mine.meet(theirs);
                            }
                        }
                        None => locals = Some(snapshot.clone()),
                    }
                }
                for (slot, ty) in locals.into_iter().flatten().enumerate() {
                    frame.set_local(slot, ty);
                }
                if body.max_stack == 0 {
                    self.ip = handler.handler;
                    return Err(self.malformed("handler entry exceeds max stack"));
                }
                frame.push(SlotType::Object);

                self.log.push(Event::Handler {
                    start: handler.start,
                    end: handler.end,
                });
                self.run(
                    WorkItem {
                        ip: handler.handler,
                        frame,
                        context: 0,
                    },
                    false,
                )?;
                self.drain()?;
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn emit_stubs(&mut self) {
        let bottom = self.layout.bottom_offset();
        for stub in std::mem::take(&mut self.stubs) {
            self.asm.bind(stub.label);
            let native = self.asm.offset();
            self.map_ip(native, stub.ip);
            let ret = self.asm.call(CallTarget::Thunk(stub.kind), bottom);
            self.traces[stub.trace as usize] = Some(ret);
        }
    }

    fn finish(self) -> Result<Translation, CompileError> {
        let handlers = self
            .body
            .handlers
            .iter()
            .map(|h| self.native_offsets[h.handler as usize].filter(|_| {
                self.visits[h.start as usize..h.end as usize].iter().any(|&v| v > 0)
            }))
            .collect();
        let trace_offsets = self
            .traces
            .iter()
            .map(|t| t.ok_or_else(|| self.malformed("trace point was never placed")))
            .collect::<Result<Vec<_>, _>>()?;
        let insts = self.asm.finish()?;
        Ok(Translation {
            insts,
            layout: self.layout,
            log: self.log,
            visits: self.visits,
            trace_offsets,
            calls: self.calls,
            pool: self.pool,
            ip_map: self.ip_map,
            handlers,
        })
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn label(&mut self, ip: u32) -> Label {
        match self.labels[ip as usize] {
            Some(label) => label,
            None => {
                let label = self.asm.new_label();
                self.labels[ip as usize] = Some(label);
                label
            }
        }
    }

    fn map_ip(&mut self, native: u32, ip: u32) {
        match self.ip_map.last_mut() {
            // The previous instruction emitted no code.
            Some(last) if last.0 == native => last.1 = ip,
            _ => self.ip_map.push((native, ip)),
        }
    }

    fn pool_entry(&mut self, value: u64) -> u32 {
        if let Some(&index) = self.pool_index.get(&value) {
            return index;
        }
        let index = self.pool.len() as u32;
        self.pool.push(value);
        self.pool_index.insert(value, index);
        index
    }

    fn object_class(&mut self) -> Result<ClassId, CompileError> {
        if let Some(id) = self.object_class {
            return Ok(id);
        }
        let id = self.resolver.resolve_class(OBJECT_CLASS)?.id();
        self.object_class = Some(id);
        Ok(id)
    }

    /// Record a trace point. `offset` is unknown for cold stubs until they
    /// are emitted.
    fn trace(&mut self, offset: Option<u32>) -> u32 {
        let id = self.traces.len() as u32;
        self.traces.push(offset);
        self.log.push(Event::Trace(id));
        id
    }

    fn runtime(&mut self, routine: RuntimeRoutine) {
        let ret = self.asm.call_runtime(routine);
        self.trace(Some(ret));
    }

    /// Branch to a cold stub that calls `kind`.
    fn guard(&mut self, kind: ThunkKind, cond: Cond, lhs: Operand, rhs: Operand) {
        let label = self.asm.new_label();
        let trace = self.trace(None);
        self.stubs.push(ColdStub {
            label,
            kind,
            trace,
            ip: self.ip,
        });
        self.asm.compare_and_branch(cond, Width::W64, lhs, rhs, label);
    }

    fn null_check(&mut self, reg: Reg) {
        self.guard(ThunkKind::NullPointer, Cond::Eq, Operand::Reg(reg), Operand::Imm(0));
    }

    fn bounds_check(&mut self, array: Reg, index: Reg) {
        self.guard(
            ThunkKind::ArrayBounds,
            Cond::AboveOrEqual,
            Operand::Reg(index),
            Operand::Length(array),
        );
    }

    fn poll_backward(&mut self, ip: u32, targets: &[u32]) {
        if self.options.safepoint_polls && targets.iter().any(|&t| t <= ip) {
            let ret = self.asm.safepoint();
            self.trace(Some(ret));
        }
    }

    #[inline]
    fn stack(&self, depth: usize) -> Operand {
        Operand::Frame(self.layout.offset(self.layout.stack_slot(depth)))
    }

    /// Operand `n` entries below the top of `frame`.
    fn peek(&self, frame: &AbstractFrame, n: usize) -> Result<Operand, CompileError> {
        match frame.depth().checked_sub(n + 1) {
            Some(depth) => Ok(self.stack(depth)),
            None => Err(self.malformed("operand stack underflow")),
        }
    }

    fn local(&self, index: u16) -> Result<Operand, CompileError> {
        if index >= self.layout.max_locals() {
            return Err(self.malformed("local index out of range"));
        }
        Ok(Operand::Frame(self.layout.offset(index as usize)))
    }

    fn push(&mut self, frame: &mut AbstractFrame, ty: SlotType) -> Result<Operand, CompileError> {
        let depth = frame.depth();
        if depth >= self.layout.max_stack() as usize {
            return Err(self.malformed("operand stack overflow"));
        }
        frame.push(ty);
        if ty.is_reference() {
            self.log.push(Event::Mark(self.layout.stack_slot(depth) as u32));
        }
        Ok(self.stack(depth))
    }

    fn pop(&mut self, frame: &mut AbstractFrame) -> Result<Operand, CompileError> {
        let Some(ty) = frame.pop() else {
            return Err(self.malformed("operand stack underflow"));
        };
        let depth = frame.depth();
        if ty.is_reference() {
            self.log.push(Event::Clear(self.layout.stack_slot(depth) as u32));
        }
        Ok(self.stack(depth))
    }

    fn pop_n(&mut self, frame: &mut AbstractFrame, n: usize) -> Result<(), CompileError> {
        for _ in 0..n {
            self.pop(frame)?;
        }
        Ok(())
    }

    /// Re-tag a stack slot whose contents were replaced in place.
    fn retag(&mut self, depth: usize, ty: SlotType) {
        let slot = self.layout.stack_slot(depth) as u32;
        self.log.push(if ty.is_reference() {
            Event::Mark(slot)
        } else {
            Event::Clear(slot)
        });
    }

    // -------------------------------------------------------------------------
    // Instructions
    // -------------------------------------------------------------------------

    fn instruction(&mut self, ip: u32, frame: &mut AbstractFrame) -> Result<Flow, CompileError> {
        use Instruction as I;
        let body = self.body;
        match &body.instructions[ip as usize] {
            I::Nop => {}

            I::IConst(v) => self.constant(frame, SlotType::Int, i64::from(*v))?,
            I::LConst(v) => self.constant(frame, SlotType::Long, *v)?,
            I::AConstNull => self.constant(frame, SlotType::Object, 0)?,
            I::Ldc(text) => {
                let handle = self.resolver.intern_string(text)?;
                let index = self.pool_entry(handle);
                let dst = self.push(frame, SlotType::Object)?;
                self.asm.mov(dst, Operand::Pool(index));
            }

            I::ILoad(i) => self.load(frame, *i, SlotType::Int)?,
            I::LLoad(i) => self.load(frame, *i, SlotType::Long)?,
            I::ALoad(i) => self.load(frame, *i, SlotType::Object)?,
            I::IStore(i) => self.store(frame, *i, SlotType::Int)?,
            I::LStore(i) => self.store(frame, *i, SlotType::Long)?,
            I::AStore(i) => self.store(frame, *i, SlotType::Object)?,
            I::IInc(i, delta) => {
                let local = self.local(*i)?;
                self.asm.binary(
                    BinaryOp::Add,
                    Width::W32,
                    Reg::R0,
                    local,
                    Operand::Imm(i64::from(*delta)),
                );
                self.asm.mov(local, Operand::Reg(Reg::R0));
            }

            I::Pop => {
                self.pop(frame)?;
            }
            I::Dup => {
                let src = self.peek(frame, 0)?;
                let ty = frame.peek(0).unwrap_or(SlotType::Top);
                let dst = self.push(frame, ty)?;
                self.asm.mov(dst, src);
            }
            I::Swap => {
                let (Some(top), Some(below)) = (frame.peek(0), frame.peek(1)) else {
                    return Err(self.malformed("operand stack underflow"));
                };
                let depth = frame.depth();
                let (a, b) = (self.stack(depth - 1), self.stack(depth - 2));
                self.asm.mov(Operand::Reg(Reg::R0), a);
                self.asm.mov(Operand::Reg(Reg::R1), b);
                self.asm.mov(a, Operand::Reg(Reg::R1));
                self.asm.mov(b, Operand::Reg(Reg::R0));
                frame.set_stack(depth - 1, below);
                frame.set_stack(depth - 2, top);
                self.retag(depth - 1, below);
                self.retag(depth - 2, top);
            }

            I::IDiv => self.division(frame, BinaryOp::Div, Width::W32)?,
            I::IRem => self.division(frame, BinaryOp::Rem, Width::W32)?,
            I::LDiv => self.division(frame, BinaryOp::Div, Width::W64)?,
            I::LRem => self.division(frame, BinaryOp::Rem, Width::W64)?,
            I::INeg => {
                let src = self.pop(frame)?;
                let dst = self.push(frame, SlotType::Int)?;
                self.asm
                    .binary(BinaryOp::Sub, Width::W32, Reg::R0, Operand::Imm(0), src);
                self.asm.mov(dst, Operand::Reg(Reg::R0));
            }
            I::LNeg => self.unary(frame, UnaryOp::Neg, SlotType::Long)?,
            I::L2I => self.unary(frame, UnaryOp::Truncate32, SlotType::Int)?,
            I::I2L => {
                // Ints are kept sign-extended.
                self.pop(frame)?;
                self.push(frame, SlotType::Long)?;
            }
            I::LCmp => self.binary(frame, BinaryOp::Cmp, Width::W64, SlotType::Int)?,

            I::If(cond, target) => {
                self.poll_backward(ip, &[*target]);
                let value = self.pop(frame)?;
                self.branch((*cond).into(), Width::W32, value, Operand::Imm(0), *target, frame)?;
            }
            I::IfICmp(cond, target) => {
                self.poll_backward(ip, &[*target]);
                let rhs = self.pop(frame)?;
                let lhs = self.pop(frame)?;
                self.branch((*cond).into(), Width::W32, lhs, rhs, *target, frame)?;
            }
            I::IfNull(target) | I::IfNonNull(target) => {
                let cond = if matches!(body.instructions[ip as usize], I::IfNull(_)) {
                    Cond::Eq
                } else {
                    Cond::Ne
                };
                self.poll_backward(ip, &[*target]);
                let value = self.pop(frame)?;
                self.branch(cond, Width::W64, value, Operand::Imm(0), *target, frame)?;
            }
            I::IfACmpEq(target) | I::IfACmpNe(target) => {
                let cond = if matches!(body.instructions[ip as usize], I::IfACmpEq(_)) {
                    Cond::Eq
                } else {
                    Cond::Ne
                };
                self.poll_backward(ip, &[*target]);
                let rhs = self.pop(frame)?;
                let lhs = self.pop(frame)?;
                self.branch(cond, Width::W64, lhs, rhs, *target, frame)?;
            }
            I::Goto(target) => {
                self.poll_backward(ip, &[*target]);
                let label = self.label(*target);
                self.asm.jump(label);
                self.fork(*target, frame)?;
                return Ok(Flow::Stop);
            }
            I::TableSwitch {
                low,
                targets,
                default,
            } => {
                let mut all = targets.to_vec();
                all.push(*default);
                self.poll_backward(ip, &all);
                let value = self.pop(frame)?;
                self.asm.binary(
                    BinaryOp::Sub,
                    Width::W64,
                    Reg::R0,
                    value,
                    Operand::Imm(i64::from(*low)),
                );
                let default_label = self.label(*default);
                self.asm.compare_and_branch(
                    Cond::AboveOrEqual,
                    Width::W64,
                    Operand::Reg(Reg::R0),
                    Operand::Imm(targets.len() as i64),
                    default_label,
                );
                for (case, &target) in targets.iter().enumerate() {
                    let label = self.label(target);
                    self.asm.compare_and_branch(
                        Cond::Eq,
                        Width::W64,
                        Operand::Reg(Reg::R0),
                        Operand::Imm(case as i64),
                        label,
                    );
                }
                self.asm.jump(default_label);
                self.fork_all(all, frame)?;
                return Ok(Flow::Stop);
            }
            I::LookupSwitch { pairs, default } => {
                let mut all: Vec<u32> = pairs.iter().map(|&(_, t)| t).collect();
                all.push(*default);
                self.poll_backward(ip, &all);
                let value = self.pop(frame)?;
                for &(key, target) in pairs.iter() {
                    let label = self.label(target);
                    self.asm.compare_and_branch(
                        Cond::Eq,
                        Width::W32,
                        value,
                        Operand::Imm(i64::from(key)),
                        label,
                    );
                }
                let default_label = self.label(*default);
                self.asm.jump(default_label);
                self.fork_all(all, frame)?;
                return Ok(Flow::Stop);
            }

            I::New(class) => {
                let class = self.resolver.resolve_class(class.name())?;
                self.runtime(RuntimeRoutine::New { class: class.id() });
                let dst = self.push(frame, SlotType::Object)?;
                self.asm.mov(dst, Operand::Reg(Reg::R0));
            }
            I::GetField(field) => {
                let field = self.resolver.resolve_field(field, false)?;
                let object = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), object);
                self.null_check(Reg::R1);
                self.pop(frame)?;
                let dst = self.push(frame, field.kind.into())?;
                self.asm.mov(
                    dst,
                    Operand::Field {
                        base: Reg::R1,
                        index: field.index,
                    },
                );
            }
            I::PutField(field) => {
                let field = self.resolver.resolve_field(field, false)?;
                let object = self.peek(frame, 1)?;
                let value = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), object);
                self.null_check(Reg::R1);
                self.asm.mov(
                    Operand::Field {
                        base: Reg::R1,
                        index: field.index,
                    },
                    value,
                );
                self.pop_n(frame, 2)?;
            }
            I::GetStatic(field) => {
                let field = self.resolver.resolve_field(field, true)?;
                let statics = self.pool_entry(field.owner.statics());
                self.asm.mov(Operand::Reg(Reg::R1), Operand::Pool(statics));
                let dst = self.push(frame, field.kind.into())?;
                self.asm.mov(
                    dst,
                    Operand::Field {
                        base: Reg::R1,
                        index: field.index,
                    },
                );
            }
            I::PutStatic(field) => {
                let field = self.resolver.resolve_field(field, true)?;
                let statics = self.pool_entry(field.owner.statics());
                let value = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), Operand::Pool(statics));
                self.asm.mov(
                    Operand::Field {
                        base: Reg::R1,
                        index: field.index,
                    },
                    value,
                );
                self.pop(frame)?;
            }
            I::CheckCast(class) => {
                let class = self.resolver.resolve_class(class.name())?;
                let object = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), object);
                self.runtime(RuntimeRoutine::CheckCast { class: class.id() });
            }
            I::InstanceOf(class) => {
                let class = self.resolver.resolve_class(class.name())?;
                let object = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), object);
                self.runtime(RuntimeRoutine::InstanceOf { class: class.id() });
                self.pop(frame)?;
                let dst = self.push(frame, SlotType::Int)?;
                self.asm.mov(dst, Operand::Reg(Reg::R0));
            }

            I::NewArray(kind) => {
                let kind = match kind {
                    ArrayKind::Int => ElementKind::Int,
                    ArrayKind::Long => ElementKind::Long,
                };
                self.new_array(frame, kind)?;
            }
            I::ANewArray(class) => {
                self.resolver.resolve_class(class.name())?;
                self.new_array(frame, ElementKind::Ref)?;
            }
            I::ArrayLength => {
                let array = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), array);
                self.null_check(Reg::R1);
                self.pop(frame)?;
                let dst = self.push(frame, SlotType::Int)?;
                self.asm.mov(dst, Operand::Length(Reg::R1));
            }
            I::IALoad => self.array_load(frame, SlotType::Int)?,
            I::LALoad => self.array_load(frame, SlotType::Long)?,
            I::AALoad => self.array_load(frame, SlotType::Object)?,
            I::IAStore | I::LAStore | I::AAStore => {
                let array = self.peek(frame, 2)?;
                let index = self.peek(frame, 1)?;
                let value = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), array);
                self.asm.mov(Operand::Reg(Reg::R2), index);
                self.null_check(Reg::R1);
                self.bounds_check(Reg::R1, Reg::R2);
                self.asm.mov(
                    Operand::Element {
                        base: Reg::R1,
                        index: Reg::R2,
                    },
                    value,
                );
                self.pop_n(frame, 3)?;
            }

            I::InvokeStatic(reference) => return self.invoke(frame, reference, InvokeKind::Static),
            I::InvokeVirtual(reference) => return self.invoke(frame, reference, InvokeKind::Virtual),
            I::InvokeSpecial(reference) => return self.invoke(frame, reference, InvokeKind::Special),

            I::IReturn | I::LReturn | I::AReturn => {
                let value = self.peek(frame, 0)?;
                self.emit_return(Some(value));
                return Ok(Flow::Stop);
            }
            I::Return => {
                self.emit_return(None);
                return Ok(Flow::Stop);
            }
            I::AThrow => {
                let exception = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), exception);
                self.runtime(RuntimeRoutine::Throw);
                return Ok(Flow::Stop);
            }
            I::MonitorEnter | I::MonitorExit => {
                let routine = if matches!(body.instructions[ip as usize], I::MonitorEnter) {
                    RuntimeRoutine::MonitorEnter
                } else {
                    RuntimeRoutine::MonitorExit
                };
                let object = self.peek(frame, 0)?;
                self.asm.mov(Operand::Reg(Reg::R1), object);
                self.runtime(routine);
                self.pop(frame)?;
            }

            insn => {
                let Some((op, width, ty)) = arithmetic(insn) else {
                    return Err(self.malformed("unsupported instruction"));
                };
                self.binary(frame, op, width, ty)?;
            }
        }
        Ok(Flow::Next)
    }

    fn constant(&mut self, frame: &mut AbstractFrame, ty: SlotType, value: i64) -> Result<(), CompileError> {
        let dst = self.push(frame, ty)?;
        self.asm.mov(dst, Operand::Imm(value));
        Ok(())
    }

    fn load(&mut self, frame: &mut AbstractFrame, index: u16, ty: SlotType) -> Result<(), CompileError> {
        let src = self.local(index)?;
        let dst = self.push(frame, ty)?;
        self.asm.mov(dst, src);
        Ok(())
    }

    fn store(&mut self, frame: &mut AbstractFrame, index: u16, ty: SlotType) -> Result<(), CompileError> {
        let dst = self.local(index)?;
        let src = self.pop(frame)?;
        self.asm.mov(dst, src);
        frame.set_local(index as usize, ty);
        self.log.push(if ty.is_reference() {
            Event::Mark(u32::from(index))
        } else {
            Event::Clear(u32::from(index))
        });
        Ok(())
    }

    fn binary(
        &mut self,
        frame: &mut AbstractFrame,
        op: BinaryOp,
        width: Width,
        result: SlotType,
    ) -> Result<(), CompileError> {
        let rhs = self.pop(frame)?;
        let lhs = self.pop(frame)?;
        let dst = self.push(frame, result)?;
        self.asm.binary(op, width, Reg::R0, lhs, rhs);
        self.asm.mov(dst, Operand::Reg(Reg::R0));
        Ok(())
    }

    fn unary(&mut self, frame: &mut AbstractFrame, op: UnaryOp, result: SlotType) -> Result<(), CompileError> {
        let src = self.pop(frame)?;
        let dst = self.push(frame, result)?;
        self.asm.unary(op, Reg::R0, src);
        self.asm.mov(dst, Operand::Reg(Reg::R0));
        Ok(())
    }

    fn division(&mut self, frame: &mut AbstractFrame, op: BinaryOp, width: Width) -> Result<(), CompileError> {
        let divisor = self.peek(frame, 0)?;
        self.guard(ThunkKind::DivideByZero, Cond::Eq, divisor, Operand::Imm(0));
        let result = if width == Width::W32 {
            SlotType::Int
        } else {
            SlotType::Long
        };
        self.binary(frame, op, width, result)
    }

    fn branch(
        &mut self,
        cond: Cond,
        width: Width,
        lhs: Operand,
        rhs: Operand,
        target: u32,
        frame: &AbstractFrame,
    ) -> Result<(), CompileError> {
        let label = self.label(target);
        self.asm.compare_and_branch(cond, width, lhs, rhs, label);
        self.fork(target, frame)
    }

    fn fork_all(&mut self, mut targets: Vec<u32>, frame: &AbstractFrame) -> Result<(), CompileError> {
        targets.sort_unstable();
        targets.dedup();
        for target in targets {
            self.fork(target, frame)?;
        }
        Ok(())
    }

    fn new_array(&mut self, frame: &mut AbstractFrame, kind: ElementKind) -> Result<(), CompileError> {
        let class = self.object_class()?;
        let length = self.peek(frame, 0)?;
        self.asm.mov(Operand::Reg(Reg::R1), length);
        self.runtime(RuntimeRoutine::NewArray { kind, class });
        self.pop(frame)?;
        let dst = self.push(frame, SlotType::Object)?;
        self.asm.mov(dst, Operand::Reg(Reg::R0));
        Ok(())
    }

    fn array_load(&mut self, frame: &mut AbstractFrame, ty: SlotType) -> Result<(), CompileError> {
        let array = self.peek(frame, 1)?;
        let index = self.peek(frame, 0)?;
        self.asm.mov(Operand::Reg(Reg::R1), array);
        self.asm.mov(Operand::Reg(Reg::R2), index);
        self.null_check(Reg::R1);
        self.bounds_check(Reg::R1, Reg::R2);
        self.pop_n(frame, 2)?;
        let dst = self.push(frame, ty)?;
        self.asm.mov(
            dst,
            Operand::Element {
                base: Reg::R1,
                index: Reg::R2,
            },
        );
        Ok(())
    }

    fn emit_return(&mut self, value: Option<Operand>) {
        if let Some(lock_slot) = self.layout.lock_slot() {
            self.asm.mov(
                Operand::Reg(Reg::R1),
                Operand::Frame(self.layout.offset(lock_slot)),
            );
            self.runtime(RuntimeRoutine::MonitorExit);
        }
        if let Some(value) = value {
            self.asm.mov(Operand::Reg(Reg::R0), value);
        }
        self.asm.leave();
        self.asm.ret();
    }

    fn invoke(
        &mut self,
        frame: &mut AbstractFrame,
        reference: &MethodRef,
        kind: InvokeKind,
    ) -> Result<Flow, CompileError> {
        let target = self.resolver.resolve_method(reference, kind)?;
        let argc = target.param_footprint() as usize;
        let depth = frame.depth();
        if depth < argc {
            return Err(self.malformed("operand stack underflow"));
        }
        let args_at = self.layout.args_offset(depth);

        if !target.is_static() {
            let receiver = self.stack(depth - argc);
            self.asm.mov(Operand::Reg(Reg::R1), receiver);
            self.null_check(Reg::R1);
        }

        let (call_target, mut flags) = match (kind, target.vtable_index()) {
            (InvokeKind::Virtual, Some(vtable_index))
                if !target.flags().contains(MethodFlags::PRIVATE) =>
            {
                (
                    CallTarget::Virtual {
                        vtable_index,
                        argc: argc as u16,
                    },
                    CallFlags::VIRTUAL,
                )
            }
            _ => (CallTarget::Site, CallFlags::NONE),
        };

        let tail = self.tail_call_allowed(&target);
        self.pop_n(frame, argc)?;

        if tail {
            flags = flags | CallFlags::TAIL_CALL;
            let ret = self.asm.tail_call(
                call_target,
                args_at,
                argc as u16,
                self.layout.params(),
            );
            self.calls.push(CallElement {
                offset: ret,
                target,
                flags,
            });
            return Ok(Flow::Stop);
        }

        let ret = self.asm.call(call_target, args_at);
        self.trace(Some(ret));
        let return_kind = target.return_kind();
        self.calls.push(CallElement {
            offset: ret,
            target,
            flags,
        });
        if return_kind != TypeKind::Void {
            let dst = self.push(frame, return_kind.into())?;
            self.asm.mov(dst, Operand::Reg(Reg::R0));
        }
        Ok(Flow::Next)
    }

    /// A call can replace the current frame when its result is returned
    /// immediately and nothing else needs the frame afterwards.
    fn tail_call_allowed(&self, target: &Method) -> bool {
        if !self.options.tail_calls || self.method.is_synchronized() {
            return false;
        }
        if self.body.handlers.iter().any(|h| h.covers(self.ip)) {
            return false;
        }
        let returns = match self.body.instructions.get(self.ip as usize + 1) {
            Some(Instruction::IReturn) => TypeKind::Int,
            Some(Instruction::LReturn) => TypeKind::Long,
            Some(Instruction::AReturn) => TypeKind::Object,
            Some(Instruction::Return) => TypeKind::Void,
            _ => return false,
        };
        target.return_kind() == returns && self.method.return_kind() == returns
    }
}

/// Two-operand arithmetic that needs no guard.
fn arithmetic(insn: &Instruction) -> Option<(BinaryOp, Width, SlotType)> {
    use Instruction as I;
    let int = |op| Some((op, Width::W32, SlotType::Int));
    let long = |op| Some((op, Width::W64, SlotType::Long));
    match insn {
        I::IAdd => int(BinaryOp::Add),
        I::ISub => int(BinaryOp::Sub),
        I::IMul => int(BinaryOp::Mul),
        I::IAnd => int(BinaryOp::And),
        I::IOr => int(BinaryOp::Or),
        I::IXor => int(BinaryOp::Xor),
        I::IShl => int(BinaryOp::Shl),
        I::IShr => int(BinaryOp::Shr),
        I::IUShr => int(BinaryOp::UShr),
        I::LAdd => long(BinaryOp::Add),
        I::LSub => long(BinaryOp::Sub),
        I::LMul => long(BinaryOp::Mul),
        _ => None,
    }
}
