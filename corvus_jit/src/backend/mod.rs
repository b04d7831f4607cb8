//! Code emission backend.
//!
//! The compiler talks to the target through the narrow [`Assembler`]
//! interface: moves between operands, arithmetic, compare-and-branch,
//! calls, frame setup and teardown, and runtime traps. The only target
//! shipped is the portable instruction set in [`portable`], executed by the
//! runtime's machine.

pub mod portable;

use crate::model::ClassId;
use crate::thunks::ThunkKind;
use corvus_gc::ElementKind;

pub use portable::{Inst, PortableAssembler};

// =============================================================================
// Operands
// =============================================================================

/// Machine registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Return value and scratch.
    R0,
    R1,
    R2,
    R3,
    /// Address identifying the call site that entered a thunk.
    Site,
    /// Receiver class for a virtual call that entered a thunk.
    ThunkClass,
    /// Vtable index for a virtual call that entered a thunk.
    ThunkIndex,
}

impl Reg {
    pub const COUNT: usize = 7;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    Imm(i64),
    /// Stack word at `fp + offset`.
    Frame(i32),
    /// Entry of the method's object pool.
    Pool(u32),
    /// Field `index` of the instance referenced by `base`.
    Field { base: Reg, index: u32 },
    /// Element `index` of the array referenced by `base`.
    Element { base: Reg, index: Reg },
    /// Length of the array referenced by the register.
    Length(Reg),
}

/// Operation width. 32-bit results are sign-extended into the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Truncating signed division; the divisor is checked beforehand.
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
    /// Three-way signed compare producing -1, 0 or 1.
    Cmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    /// Keep the low 32 bits, sign-extended.
    Truncate32,
}

/// Branch conditions. `Below` and `AboveOrEqual` compare unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
    Below,
    AboveOrEqual,
}

impl From<corvus_bytecode::Condition> for Cond {
    fn from(c: corvus_bytecode::Condition) -> Self {
        use corvus_bytecode::Condition as C;
        match c {
            C::Eq => Cond::Eq,
            C::Ne => Cond::Ne,
            C::Lt => Cond::Lt,
            C::Ge => Cond::Ge,
            C::Gt => Cond::Gt,
            C::Le => Cond::Le,
        }
    }
}

/// What a call instruction jumps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// The address recorded in the call-site table for this site.
    Site,
    /// The receiver's vtable slot. The receiver is argument 0.
    Virtual { vtable_index: u32, argc: u16 },
    /// A runtime stub.
    Thunk(ThunkKind),
}

/// Runtime services reached through a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeRoutine {
    /// Resolve and compile the callee of the current site; address in `R0`.
    CompileCallee,
    /// Resolve a virtual callee from the thunk registers; address in `R0`.
    CompileVirtualCallee,
    /// Call the native implementation of the current callee.
    InvokeNative,
    /// Raise an index error. Array in `R1`, index in `R2`.
    ThrowArrayBounds,
    ThrowNullPointer,
    ThrowDivideByZero,
    /// Allocate an instance; reference in `R0`.
    New { class: ClassId },
    /// Allocate an array of length `R1`; reference in `R0`.
    NewArray { kind: ElementKind, class: ClassId },
    /// Throw the object in `R1`.
    Throw,
    MonitorEnter,
    MonitorExit,
    /// Check that `R1` is null or an instance of `class`.
    CheckCast { class: ClassId },
    /// `R0` = whether `R1` is an instance of `class`.
    InstanceOf { class: ClassId },
}

/// A branch target inside one assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

/// Frame-layout constants exposed by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConstants {
    /// Words between a frame's parameters and its locals.
    pub header_words: u32,
    /// Words below the operand stack reserved by the target.
    pub footer_words: u32,
    /// Words a call pushes for its return address.
    pub return_address_words: u32,
    /// Argument areas are padded to a multiple of this many words.
    pub argument_alignment: u32,
}

// =============================================================================
// Assembler
// =============================================================================

/// Narrow code-emission interface.
///
/// Offsets are in instruction units from the start of the assembly. Every
/// call-like operation returns the offset of the instruction following it,
/// which is the return address recorded for frame maps.
pub trait Assembler {
    /// Finished code.
    type Output;

    fn frame_constants(&self) -> FrameConstants;

    /// Offset of the next instruction.
    fn offset(&self) -> u32;

    fn new_label(&mut self) -> Label;

    fn bind(&mut self, label: Label);

    fn mov(&mut self, dst: Operand, src: Operand);

    fn binary(&mut self, op: BinaryOp, width: Width, dst: Reg, lhs: Operand, rhs: Operand);

    fn unary(&mut self, op: UnaryOp, dst: Reg, src: Operand);

    fn compare_and_branch(
        &mut self,
        cond: Cond,
        width: Width,
        lhs: Operand,
        rhs: Operand,
        target: Label,
    );

    fn jump(&mut self, target: Label);

    fn jump_indirect(&mut self, target: Operand);

    /// Call with the last argument at `fp + args_at`.
    fn call(&mut self, target: CallTarget, args_at: i32) -> u32;

    /// Replace the current frame with a call to `target`, moving `argc`
    /// arguments from `fp + args_at` into the caller's argument area of
    /// `caller_params` words.
    fn tail_call(&mut self, target: CallTarget, args_at: i32, argc: u16, caller_params: u16) -> u32;

    fn call_runtime(&mut self, routine: RuntimeRoutine) -> u32;

    /// Push the frame pointer and reserve `frame_words`, checking for stack
    /// exhaustion first.
    fn enter(&mut self, frame_words: u32);

    fn leave(&mut self);

    fn ret(&mut self);

    /// Poll for a pending collection or stop request.
    fn safepoint(&mut self) -> u32;

    /// Stop the current machine loop.
    fn halt(&mut self);

    fn finish(self) -> Result<Self::Output, crate::error::AssemblerError>;
}
