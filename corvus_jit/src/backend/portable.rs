//! Portable target.
//!
//! One [`Inst`] occupies one address unit. Branches are encoded relative to
//! the following instruction, so finished code can be placed anywhere in the
//! code space without relocation.

use super::{
    Assembler, BinaryOp, CallTarget, Cond, FrameConstants, Label, Operand, Reg, RuntimeRoutine,
    UnaryOp, Width,
};
use crate::error::AssemblerError;
use crate::frame::FRAME_HEADER_WORDS;

/// A portable machine instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inst {
    Move {
        dst: Operand,
        src: Operand,
    },
    Binary {
        op: BinaryOp,
        width: Width,
        dst: Reg,
        lhs: Operand,
        rhs: Operand,
    },
    Unary {
        op: UnaryOp,
        dst: Reg,
        src: Operand,
    },
    Branch {
        cond: Cond,
        width: Width,
        lhs: Operand,
        rhs: Operand,
        /// Relative to the next instruction.
        displacement: i32,
    },
    Jump {
        displacement: i32,
    },
    JumpIndirect {
        target: Operand,
    },
    Call {
        target: CallTarget,
        args_at: i32,
    },
    TailCall {
        target: CallTarget,
        args_at: i32,
        argc: u16,
        caller_params: u16,
    },
    Runtime {
        routine: RuntimeRoutine,
    },
    Enter {
        frame_words: u32,
    },
    Leave,
    Return,
    Safepoint,
    Halt,
}

const UNPATCHED: i32 = i32::MIN;

/// Assembler for the portable target.
#[derive(Debug, Default)]
pub struct PortableAssembler {
    insts: Vec<Inst>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl PortableAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, inst: Inst) -> u32 {
        self.insts.push(inst);
        self.insts.len() as u32
    }

    fn emit_branch(&mut self, inst: Inst, target: Label) {
        self.fixups.push((self.insts.len(), target));
        self.insts.push(inst);
    }
}

impl Assembler for PortableAssembler {
    type Output = Box<[Inst]>;

    fn frame_constants(&self) -> FrameConstants {
        FrameConstants {
            header_words: FRAME_HEADER_WORDS as u32,
            footer_words: 0,
            return_address_words: 1,
            argument_alignment: 1,
        }
    }

    #[inline]
    fn offset(&self) -> u32 {
        self.insts.len() as u32
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.offset());
    }

    fn mov(&mut self, dst: Operand, src: Operand) {
        self.emit(Inst::Move { dst, src });
    }

    fn binary(&mut self, op: BinaryOp, width: Width, dst: Reg, lhs: Operand, rhs: Operand) {
        self.emit(Inst::Binary {
            op,
            width,
            dst,
            lhs,
            rhs,
        });
    }

    fn unary(&mut self, op: UnaryOp, dst: Reg, src: Operand) {
        self.emit(Inst::Unary { op, dst, src });
    }

    fn compare_and_branch(
        &mut self,
        cond: Cond,
        width: Width,
        lhs: Operand,
        rhs: Operand,
        target: Label,
    ) {
        self.emit_branch(
            Inst::Branch {
                cond,
                width,
                lhs,
                rhs,
                displacement: UNPATCHED,
            },
            target,
        );
    }

    fn jump(&mut self, target: Label) {
        self.emit_branch(
            Inst::Jump {
                displacement: UNPATCHED,
            },
            target,
        );
    }

    fn jump_indirect(&mut self, target: Operand) {
        self.emit(Inst::JumpIndirect { target });
    }

    fn call(&mut self, target: CallTarget, args_at: i32) -> u32 {
        self.emit(Inst::Call { target, args_at })
    }

    fn tail_call(&mut self, target: CallTarget, args_at: i32, argc: u16, caller_params: u16) -> u32 {
        self.emit(Inst::TailCall {
            target,
            args_at,
            argc,
            caller_params,
        })
    }

    fn call_runtime(&mut self, routine: RuntimeRoutine) -> u32 {
        self.emit(Inst::Runtime { routine })
    }

    fn enter(&mut self, frame_words: u32) {
        self.emit(Inst::Enter { frame_words });
    }

    fn leave(&mut self) {
        self.emit(Inst::Leave);
    }

    fn ret(&mut self) {
        self.emit(Inst::Return);
    }

    fn safepoint(&mut self) -> u32 {
        self.emit(Inst::Safepoint)
    }

    fn halt(&mut self) {
        self.emit(Inst::Halt);
    }

    fn finish(mut self) -> Result<Box<[Inst]>, AssemblerError> {
        for (index, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0 as usize].ok_or(AssemblerError::UnboundLabel(label.0))?;
            let displacement = i32::try_from(i64::from(target) - (index as i64 + 1))
                .map_err(|_| AssemblerError::DisplacementOverflow)?;
            match &mut self.insts[index] {
                Inst::Branch {
                    displacement: d, ..
                }
                | Inst::Jump { displacement: d } => *d = displacement,
                other => unreachable!("fixup recorded for non-branch {other:?}"),
            }
        }
        Ok(self.insts.into_boxed_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_returns_next_offset() {
        let mut asm = PortableAssembler::new();
        asm.enter(2);
        let ret = asm.call(CallTarget::Site, -1);
        assert_eq!(ret, 2);
        assert_eq!(asm.offset(), 2);
    }

    #[test]
    fn test_forward_and_backward_branches() {
        let mut asm = PortableAssembler::new();
        let top = asm.new_label();
        let exit = asm.new_label();
        asm.bind(top);
        asm.compare_and_branch(Cond::Eq, Width::W32, Operand::Reg(Reg::R0), Operand::Imm(0), exit);
        asm.binary(BinaryOp::Sub, Width::W32, Reg::R0, Operand::Reg(Reg::R0), Operand::Imm(1));
        asm.jump(top);
        asm.bind(exit);
        asm.ret();
        let code = asm.finish().unwrap();

        assert!(matches!(code[0], Inst::Branch { displacement: 2, .. }));
        assert!(matches!(code[2], Inst::Jump { displacement: -3 }));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = PortableAssembler::new();
        let nowhere = asm.new_label();
        asm.jump(nowhere);
        assert_eq!(asm.finish(), Err(AssemblerError::UnboundLabel(0)));
    }
}
