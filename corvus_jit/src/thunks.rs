//! Precompiled stubs.
//!
//! Thunks stand in for code that does not exist yet and give guard code a
//! shared failure path. They have no bytecode and no frame of their own: a
//! thunk runs in the state left by the call that entered it, with the return
//! address on top of the stack and `Reg::Site` naming the call site.
//!
//! ```text
//! DefaultCompile   runtime(CompileCallee)        ; R0 = compiled entry
//!                  jmp *R0                       ; re-enter as the original call
//! VirtualCompile   runtime(CompileVirtualCallee) ; receiver class in ThunkClass
//!                  jmp *R0
//! NativeInvoke     runtime(InvokeNative)         ; result in R0
//!                  ret
//! ArrayBounds      runtime(ThrowArrayBounds)     ; never returns
//! NullPointer      runtime(ThrowNullPointer)
//! DivideByZero     runtime(ThrowDivideByZero)
//! InvocationReturn halt                          ; trace boundary
//! ```

use crate::backend::{Assembler, Operand, PortableAssembler, Reg, RuntimeRoutine};
use crate::code::{CodeBlock, CodeSpace};
use crate::error::AssemblerError;
use std::sync::Arc;

/// The stubs generated at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThunkKind {
    /// Initial entry of every method with bytecode.
    DefaultCompile,
    /// Initial entry of every vtable slot.
    VirtualCompile,
    /// Entry of every native method.
    NativeInvoke,
    ArrayBounds,
    NullPointer,
    DivideByZero,
    /// Return address of the outermost frame of an invocation.
    InvocationReturn,
}

impl ThunkKind {
    pub const ALL: [ThunkKind; 7] = [
        ThunkKind::DefaultCompile,
        ThunkKind::VirtualCompile,
        ThunkKind::NativeInvoke,
        ThunkKind::ArrayBounds,
        ThunkKind::NullPointer,
        ThunkKind::DivideByZero,
        ThunkKind::InvocationReturn,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    /// Guard-failure thunks reached from cold stubs.
    #[inline]
    pub const fn is_throw(self) -> bool {
        matches!(
            self,
            ThunkKind::ArrayBounds | ThunkKind::NullPointer | ThunkKind::DivideByZero
        )
    }
}

/// Generated thunk block with the entry address of each stub.
#[derive(Debug)]
pub struct Thunks {
    block: Arc<CodeBlock>,
    entries: [u64; 7],
}

impl Thunks {
    /// Emit every thunk into one block placed in `space`.
    pub fn generate(space: &CodeSpace) -> Result<Self, AssemblerError> {
        let mut asm = PortableAssembler::new();
        let mut offsets = [0u32; 7];
        for kind in ThunkKind::ALL {
            offsets[kind.index()] = asm.offset();
            emit_thunk(&mut asm, kind);
        }
        let insts = asm.finish()?;
        let start = space.reserve(insts.len());
        let entries = offsets.map(|o| start + u64::from(o));
        tracing::debug!(start = format_args!("{start:#x}"), len = insts.len(), "thunks generated");
        Ok(Self {
            block: Arc::new(CodeBlock::new(start, insts)),
            entries,
        })
    }

    #[inline]
    pub fn address(&self, kind: ThunkKind) -> u64 {
        self.entries[kind.index()]
    }

    /// The thunk whose entry is exactly `address`.
    pub fn kind_at(&self, address: u64) -> Option<ThunkKind> {
        ThunkKind::ALL
            .into_iter()
            .find(|&k| self.entries[k.index()] == address)
    }

    /// Whether `address` still means "not compiled yet".
    #[inline]
    pub fn is_unresolved(&self, address: u64) -> bool {
        address == self.address(ThunkKind::DefaultCompile)
            || address == self.address(ThunkKind::VirtualCompile)
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        self.block.contains(address)
    }

    #[inline]
    pub fn block(&self) -> &Arc<CodeBlock> {
        &self.block
    }
}

fn emit_thunk(asm: &mut PortableAssembler, kind: ThunkKind) {
    match kind {
        ThunkKind::DefaultCompile => {
            asm.call_runtime(RuntimeRoutine::CompileCallee);
            asm.jump_indirect(Operand::Reg(Reg::R0));
        }
        ThunkKind::VirtualCompile => {
            asm.call_runtime(RuntimeRoutine::CompileVirtualCallee);
            asm.jump_indirect(Operand::Reg(Reg::R0));
        }
        ThunkKind::NativeInvoke => {
            asm.call_runtime(RuntimeRoutine::InvokeNative);
            asm.ret();
        }
        ThunkKind::ArrayBounds => {
            asm.call_runtime(RuntimeRoutine::ThrowArrayBounds);
            asm.halt();
        }
        ThunkKind::NullPointer => {
            asm.call_runtime(RuntimeRoutine::ThrowNullPointer);
            asm.halt();
        }
        ThunkKind::DivideByZero => {
            asm.call_runtime(RuntimeRoutine::ThrowDivideByZero);
            asm.halt();
        }
        ThunkKind::InvocationReturn => asm.halt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Inst;

    #[test]
    fn test_entries_are_distinct_and_inside_block() {
        let space = CodeSpace::new();
        let thunks = Thunks::generate(&space).unwrap();
        let mut seen: Vec<u64> = ThunkKind::ALL.iter().map(|&k| thunks.address(k)).collect();
        assert!(seen.iter().all(|&a| thunks.contains(a)));
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), ThunkKind::ALL.len());
    }

    #[test]
    fn test_kind_lookup() {
        let thunks = Thunks::generate(&CodeSpace::new()).unwrap();
        for kind in ThunkKind::ALL {
            assert_eq!(thunks.kind_at(thunks.address(kind)), Some(kind));
        }
        assert!(thunks.is_unresolved(thunks.address(ThunkKind::DefaultCompile)));
        assert!(!thunks.is_unresolved(thunks.address(ThunkKind::NativeInvoke)));
    }

    #[test]
    fn test_compile_thunk_reenters_through_r0() {
        let thunks = Thunks::generate(&CodeSpace::new()).unwrap();
        let entry = thunks.address(ThunkKind::DefaultCompile);
        let block = thunks.block();
        assert_eq!(
            block.at(entry),
            Some(&Inst::Runtime {
                routine: RuntimeRoutine::CompileCallee
            })
        );
        assert_eq!(
            block.at(entry + 1),
            Some(&Inst::JumpIndirect {
                target: Operand::Reg(Reg::R0)
            })
        );
        assert_eq!(
            block.at(thunks.address(ThunkKind::InvocationReturn)),
            Some(&Inst::Halt)
        );
    }
}
