//! Abstract frame tracked during translation.

use corvus_bytecode::TypeKind;
use smallvec::SmallVec;

/// Type of a local or operand-stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotType {
    /// Unassigned, or conflicting along different paths.
    Top,
    Int,
    Long,
    Object,
}

impl SlotType {
    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, SlotType::Object)
    }

    #[inline]
    pub fn meet(self, other: SlotType) -> SlotType {
        if self == other { self } else { SlotType::Top }
    }
}

impl From<TypeKind> for SlotType {
    fn from(kind: TypeKind) -> Self {
        match kind {
            TypeKind::Int => SlotType::Int,
            TypeKind::Long => SlotType::Long,
            TypeKind::Object => SlotType::Object,
            TypeKind::Void => SlotType::Top,
        }
    }
}

/// Locals and operand stack at one program point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractFrame {
    locals: SmallVec<[SlotType; 8]>,
    stack: SmallVec<[SlotType; 8]>,
}

impl AbstractFrame {
    pub fn new(max_locals: u16) -> Self {
        Self {
            locals: SmallVec::from_elem(SlotType::Top, max_locals as usize),
            stack: SmallVec::new(),
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn push(&mut self, ty: SlotType) {
        self.stack.push(ty);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<SlotType> {
        self.stack.pop()
    }

    /// Type `n` slots below the top (0 is the top).
    #[inline]
    pub fn peek(&self, n: usize) -> Option<SlotType> {
        self.stack.len().checked_sub(n + 1).map(|i| self.stack[i])
    }

    #[inline]
    pub fn stack(&self) -> &[SlotType] {
        &self.stack
    }

    #[inline]
    pub fn set_stack(&mut self, depth: usize, ty: SlotType) {
        self.stack[depth] = ty;
    }

    #[inline]
    pub fn local(&self, index: usize) -> SlotType {
        self.locals[index]
    }

    #[inline]
    pub fn set_local(&mut self, index: usize, ty: SlotType) {
        self.locals[index] = ty;
    }

    #[inline]
    pub fn locals(&self) -> &[SlotType] {
        &self.locals
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Meet each local with `other`'s.
    pub fn meet_locals(&mut self, other: &[SlotType]) {
        for (mine, &theirs) in self.locals.iter_mut().zip(other) {
            *mine = mine.meet(theirs);
        }
    }
}
