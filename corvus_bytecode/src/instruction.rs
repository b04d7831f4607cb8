//! Bytecode instruction set.
//!
//! Instructions are stored in a flat array and addressed by index; the index
//! is the bytecode offset used everywhere else (branch targets, exception
//! ranges, frame maps).
//!
//! The operand stack is untyped at this level; each instruction documents the
//! stack effect it has. Branch targets are absolute instruction indices.

use crate::descriptor::{DescriptorError, MethodDescriptor, TypeKind};
use std::fmt;
use std::sync::Arc;

/// Comparison used by conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Condition {
    /// Evaluate the condition for an ordering of `lhs` against `rhs`.
    #[inline]
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Condition::Eq => ordering == Equal,
            Condition::Ne => ordering != Equal,
            Condition::Lt => ordering == Less,
            Condition::Ge => ordering != Less,
            Condition::Gt => ordering == Greater,
            Condition::Le => ordering != Greater,
        }
    }
}

/// Element kind for primitive arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Int,
    Long,
}

/// Symbolic reference to a class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef(pub Arc<str>);

impl ClassRef {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symbolic reference to a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
}

impl MethodRef {
    pub fn new(
        class: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        descriptor: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }

    /// Parse the descriptor of the referenced method.
    pub fn parse_descriptor(&self) -> Result<MethodDescriptor, DescriptorError> {
        MethodDescriptor::parse(&self.descriptor)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}

/// Symbolic reference to a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    pub class: Arc<str>,
    pub name: Arc<str>,
    pub kind: TypeKind,
}

impl FieldRef {
    pub fn new(class: impl Into<Arc<str>>, name: impl Into<Arc<str>>, kind: TypeKind) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.kind)
    }
}

/// A single bytecode instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Nop,

    // Constants
    IConst(i32),
    LConst(i64),
    AConstNull,
    /// Push an interned string constant.
    Ldc(Arc<str>),

    // Locals
    ILoad(u16),
    LLoad(u16),
    ALoad(u16),
    IStore(u16),
    LStore(u16),
    AStore(u16),
    /// Add a constant to an int local in place.
    IInc(u16, i32),

    // Stack manipulation
    Pop,
    Dup,
    Swap,

    // Int arithmetic
    IAdd,
    ISub,
    IMul,
    IDiv,
    IRem,
    INeg,
    IAnd,
    IOr,
    IXor,
    IShl,
    IShr,
    IUShr,

    // Long arithmetic
    LAdd,
    LSub,
    LMul,
    LDiv,
    LRem,
    LNeg,
    /// Compare two longs, pushing -1, 0 or 1.
    LCmp,

    // Conversions
    I2L,
    L2I,

    // Control flow
    /// Compare the int on top of stack with zero.
    If(Condition, u32),
    /// Compare two ints.
    IfICmp(Condition, u32),
    IfNull(u32),
    IfNonNull(u32),
    IfACmpEq(u32),
    IfACmpNe(u32),
    Goto(u32),
    TableSwitch {
        low: i32,
        targets: Box<[u32]>,
        default: u32,
    },
    LookupSwitch {
        pairs: Box<[(i32, u32)]>,
        default: u32,
    },

    // Objects
    New(ClassRef),
    GetField(FieldRef),
    PutField(FieldRef),
    GetStatic(FieldRef),
    PutStatic(FieldRef),
    CheckCast(ClassRef),
    InstanceOf(ClassRef),

    // Arrays
    NewArray(ArrayKind),
    ANewArray(ClassRef),
    ArrayLength,
    IALoad,
    LALoad,
    AALoad,
    IAStore,
    LAStore,
    AAStore,

    // Calls
    InvokeStatic(MethodRef),
    InvokeVirtual(MethodRef),
    InvokeSpecial(MethodRef),

    // Returns
    IReturn,
    LReturn,
    AReturn,
    Return,

    AThrow,
    MonitorEnter,
    MonitorExit,
}

impl Instruction {
    /// Branch targets of this instruction, excluding fallthrough.
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            Instruction::If(_, t)
            | Instruction::IfICmp(_, t)
            | Instruction::IfNull(t)
            | Instruction::IfNonNull(t)
            | Instruction::IfACmpEq(t)
            | Instruction::IfACmpNe(t)
            | Instruction::Goto(t) => vec![*t],
            Instruction::TableSwitch {
                targets, default, ..
            } => {
                let mut all: Vec<u32> = targets.to_vec();
                all.push(*default);
                all
            }
            Instruction::LookupSwitch { pairs, default } => {
                let mut all: Vec<u32> = pairs.iter().map(|&(_, t)| t).collect();
                all.push(*default);
                all
            }
            _ => Vec::new(),
        }
    }

    /// Whether control can continue to the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Instruction::Goto(_)
                | Instruction::TableSwitch { .. }
                | Instruction::LookupSwitch { .. }
                | Instruction::IReturn
                | Instruction::LReturn
                | Instruction::AReturn
                | Instruction::Return
                | Instruction::AThrow
        )
    }

    /// Number of operand-stack slots popped and pushed.
    pub fn stack_effect(&self) -> Result<(u16, u16), DescriptorError> {
        use Instruction::*;
        let effect = match self {
            Nop | Goto(_) | IInc(..) | Return => (0, 0),
            IConst(_) | LConst(_) | AConstNull | Ldc(_) | ILoad(_) | LLoad(_) | ALoad(_) => (0, 1),
            IStore(_) | LStore(_) | AStore(_) | Pop => (1, 0),
            Dup => (1, 2),
            Swap => (2, 2),
            IAdd | ISub | IMul | IDiv | IRem | IAnd | IOr | IXor | IShl | IShr | IUShr => (2, 1),
            LAdd | LSub | LMul | LDiv | LRem | LCmp => (2, 1),
            INeg | LNeg | I2L | L2I => (1, 1),
            If(..) | IfNull(_) | IfNonNull(_) => (1, 0),
            IfICmp(..) | IfACmpEq(_) | IfACmpNe(_) => (2, 0),
            TableSwitch { .. } | LookupSwitch { .. } => (1, 0),
            New(_) => (0, 1),
            GetField(_) => (1, 1),
            PutField(_) => (2, 0),
            GetStatic(_) => (0, 1),
            PutStatic(_) => (1, 0),
            CheckCast(_) | InstanceOf(_) => (1, 1),
            NewArray(_) | ANewArray(_) | ArrayLength => (1, 1),
            IALoad | LALoad | AALoad => (2, 1),
            IAStore | LAStore | AAStore => (3, 0),
            InvokeStatic(m) => invoke_effect(m, false)?,
            InvokeVirtual(m) | InvokeSpecial(m) => invoke_effect(m, true)?,
            IReturn | LReturn | AReturn | AThrow | MonitorEnter | MonitorExit => (1, 0),
        };
        Ok(effect)
    }
}

fn invoke_effect(method: &MethodRef, receiver: bool) -> Result<(u16, u16), DescriptorError> {
    let desc = method.parse_descriptor()?;
    let pops = desc.param_count() as u16 + u16::from(receiver);
    let pushes = u16::from(desc.return_kind() != TypeKind::Void);
    Ok((pops, pushes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_condition_holds() {
        assert!(Condition::Lt.holds(Ordering::Less));
        assert!(!Condition::Lt.holds(Ordering::Equal));
        assert!(Condition::Ge.holds(Ordering::Equal));
        assert!(Condition::Le.holds(Ordering::Less));
        assert!(Condition::Ne.holds(Ordering::Greater));
    }

    #[test]
    fn test_invoke_stack_effect() {
        let m = MethodRef::new("a/B", "f", "(IJ)I");
        assert_eq!(Instruction::InvokeStatic(m.clone()).stack_effect().unwrap(), (2, 1));
        assert_eq!(Instruction::InvokeVirtual(m).stack_effect().unwrap(), (3, 1));
    }

    #[test]
    fn test_switch_targets() {
        let ins = Instruction::TableSwitch {
            low: 0,
            targets: vec![4, 5].into_boxed_slice(),
            default: 6,
        };
        assert_eq!(ins.branch_targets(), vec![4, 5, 6]);
        assert!(!ins.falls_through());
    }
}
