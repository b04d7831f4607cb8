//! Class, field and method definitions as handed to the runtime.

use crate::descriptor::{DescriptorError, MethodDescriptor, TypeKind};
use crate::instruction::{ClassRef, Instruction};
use std::sync::Arc;

/// Method access and behaviour flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MethodFlags(u32);

impl MethodFlags {
    /// No flags.
    pub const NONE: MethodFlags = MethodFlags(0);
    /// No receiver; invoked with `InvokeStatic`.
    pub const STATIC: MethodFlags = MethodFlags(1 << 0);
    /// Holds the receiver's (or class's) monitor for the duration of the call.
    pub const SYNCHRONIZED: MethodFlags = MethodFlags(1 << 1);
    /// Implemented by a registered native function.
    pub const NATIVE: MethodFlags = MethodFlags(1 << 2);
    /// Not dispatched virtually.
    pub const PRIVATE: MethodFlags = MethodFlags(1 << 3);
    /// Declared without a body; must be overridden.
    pub const ABSTRACT: MethodFlags = MethodFlags(1 << 4);

    /// Check if a flag is set.
    #[inline]
    pub const fn contains(self, other: MethodFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Combine flags.
    #[inline]
    pub const fn union(self, other: MethodFlags) -> MethodFlags {
        MethodFlags(self.0 | other.0)
    }

    /// Get raw value.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for MethodFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for MethodFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Exception table entry. The range `[start, end)` is in bytecode offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// `None` catches everything.
    pub catch_type: Option<ClassRef>,
}

impl ExceptionHandler {
    #[inline]
    pub fn covers(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// Bytecode body of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBody {
    pub max_locals: u16,
    pub max_stack: u16,
    pub instructions: Box<[Instruction]>,
    /// Ordered; the first matching entry wins.
    pub handlers: Box<[ExceptionHandler]>,
}

impl CodeBody {
    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// A method as defined in a class file.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub flags: MethodFlags,
    pub code: Option<CodeBody>,
}

impl MethodDef {
    pub fn new(
        name: impl Into<Arc<str>>,
        descriptor: impl Into<Arc<str>>,
        flags: MethodFlags,
        code: Option<CodeBody>,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            flags,
            code,
        }
    }

    /// A native method with no bytecode.
    pub fn native(
        name: impl Into<Arc<str>>,
        descriptor: impl Into<Arc<str>>,
        flags: MethodFlags,
    ) -> Self {
        Self::new(name, descriptor, flags | MethodFlags::NATIVE, None)
    }

    pub fn parse_descriptor(&self) -> Result<MethodDescriptor, DescriptorError> {
        MethodDescriptor::parse(&self.descriptor)
    }
}

/// A field as defined in a class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: Arc<str>,
    pub kind: TypeKind,
    pub is_static: bool,
}

impl FieldDef {
    pub fn instance(name: impl Into<Arc<str>>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_static: false,
        }
    }

    pub fn static_field(name: impl Into<Arc<str>>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_static: true,
        }
    }
}

/// A class definition.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: Arc<str>,
    pub superclass: Option<Arc<str>>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    /// Start a class extending `lang/Object`.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            superclass: Some(Arc::from(crate::OBJECT_CLASS)),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// The root class, with no superclass.
    pub fn root(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: impl Into<Arc<str>>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }
}
