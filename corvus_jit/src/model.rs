//! Runtime view of classes and methods.
//!
//! Linked classes are immutable apart from their atomically patched code
//! cells: each [`Method`] carries the address callers should jump to, and
//! each vtable slot carries the address used for virtual dispatch. Both
//! start out pointing at a compile thunk and are patched exactly once to
//! their final target.

use crate::code::CompiledCode;
use crate::error::ResolveError;
use corvus_bytecode::{CodeBody, FieldRef, MethodDescriptor, MethodFlags, MethodRef, TypeKind};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Runtime class identifier; also the class word stored in heap objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Runtime method identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

// =============================================================================
// Method
// =============================================================================

/// Everything needed to construct a [`Method`].
#[derive(Debug)]
pub struct MethodParts {
    pub id: MethodId,
    pub class: ClassId,
    pub class_name: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub signature: MethodDescriptor,
    pub flags: MethodFlags,
    pub code: Option<CodeBody>,
    pub vtable_index: Option<u32>,
}

/// A linked method.
pub struct Method {
    parts: MethodParts,
    /// Current entry address: a thunk until compiled.
    address: AtomicU64,
    compiled: OnceLock<Arc<CompiledCode>>,
}

impl Method {
    /// Create a method whose entry points at `initial_address`.
    pub fn new(parts: MethodParts, initial_address: u64) -> Self {
        Self {
            parts,
            address: AtomicU64::new(initial_address),
            compiled: OnceLock::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> MethodId {
        self.parts.id
    }

    #[inline]
    pub fn class(&self) -> ClassId {
        self.parts.class
    }

    #[inline]
    pub fn class_name(&self) -> &str {
        &self.parts.class_name
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.parts.name
    }

    #[inline]
    pub fn descriptor(&self) -> &str {
        &self.parts.descriptor
    }

    #[inline]
    pub fn signature(&self) -> &MethodDescriptor {
        &self.parts.signature
    }

    #[inline]
    pub fn flags(&self) -> MethodFlags {
        self.parts.flags
    }

    #[inline]
    pub fn code(&self) -> Option<&CodeBody> {
        self.parts.code.as_ref()
    }

    #[inline]
    pub fn vtable_index(&self) -> Option<u32> {
        self.parts.vtable_index
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.parts.flags.contains(MethodFlags::STATIC)
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        self.parts.flags.contains(MethodFlags::NATIVE)
    }

    #[inline]
    pub fn is_synchronized(&self) -> bool {
        self.parts.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        self.parts.flags.contains(MethodFlags::ABSTRACT)
    }

    /// Argument words including the receiver.
    #[inline]
    pub fn param_footprint(&self) -> u16 {
        self.parts.signature.param_count() as u16 + u16::from(!self.is_static())
    }

    /// Kinds of every argument word, receiver first.
    pub fn param_kinds(&self) -> impl Iterator<Item = TypeKind> + '_ {
        let receiver = (!self.is_static()).then_some(TypeKind::Object);
        receiver
            .into_iter()
            .chain(self.parts.signature.params().iter().copied())
    }

    #[inline]
    pub fn return_kind(&self) -> TypeKind {
        self.parts.signature.return_kind()
    }

    /// Address callers jump to.
    #[inline]
    pub fn code_address(&self) -> u64 {
        self.address.load(Ordering::Acquire)
    }

    /// Compiled code, once installed.
    #[inline]
    pub fn compiled(&self) -> Option<&Arc<CompiledCode>> {
        self.compiled.get()
    }

    /// Move the entry address from `from` to `to`. Fails if the address has
    /// already left `from`.
    pub(crate) fn publish(&self, from: u64, to: u64) -> Result<(), u64> {
        self.address
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    pub(crate) fn attach_code(&self, code: Arc<CompiledCode>) -> bool {
        self.compiled.set(code).is_ok()
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Method({}.{}{} @ {:#x})",
            self.parts.class_name,
            self.parts.name,
            self.parts.descriptor,
            self.code_address()
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}",
            self.parts.class_name, self.parts.name, self.parts.descriptor
        )
    }
}

// =============================================================================
// Class
// =============================================================================

/// Layout of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: Arc<str>,
    pub kind: TypeKind,
    /// Index into the instance or static field vector.
    pub index: u32,
}

/// A vtable slot.
#[derive(Debug)]
pub struct VtableEntry {
    method: Arc<Method>,
    address: AtomicU64,
}

impl VtableEntry {
    pub fn new(method: Arc<Method>, address: u64) -> Self {
        Self {
            method,
            address: AtomicU64::new(address),
        }
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.address.load(Ordering::Acquire)
    }

    /// Replace the unresolved `from` address with `to`. A slot that already
    /// left `from` is never changed again.
    pub fn patch(&self, from: u64, to: u64) -> bool {
        self.address
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Everything needed to construct a [`Class`].
#[derive(Debug)]
pub struct ClassParts {
    pub id: ClassId,
    pub name: Arc<str>,
    pub superclass: Option<Arc<Class>>,
    pub instance_fields: Vec<FieldInfo>,
    pub static_fields: Vec<FieldInfo>,
    pub methods: Vec<Arc<Method>>,
    pub vtable: Vec<VtableEntry>,
    /// Static field storage object; also the monitor for static
    /// synchronized methods.
    pub statics: u64,
}

/// A linked class.
#[derive(Debug)]
pub struct Class {
    id: ClassId,
    name: Arc<str>,
    superclass: Option<Arc<Class>>,
    instance_fields: Box<[FieldInfo]>,
    static_fields: Box<[FieldInfo]>,
    ref_map: Arc<[bool]>,
    static_ref_map: Arc<[bool]>,
    methods: Box<[Arc<Method>]>,
    vtable: Box<[VtableEntry]>,
    statics: u64,
}

impl Class {
    pub fn new(parts: ClassParts) -> Self {
        let ref_map = reference_map(&parts.instance_fields);
        let static_ref_map = reference_map(&parts.static_fields);
        Self {
            id: parts.id,
            name: parts.name,
            superclass: parts.superclass,
            instance_fields: parts.instance_fields.into_boxed_slice(),
            static_fields: parts.static_fields.into_boxed_slice(),
            ref_map,
            static_ref_map,
            methods: parts.methods.into_boxed_slice(),
            vtable: parts.vtable.into_boxed_slice(),
            statics: parts.statics,
        }
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn superclass(&self) -> Option<&Arc<Class>> {
        self.superclass.as_ref()
    }

    /// Instance fields, inherited ones first.
    #[inline]
    pub fn instance_fields(&self) -> &[FieldInfo] {
        &self.instance_fields
    }

    #[inline]
    pub fn static_fields(&self) -> &[FieldInfo] {
        &self.static_fields
    }

    /// Which instance fields hold references.
    #[inline]
    pub fn ref_map(&self) -> &Arc<[bool]> {
        &self.ref_map
    }

    #[inline]
    pub fn static_ref_map(&self) -> &Arc<[bool]> {
        &self.static_ref_map
    }

    /// Methods declared by this class.
    #[inline]
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    #[inline]
    pub fn vtable(&self) -> &[VtableEntry] {
        &self.vtable
    }

    #[inline]
    pub fn statics(&self) -> u64 {
        self.statics
    }

    /// Whether this class is `other` or one of its subclasses.
    pub fn is_subclass_of(&self, other: ClassId) -> bool {
        let mut current = Some(self);
        while let Some(class) = current {
            if class.id == other {
                return true;
            }
            current = class.superclass.as_deref();
        }
        false
    }

    /// Find a method by name and descriptor, searching superclasses.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Arc<Method>> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(m) = class
                .methods
                .iter()
                .find(|m| m.name() == name && m.descriptor() == descriptor)
            {
                return Some(m);
            }
            current = class.superclass.as_deref();
        }
        None
    }

    pub fn instance_field(&self, name: &str) -> Option<&FieldInfo> {
        // Later (subclass) declarations shadow inherited ones.
        self.instance_fields.iter().rev().find(|f| &*f.name == name)
    }

    /// Find a static field, searching superclasses. Returns the declaring
    /// class with the field.
    pub fn find_static_field(&self, name: &str) -> Option<(&Class, &FieldInfo)> {
        let mut current = Some(self);
        while let Some(class) = current {
            if let Some(f) = class.static_fields.iter().find(|f| &*f.name == name) {
                return Some((class, f));
            }
            current = class.superclass.as_deref();
        }
        None
    }
}

fn reference_map(fields: &[FieldInfo]) -> Arc<[bool]> {
    let mut map = vec![false; fields.len()];
    for f in fields {
        map[f.index as usize] = f.kind.is_reference();
    }
    Arc::from(map)
}

// =============================================================================
// Resolution
// =============================================================================

/// How a call site dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Static,
    Virtual,
    Special,
}

/// A resolved field reference.
#[derive(Debug, Clone)]
pub struct ResolvedField {
    /// Declaring class (its static storage, for static fields).
    pub owner: Arc<Class>,
    pub index: u32,
    pub kind: TypeKind,
}

/// Symbolic resolution as seen by the compiler.
///
/// Resolution may define new classes; it must never re-enter compilation.
pub trait Resolver: Send + Sync {
    fn resolve_class(&self, name: &str) -> Result<Arc<Class>, ResolveError>;

    fn resolve_method(
        &self,
        reference: &MethodRef,
        kind: InvokeKind,
    ) -> Result<Arc<Method>, ResolveError>;

    fn resolve_field(
        &self,
        reference: &FieldRef,
        is_static: bool,
    ) -> Result<ResolvedField, ResolveError>;

    /// Intern a string constant and return its (permanently rooted) handle.
    fn intern_string(&self, text: &str) -> Result<u64, ResolveError>;
}
