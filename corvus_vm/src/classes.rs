//! Class registry and linker.
//!
//! Classes are linked from [`ClassDef`]s into immutable [`Class`]es and
//! registered under both their name and their [`ClassId`]. The id is the
//! index into the registry and also the class word of every instance, so
//! `class_of` on a heap object leads straight back here.
//!
//! Linking lays out fields (inherited first), assigns vtable slots (an
//! override reuses its superclass slot), points every method and slot at
//! its initial thunk and allocates the static storage object.

use crate::error::LinkError;
use corvus_bytecode::{CONSTRUCTOR_NAME, ClassDef, FieldDef, MethodDef, MethodFlags, TypeKind};
use corvus_gc::Heap;
use corvus_jit::{
    Class, ClassId, ClassParts, FieldInfo, Jit, Method, MethodId, MethodParts, VtableEntry,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Names of the classes every runtime defines at startup.
pub mod names {
    pub use corvus_bytecode::{OBJECT_CLASS, STRING_CLASS, THROWABLE_CLASS};

    pub const ERROR: &str = "lang/Error";
    pub const EXCEPTION: &str = "lang/Exception";

    pub const ARITHMETIC_ERROR: &str = "lang/ArithmeticError";
    pub const NULL_POINTER_ERROR: &str = "lang/NullPointerError";
    pub const ARRAY_INDEX_ERROR: &str = "lang/ArrayIndexError";
    pub const NEGATIVE_ARRAY_SIZE_ERROR: &str = "lang/NegativeArraySizeError";
    pub const CLASS_CAST_ERROR: &str = "lang/ClassCastError";
    pub const ILLEGAL_MONITOR_STATE_ERROR: &str = "lang/IllegalMonitorStateError";

    pub const STACK_OVERFLOW_ERROR: &str = "lang/StackOverflowError";
    pub const LINKAGE_ERROR: &str = "lang/LinkageError";
    pub const CLASS_NOT_FOUND_ERROR: &str = "lang/ClassNotFoundError";
    pub const NO_SUCH_METHOD_ERROR: &str = "lang/NoSuchMethodError";
    pub const NO_SUCH_FIELD_ERROR: &str = "lang/NoSuchFieldError";
    pub const INCOMPATIBLE_CLASS_CHANGE_ERROR: &str = "lang/IncompatibleClassChangeError";
    pub const ABSTRACT_METHOD_ERROR: &str = "lang/AbstractMethodError";
    pub const UNSATISFIED_LINK_ERROR: &str = "lang/UnsatisfiedLinkError";
    pub const VERIFY_ERROR: &str = "lang/VerifyError";
    pub const INTERNAL_ERROR: &str = "lang/InternalError";

    pub const RUNTIME: &str = "lang/Runtime";
    pub const CONTINUATIONS: &str = "lang/Continuations";
}

/// Index of the message field in every throwable.
pub const MESSAGE_FIELD: u32 = 0;

/// Source of class definitions consulted when resolution misses.
pub trait ClassLoader: Send + Sync {
    /// Definition of `name`, or `None` if this loader does not know it.
    fn load(&self, name: &str) -> Option<ClassDef>;
}

impl<F> ClassLoader for F
where
    F: Fn(&str) -> Option<ClassDef> + Send + Sync,
{
    fn load(&self, name: &str) -> Option<ClassDef> {
        self(name)
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    by_name: FxHashMap<Arc<str>, Arc<Class>>,
    by_id: Vec<Arc<Class>>,
}

/// All linked classes of one runtime.
pub struct ClassRegistry {
    inner: RwLock<RegistryInner>,
    /// Serializes linking so ids are handed out in registration order.
    link_lock: Mutex<()>,
    next_method: AtomicU32,
    loader: RwLock<Option<Arc<dyn ClassLoader>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            link_lock: Mutex::new(()),
            next_method: AtomicU32::new(0),
            loader: RwLock::new(None),
        }
    }

    #[inline]
    pub fn by_name(&self, name: &str) -> Option<Arc<Class>> {
        self.inner.read().by_name.get(name).cloned()
    }

    #[inline]
    pub fn by_id(&self, id: ClassId) -> Option<Arc<Class>> {
        self.inner.read().by_id.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every linked class, in id order.
    pub fn all(&self) -> Vec<Arc<Class>> {
        self.inner.read().by_id.clone()
    }

    pub fn set_loader(&self, loader: Arc<dyn ClassLoader>) {
        *self.loader.write() = Some(loader);
    }

    pub fn loader(&self) -> Option<Arc<dyn ClassLoader>> {
        self.loader.read().clone()
    }

    /// Block linking. A collector holds this so a statics object cannot be
    /// swept between allocation and registration.
    pub(crate) fn pause_linking(&self) -> MutexGuard<'_, ()> {
        self.link_lock.lock()
    }

    /// Link `def` below `superclass` and register it.
    ///
    /// The superclass must already be linked; the caller resolves it.
    pub(crate) fn link(
        &self,
        def: &ClassDef,
        superclass: Option<Arc<Class>>,
        heap: &Heap,
        jit: &Jit,
    ) -> Result<Arc<Class>, LinkError> {
        let _guard = self.link_lock.lock();
        if self.by_name(&def.name).is_some() {
            return Err(LinkError::Duplicate(def.name.to_string()));
        }
        let id = ClassId(self.len() as u32);

        let (instance_fields, static_fields) = layout_fields(def, superclass.as_deref())?;
        let (methods, vtable) = self.link_methods(def, id, superclass.as_deref(), jit)?;

        let static_refs: Arc<[bool]> = static_fields.iter().map(|f| f.kind.is_reference()).collect();
        let statics = heap.alloc_instance(id.0, static_refs).raw();

        let class = Arc::new(Class::new(ClassParts {
            id,
            name: def.name.clone(),
            superclass,
            instance_fields,
            static_fields,
            methods,
            vtable,
            statics,
        }));

        let mut inner = self.inner.write();
        inner.by_name.insert(def.name.clone(), class.clone());
        inner.by_id.push(class.clone());
        drop(inner);

        tracing::debug!(
            class = %def.name,
            id = id.0,
            methods = class.methods().len(),
            vtable = class.vtable().len(),
            "class linked"
        );
        Ok(class)
    }

    fn link_methods(
        &self,
        def: &ClassDef,
        class: ClassId,
        superclass: Option<&Class>,
        jit: &Jit,
    ) -> Result<(Vec<Arc<Method>>, Vec<VtableEntry>), LinkError> {
        let mut vtable: Vec<VtableEntry> = superclass
            .map(|s| {
                s.vtable()
                    .iter()
                    .map(|e| VtableEntry::new(e.method().clone(), e.address()))
                    .collect()
            })
            .unwrap_or_default();

        let mut methods = Vec::with_capacity(def.methods.len());
        for m in &def.methods {
            let signature = m.parse_descriptor().map_err(|source| LinkError::Descriptor {
                class: def.name.to_string(),
                member: m.name.to_string(),
                source,
            })?;
            let inherited = vtable
                .iter()
                .position(|e| e.method().name() == &*m.name && e.method().descriptor() == &*m.descriptor);
            let vtable_index = if is_virtual(m) {
                Some(inherited.unwrap_or(vtable.len()) as u32)
            } else if inherited.is_some() && m.flags.contains(MethodFlags::STATIC) {
                return Err(LinkError::IncompatibleOverride {
                    class: def.name.to_string(),
                    method: m.name.to_string(),
                });
            } else {
                None
            };

            let method = Arc::new(Method::new(
                MethodParts {
                    id: MethodId(self.next_method.fetch_add(1, Ordering::Relaxed)),
                    class,
                    class_name: def.name.clone(),
                    name: m.name.clone(),
                    descriptor: m.descriptor.clone(),
                    signature,
                    flags: m.flags,
                    code: m.code.clone(),
                    vtable_index,
                },
                jit.initial_address(m.flags),
            ));

            if let Some(index) = vtable_index {
                let entry = VtableEntry::new(method.clone(), jit.initial_vtable_address(&method));
                match vtable.get_mut(index as usize) {
                    Some(slot) => *slot = entry,
                    None => vtable.push(entry),
                }
            }
            methods.push(method);
        }
        Ok((methods, vtable))
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_virtual(m: &MethodDef) -> bool {
    !m.flags.contains(MethodFlags::STATIC)
        && !m.flags.contains(MethodFlags::PRIVATE)
        && &*m.name != CONSTRUCTOR_NAME
}

/// Instance fields (inherited first) and static fields of `def`.
fn layout_fields(
    def: &ClassDef,
    superclass: Option<&Class>,
) -> Result<(Vec<FieldInfo>, Vec<FieldInfo>), LinkError> {
    let mut instance: Vec<FieldInfo> = superclass
        .map(|s| s.instance_fields().to_vec())
        .unwrap_or_default();
    let mut statics = Vec::new();
    for FieldDef {
        name,
        kind,
        is_static,
    } in &def.fields
    {
        if *kind == TypeKind::Void {
            return Err(LinkError::Descriptor {
                class: def.name.to_string(),
                member: name.to_string(),
                source: corvus_bytecode::DescriptorError::VoidField(name.to_string()),
            });
        }
        let fields = if *is_static { &mut statics } else { &mut instance };
        fields.push(FieldInfo {
            name: name.clone(),
            kind: *kind,
            index: fields.len() as u32,
        });
    }
    Ok((instance, statics))
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Classes defined by every runtime, superclasses first.
pub fn bootstrap_classes() -> Vec<ClassDef> {
    use names::*;

    let mut defs = vec![
        ClassDef::root(OBJECT_CLASS),
        ClassDef::new(STRING_CLASS),
        ClassDef::new(THROWABLE_CLASS)
            .field(FieldDef::instance("message", TypeKind::Object))
            .method(MethodDef::native("getMessage", "()Llang/String;", MethodFlags::NONE)),
        ClassDef::new(ERROR).extends(THROWABLE_CLASS),
        ClassDef::new(EXCEPTION).extends(THROWABLE_CLASS),
    ];
    for name in [
        ARITHMETIC_ERROR,
        NULL_POINTER_ERROR,
        ARRAY_INDEX_ERROR,
        NEGATIVE_ARRAY_SIZE_ERROR,
        CLASS_CAST_ERROR,
        ILLEGAL_MONITOR_STATE_ERROR,
    ] {
        defs.push(ClassDef::new(name).extends(EXCEPTION));
    }
    defs.push(ClassDef::new(STACK_OVERFLOW_ERROR).extends(ERROR));
    defs.push(ClassDef::new(INTERNAL_ERROR).extends(ERROR));
    defs.push(ClassDef::new(LINKAGE_ERROR).extends(ERROR));
    for name in [
        CLASS_NOT_FOUND_ERROR,
        NO_SUCH_METHOD_ERROR,
        NO_SUCH_FIELD_ERROR,
        INCOMPATIBLE_CLASS_CHANGE_ERROR,
        UNSATISFIED_LINK_ERROR,
        VERIFY_ERROR,
    ] {
        defs.push(ClassDef::new(name).extends(LINKAGE_ERROR));
    }
    defs.push(ClassDef::new(ABSTRACT_METHOD_ERROR).extends(INCOMPATIBLE_CLASS_CHANGE_ERROR));

    defs.push(
        ClassDef::new(RUNTIME)
            .method(MethodDef::native("stackDepth", "()I", MethodFlags::STATIC))
            .method(MethodDef::native("gc", "()V", MethodFlags::STATIC)),
    );
    defs.push(
        ClassDef::new(CONTINUATIONS)
            .method(MethodDef::native("capture", "()I", MethodFlags::STATIC)),
    );
    defs
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use corvus_bytecode::OBJECT_CLASS;
    use corvus_gc::GcConfig;
    use corvus_jit::JitOptions;

    fn setup() -> (ClassRegistry, Heap, Jit) {
        let registry = ClassRegistry::new();
        let heap = Heap::new(GcConfig::default());
        let jit = Jit::new(JitOptions::default()).unwrap();
        (registry, heap, jit)
    }

    fn object(registry: &ClassRegistry, heap: &Heap, jit: &Jit) -> Arc<Class> {
        registry
            .link(&ClassDef::root(OBJECT_CLASS), None, heap, jit)
            .unwrap()
    }

    #[test]
    fn test_ids_follow_registration_order() {
        let (registry, heap, jit) = setup();
        let root = object(&registry, &heap, &jit);
        let child = registry
            .link(&ClassDef::new("app/A"), Some(root.clone()), &heap, &jit)
            .unwrap();
        assert_eq!(root.id(), ClassId(0));
        assert_eq!(child.id(), ClassId(1));
        assert!(Arc::ptr_eq(&registry.by_id(ClassId(1)).unwrap(), &child));
        assert!(Arc::ptr_eq(&registry.by_name("app/A").unwrap(), &child));
        assert_eq!(heap.class_of(child.statics()), Ok(1));
    }

    #[test]
    fn test_duplicate_definition_is_rejected() {
        let (registry, heap, jit) = setup();
        object(&registry, &heap, &jit);
        let err = registry
            .link(&ClassDef::root(OBJECT_CLASS), None, &heap, &jit)
            .unwrap_err();
        assert_eq!(err, LinkError::Duplicate(OBJECT_CLASS.to_string()));
    }

    #[test]
    fn test_fields_are_inherited_first() {
        let (registry, heap, jit) = setup();
        let root = object(&registry, &heap, &jit);
        let base = registry
            .link(
                &ClassDef::new("app/Base").field(FieldDef::instance("next", TypeKind::Object)),
                Some(root),
                &heap,
                &jit,
            )
            .unwrap();
        let derived = registry
            .link(
                &ClassDef::new("app/Derived")
                    .extends("app/Base")
                    .field(FieldDef::instance("count", TypeKind::Int))
                    .field(FieldDef::static_field("instances", TypeKind::Long)),
                Some(base),
                &heap,
                &jit,
            )
            .unwrap();
        assert_eq!(derived.instance_field("next").unwrap().index, 0);
        assert_eq!(derived.instance_field("count").unwrap().index, 1);
        assert_eq!(&*derived.ref_map().to_vec(), &[true, false]);
        assert_eq!(derived.static_fields()[0].index, 0);
    }

    #[test]
    fn test_override_reuses_vtable_slot() {
        let (registry, heap, jit) = setup();
        let root = object(&registry, &heap, &jit);
        let base = registry
            .link(
                &ClassDef::new("app/Shape")
                    .method(MethodDef::native("area", "()I", MethodFlags::NONE))
                    .method(MethodDef::native("name", "()I", MethodFlags::NONE))
                    .method(MethodDef::native("helper", "()V", MethodFlags::PRIVATE)),
                Some(root),
                &heap,
                &jit,
            )
            .unwrap();
        let square = registry
            .link(
                &ClassDef::new("app/Square")
                    .extends("app/Shape")
                    .method(MethodDef::native("area", "()I", MethodFlags::NONE))
                    .method(MethodDef::native("side", "()I", MethodFlags::NONE)),
                Some(base.clone()),
                &heap,
                &jit,
            )
            .unwrap();

        assert_eq!(base.vtable().len(), 2);
        assert_eq!(square.vtable().len(), 3);
        assert_eq!(square.vtable()[0].method().class_name(), "app/Square");
        assert_eq!(square.vtable()[1].method().class_name(), "app/Shape");
        assert_eq!(square.methods()[1].vtable_index(), Some(2));
        assert_eq!(base.methods()[2].vtable_index(), None);
    }

    #[test]
    fn test_static_cannot_hide_virtual() {
        let (registry, heap, jit) = setup();
        let root = object(&registry, &heap, &jit);
        let base = registry
            .link(
                &ClassDef::new("app/Base").method(MethodDef::native("f", "()V", MethodFlags::NONE)),
                Some(root),
                &heap,
                &jit,
            )
            .unwrap();
        let err = registry
            .link(
                &ClassDef::new("app/Bad")
                    .extends("app/Base")
                    .method(MethodDef::native("f", "()V", MethodFlags::STATIC)),
                Some(base),
                &heap,
                &jit,
            )
            .unwrap_err();
        assert!(matches!(err, LinkError::IncompatibleOverride { .. }));
    }

    #[test]
    fn test_bootstrap_lists_superclasses_first() {
        let defs = bootstrap_classes();
        let mut seen = Vec::new();
        for def in &defs {
            if let Some(superclass) = &def.superclass {
                assert!(seen.contains(superclass), "{} before {}", def.name, superclass);
            }
            seen.push(def.name.clone());
        }
        assert!(seen.iter().any(|n| &**n == names::ABSTRACT_METHOD_ERROR));
    }
}
