//! Heap object representation.
//!
//! Objects live in a slot table and are named by handles. A raw handle is a
//! `u64` stored directly in frame slots, fields and array elements; `0` is
//! the null reference.

use std::any::Any;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

/// A non-null reference to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroU64);

impl ObjectRef {
    /// Wrap a raw slot value. Returns `None` for null.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Raw slot value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        // Index + 1 is never zero.
        Self(NonZeroU64::MIN.saturating_add(index as u64))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// Element representation of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Int,
    Long,
    Ref,
}

/// An object whose references are only known to the embedder.
///
/// Used for runtime-internal objects such as captured continuations.
pub trait Traceable: Send + Sync + 'static {
    /// Report every reference held by this object.
    fn trace_refs(&self, visit: &mut dyn FnMut(u64));

    fn as_any(&self) -> &dyn Any;
}

/// Object payload.
pub enum ObjectBody {
    /// Fixed-size field vector. `ref_map[i]` tells whether field `i` holds a
    /// reference.
    Instance {
        fields: Box<[u64]>,
        ref_map: Arc<[bool]>,
    },
    Array {
        kind: ElementKind,
        data: Box<[u64]>,
    },
    Str(Arc<str>),
    External(Arc<dyn Traceable>),
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectBody::Instance { fields, .. } => {
                f.debug_struct("Instance").field("fields", fields).finish()
            }
            ObjectBody::Array { kind, data } => f
                .debug_struct("Array")
                .field("kind", kind)
                .field("len", &data.len())
                .finish(),
            ObjectBody::Str(s) => f.debug_tuple("Str").field(s).finish(),
            ObjectBody::External(_) => f.write_str("External"),
        }
    }
}

/// A heap-resident object.
#[derive(Debug)]
pub struct HeapObject {
    /// Runtime class identifier, opaque to the heap.
    pub class: u32,
    pub body: ObjectBody,
    pub(crate) marked: bool,
}

impl HeapObject {
    pub(crate) fn new(class: u32, body: ObjectBody) -> Self {
        Self {
            class,
            body,
            marked: false,
        }
    }

    /// Approximate footprint used for collection pacing.
    pub(crate) fn footprint(&self) -> usize {
        const HEADER: usize = 16;
        HEADER
            + match &self.body {
                ObjectBody::Instance { fields, .. } => fields.len() * 8,
                ObjectBody::Array { data, .. } => data.len() * 8,
                ObjectBody::Str(s) => s.len(),
                ObjectBody::External(_) => 64,
            }
    }

    /// Visit every outgoing reference.
    pub(crate) fn for_each_ref(&self, mut visit: impl FnMut(u64)) {
        match &self.body {
            ObjectBody::Instance { fields, ref_map } => {
                for (value, &is_ref) in fields.iter().zip(ref_map.iter()) {
                    if is_ref && *value != 0 {
                        visit(*value);
                    }
                }
            }
            ObjectBody::Array {
                kind: ElementKind::Ref,
                data,
            } => {
                for &value in data.iter().filter(|&&v| v != 0) {
                    visit(value);
                }
            }
            ObjectBody::Array { .. } | ObjectBody::Str(_) => {}
            ObjectBody::External(ext) => ext.trace_refs(&mut |v| {
                if v != 0 {
                    visit(v)
                }
            }),
        }
    }
}
