//! The object heap.
//!
//! A slot table of [`HeapObject`]s guarded by a reader/writer lock. Objects
//! never move, so raw handles stay valid until the object is swept. The
//! collector is a stop-the-world mark-sweep: the embedder stops its mutators,
//! then calls [`Heap::collect`] with a callback that reports every root slot.

use crate::config::GcConfig;
use crate::object::{ElementKind, HeapObject, ObjectBody, ObjectRef, Traceable};
use crate::stats::GcStats;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;

/// Errors from object access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("dangling reference {0:#x}")]
    Dangling(u64),
    #[error("null reference")]
    Null,
    #[error("object {0:#x} is not an instance")]
    NotAnInstance(u64),
    #[error("object {0:#x} is not an array")]
    NotAnArray(u64),
    #[error("object {0:#x} is not a string")]
    NotAString(u64),
    #[error("object {0:#x} has no external payload")]
    NotExternal(u64),
    #[error("field {index} out of range for object {object:#x}")]
    FieldOutOfRange { object: u64, index: u32 },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
}

/// Receives root slots during marking.
pub trait RootVisitor {
    /// Visit a slot holding a raw reference (`0` for null).
    fn visit(&mut self, slot: &mut u64);

    /// Visit a reference held outside of mutable storage.
    fn visit_value(&mut self, value: u64) {
        let mut slot = value;
        self.visit(&mut slot);
    }
}

/// Result of a single collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionOutcome {
    pub marked: usize,
    pub freed: usize,
}

struct HeapInner {
    slots: Vec<Option<HeapObject>>,
    free: Vec<usize>,
    live: usize,
}

impl HeapInner {
    fn get(&self, raw: u64) -> Result<&HeapObject, HeapError> {
        let r = ObjectRef::from_raw(raw).ok_or(HeapError::Null)?;
        self.slots
            .get(r.index())
            .and_then(Option::as_ref)
            .ok_or(HeapError::Dangling(raw))
    }

    fn get_mut(&mut self, raw: u64) -> Result<&mut HeapObject, HeapError> {
        let r = ObjectRef::from_raw(raw).ok_or(HeapError::Null)?;
        self.slots
            .get_mut(r.index())
            .and_then(Option::as_mut)
            .ok_or(HeapError::Dangling(raw))
    }
}

/// The garbage-collected heap.
pub struct Heap {
    config: GcConfig,
    inner: RwLock<HeapInner>,
    since_last_cycle: AtomicUsize,
    stats: GcStats,
}

impl Heap {
    /// Create a heap. The configuration is assumed to be validated.
    pub fn new(config: GcConfig) -> Self {
        let inner = HeapInner {
            slots: Vec::with_capacity(config.initial_capacity),
            free: Vec::new(),
            live: 0,
        };
        Self {
            config,
            inner: RwLock::new(inner),
            since_last_cycle: AtomicUsize::new(0),
            stats: GcStats::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Whether enough has been allocated that a collection is due.
    #[inline]
    pub fn needs_collection(&self) -> bool {
        self.since_last_cycle.load(Ordering::Relaxed) >= self.config.allocation_trigger
    }

    /// Number of live (not yet swept) objects.
    pub fn live_objects(&self) -> usize {
        self.inner.read().live
    }

    /// Whether `raw` names an object that has not been swept.
    pub fn contains(&self, raw: u64) -> bool {
        self.inner.read().get(raw).is_ok()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    fn allocate(&self, object: HeapObject) -> ObjectRef {
        let bytes = object.footprint();
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index] = Some(object);
                index
            }
            None => {
                inner.slots.push(Some(object));
                inner.slots.len() - 1
            }
        };
        inner.live += 1;
        drop(inner);

        self.since_last_cycle.fetch_add(bytes, Ordering::Relaxed);
        self.stats.record_allocation(bytes);
        ObjectRef::from_index(index)
    }

    /// Allocate a zeroed instance.
    pub fn alloc_instance(&self, class: u32, ref_map: Arc<[bool]>) -> ObjectRef {
        let fields = vec![0u64; ref_map.len()].into_boxed_slice();
        self.allocate(HeapObject::new(class, ObjectBody::Instance { fields, ref_map }))
    }

    /// Allocate a zeroed array.
    pub fn alloc_array(&self, class: u32, kind: ElementKind, len: usize) -> ObjectRef {
        let data = vec![0u64; len].into_boxed_slice();
        self.allocate(HeapObject::new(class, ObjectBody::Array { kind, data }))
    }

    pub fn alloc_string(&self, class: u32, text: &str) -> ObjectRef {
        self.allocate(HeapObject::new(class, ObjectBody::Str(Arc::from(text))))
    }

    pub fn alloc_external(&self, class: u32, payload: Arc<dyn Traceable>) -> ObjectRef {
        self.allocate(HeapObject::new(class, ObjectBody::External(payload)))
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn class_of(&self, raw: u64) -> Result<u32, HeapError> {
        Ok(self.inner.read().get(raw)?.class)
    }

    pub fn read_field(&self, raw: u64, index: u32) -> Result<u64, HeapError> {
        let inner = self.inner.read();
        match &inner.get(raw)?.body {
            ObjectBody::Instance { fields, .. } => fields
                .get(index as usize)
                .copied()
                .ok_or(HeapError::FieldOutOfRange { object: raw, index }),
            _ => Err(HeapError::NotAnInstance(raw)),
        }
    }

    pub fn write_field(&self, raw: u64, index: u32, value: u64) -> Result<(), HeapError> {
        let mut inner = self.inner.write();
        match &mut inner.get_mut(raw)?.body {
            ObjectBody::Instance { fields, .. } => {
                let slot = fields
                    .get_mut(index as usize)
                    .ok_or(HeapError::FieldOutOfRange { object: raw, index })?;
                *slot = value;
                Ok(())
            }
            _ => Err(HeapError::NotAnInstance(raw)),
        }
    }

    pub fn array_length(&self, raw: u64) -> Result<usize, HeapError> {
        match &self.inner.read().get(raw)?.body {
            ObjectBody::Array { data, .. } => Ok(data.len()),
            _ => Err(HeapError::NotAnArray(raw)),
        }
    }

    pub fn read_element(&self, raw: u64, index: i64) -> Result<u64, HeapError> {
        let inner = self.inner.read();
        match &inner.get(raw)?.body {
            ObjectBody::Array { data, .. } => usize::try_from(index)
                .ok()
                .and_then(|i| data.get(i).copied())
                .ok_or(HeapError::IndexOutOfBounds {
                    index,
                    len: data.len(),
                }),
            _ => Err(HeapError::NotAnArray(raw)),
        }
    }

    pub fn write_element(&self, raw: u64, index: i64, value: u64) -> Result<(), HeapError> {
        let mut inner = self.inner.write();
        match &mut inner.get_mut(raw)?.body {
            ObjectBody::Array { data, .. } => {
                let len = data.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| data.get_mut(i))
                    .ok_or(HeapError::IndexOutOfBounds { index, len })?;
                *slot = value;
                Ok(())
            }
            _ => Err(HeapError::NotAnArray(raw)),
        }
    }

    pub fn string(&self, raw: u64) -> Result<Arc<str>, HeapError> {
        match &self.inner.read().get(raw)?.body {
            ObjectBody::Str(s) => Ok(s.clone()),
            _ => Err(HeapError::NotAString(raw)),
        }
    }

    pub fn external(&self, raw: u64) -> Result<Arc<dyn Traceable>, HeapError> {
        match &self.inner.read().get(raw)?.body {
            ObjectBody::External(payload) => Ok(payload.clone()),
            _ => Err(HeapError::NotExternal(raw)),
        }
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Run a full mark-sweep cycle.
    ///
    /// The caller must have stopped every mutator. `roots` is invoked once
    /// with the marker and must not call back into the heap.
    pub fn collect(&self, roots: impl FnOnce(&mut dyn RootVisitor)) -> CollectionOutcome {
        let start = Instant::now();
        let _span = tracing::debug_span!("GC cycle").entered();
        tracing::debug!(
            allocated = self.since_last_cycle.load(Ordering::Relaxed),
            "starting GC cycle"
        );

        let mut inner = self.inner.write();
        let mut marker = Marker {
            inner: &mut *inner,
            gray: Vec::new(),
            verify: self.config.verify_roots,
            marked: 0,
        };
        roots(&mut marker);
        marker.drain();
        let marked = marker.marked;

        tracing::trace!(marked, "mark phase complete, sweeping");
        let freed = sweep(&mut inner);
        let live = inner.live;
        drop(inner);

        self.since_last_cycle.store(0, Ordering::Relaxed);
        self.stats.record_collection(freed, live, start.elapsed());
        tracing::debug!(freed, live, "collected");
        CollectionOutcome { marked, freed }
    }
}

struct Marker<'a> {
    inner: &'a mut HeapInner,
    gray: Vec<usize>,
    verify: bool,
    marked: usize,
}

impl Marker<'_> {
    fn mark(&mut self, raw: u64) -> bool {
        let Some(r) = ObjectRef::from_raw(raw) else {
            return true;
        };
        match self.inner.slots.get_mut(r.index()).and_then(Option::as_mut) {
            Some(object) => {
                if !object.marked {
                    object.marked = true;
                    self.marked += 1;
                    self.gray.push(r.index());
                }
                true
            }
            None => false,
        }
    }

    fn drain(&mut self) {
        let mut children = Vec::new();
        while let Some(index) = self.gray.pop() {
            if let Some(object) = &self.inner.slots[index] {
                object.for_each_ref(|child| children.push(child));
            }
            for child in children.drain(..) {
                if !self.mark(child) {
                    tracing::error!(child = format_args!("{child:#x}"), "heap object references a freed object");
                    panic!("heap corruption: reference {child:#x} names a freed object");
                }
            }
        }
    }
}

impl RootVisitor for Marker<'_> {
    fn visit(&mut self, slot: &mut u64) {
        if !self.mark(*slot) && self.verify {
            tracing::error!(root = format_args!("{:#x}", *slot), "root names a freed object");
            panic!("root set inconsistency: {:#x} is not a live object", *slot);
        }
    }
}

fn sweep(inner: &mut HeapInner) -> usize {
    let mut freed = 0;
    let HeapInner { slots, free, live } = inner;
    for (index, slot) in slots.iter_mut().enumerate() {
        match slot {
            Some(object) if object.marked => object.marked = false,
            Some(_) => {
                *slot = None;
                free.push(index);
                freed += 1;
            }
            None => {}
        }
    }
    *live -= freed;
    freed
}
