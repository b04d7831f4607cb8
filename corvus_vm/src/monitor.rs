//! Per-object reentrant monitors.
//!
//! Monitors are not stored in objects: a side table maps an object handle to
//! its owning thread and recursion count. Entries exist only while a monitor
//! is held, and every held object is a GC root so its handle cannot be
//! recycled while the table still names it.

use crate::thread::ThreadId;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Monitor misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MonitorError {
    #[error("monitor of {object:#x} is not held by the current thread")]
    NotOwner { object: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    thread: ThreadId,
    count: u32,
}

/// Side table of held monitors.
#[derive(Default)]
pub struct Monitors {
    held: Mutex<FxHashMap<u64, Owner>>,
    released: Condvar,
}

impl Monitors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire without blocking. Succeeds if the monitor is free or already
    /// held by `thread`.
    pub fn try_enter(&self, object: u64, thread: ThreadId) -> bool {
        let mut held = self.held.lock();
        Self::acquire(&mut held, object, thread)
    }

    /// Acquire, blocking while another thread holds the monitor.
    pub fn enter(&self, object: u64, thread: ThreadId) {
        let mut held = self.held.lock();
        while !Self::acquire(&mut held, object, thread) {
            self.released.wait(&mut held);
        }
    }

    fn acquire(held: &mut FxHashMap<u64, Owner>, object: u64, thread: ThreadId) -> bool {
        match held.get_mut(&object) {
            None => {
                held.insert(object, Owner { thread, count: 1 });
                true
            }
            Some(owner) if owner.thread == thread => {
                owner.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one level of `thread`'s hold on `object`.
    pub fn exit(&self, object: u64, thread: ThreadId) -> Result<(), MonitorError> {
        let mut held = self.held.lock();
        let Some(owner) = held.get_mut(&object).filter(|o| o.thread == thread) else {
            return Err(MonitorError::NotOwner { object });
        };
        owner.count -= 1;
        if owner.count == 0 {
            held.remove(&object);
            drop(held);
            self.released.notify_all();
        }
        Ok(())
    }

    /// Owner and recursion count of `object`'s monitor.
    pub fn owner(&self, object: u64) -> Option<(ThreadId, u32)> {
        self.held.lock().get(&object).map(|o| (o.thread, o.count))
    }

    /// Number of monitors currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Present every held object to `visit`.
    pub fn visit_roots(&self, mut visit: impl FnMut(u64)) {
        for &object in self.held.lock().keys() {
            visit(object);
        }
    }
}
