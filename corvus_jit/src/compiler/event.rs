//! Event log recorded while translating one method.
//!
//! The log is a linear replay script for the frame-map builder. Code is
//! emitted once per reachable instruction, but every arrival at an
//! instruction (including arrivals that find it already translated) is
//! logged, so the builder sees each control-flow edge.

/// Identifier of a pending translation context (a forked path).
pub type ContextId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Snapshot the running bitmap as the entry state of `ContextId`.
    Fork(ContextId),
    /// Restore the snapshot taken by the matching `Fork`.
    Resume(ContextId),
    /// Enter an exception handler protecting `[start, end)`.
    Handler { start: u32, end: u32 },
    /// Arrival at a bytecode offset.
    Ip(u32),
    /// Slot now holds a reference.
    Mark(u32),
    /// Slot no longer holds a reference.
    Clear(u32),
    /// Record the running bitmap for trace point `id`.
    Trace(u32),
}

/// Append-only event sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    #[inline]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
