//! Frame-map builder.
//!
//! Replays an [`EventLog`] to compute, for every bytecode offset and every
//! trace point, which frame slots hold references.
//!
//! # Algorithm
//!
//! ```text
//! repeat
//!     running := clear
//!     for event in log
//!         Fork(c)      snapshot[c] := running
//!         Resume(c)    running := snapshot[c]
//!         Handler      running := AND(stored[ip] for ip in range) - stack + slot0
//!         Ip(ip)       merge point:  stored[ip] &= running; running := stored[ip]
//!                      otherwise:    stored[ip] := running
//!         Mark/Clear   set/clear one bit
//!         Trace(t)     trace[t] := running
//! until no stored bitmap changed
//! ```
//!
//! Back edges are why the loop exists: the predecessor that narrows a loop
//! header is replayed after the header's successors have already consumed
//! its wider bitmap. Stored bitmaps only ever lose bits, so the iteration
//! terminates, and for verified bytecode the fixed point is exact.

use super::event::{ContextId, Event, EventLog};
use crate::bitmap::FrameBitmap;
use crate::frame::FrameLayout;
use rustc_hash::FxHashMap;

/// Result of frame-map construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMaps {
    per_ip: Vec<Option<FrameBitmap>>,
    traces: Vec<FrameBitmap>,
    passes: u32,
}

impl FrameMaps {
    /// Bitmap on entry to the instruction at `ip`; `None` if unreachable.
    #[inline]
    pub fn at_ip(&self, ip: u32) -> Option<&FrameBitmap> {
        self.per_ip.get(ip as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn trace(&self, id: u32) -> &FrameBitmap {
        &self.traces[id as usize]
    }

    #[inline]
    pub fn traces(&self) -> &[FrameBitmap] {
        &self.traces
    }

    pub fn into_traces(self) -> Vec<FrameBitmap> {
        self.traces
    }

    /// Replay passes needed to reach the fixed point.
    #[inline]
    pub fn passes(&self) -> u32 {
        self.passes
    }
}

/// Compute frame maps for a translated method.
///
/// `visits[ip]` is the number of times translation arrived at `ip`.
pub fn build(log: &EventLog, visits: &[u16], layout: &FrameLayout, trace_count: usize) -> FrameMaps {
    let slots = layout.slot_count();
    let mut per_ip: Vec<Option<FrameBitmap>> = vec![None; visits.len()];
    let mut traces = vec![FrameBitmap::new(slots); trace_count];
    let mut snapshots: FxHashMap<ContextId, FrameBitmap> = FxHashMap::default();
    let mut passes = 0;

    loop {
        passes += 1;
        let mut dirty = false;
        let mut running = FrameBitmap::new(slots);
        snapshots.clear();

        for event in log.events() {
            match *event {
                Event::Fork(ctx) => {
                    snapshots.insert(ctx, running.clone());
                }
                Event::Resume(ctx) => match snapshots.get(&ctx) {
                    Some(snapshot) => running.clone_from(snapshot),
                    None => unreachable!("context {ctx} resumed before it was forked"),
                },
                Event::Handler { start, end } => {
                    running = handler_entry(&per_ip, visits, layout, start, end, &mut dirty);
                }
                Event::Ip(ip) => {
                    let stored = &mut per_ip[ip as usize];
                    if visits[ip as usize] > 1 {
                        match stored {
                            Some(bits) => {
                                dirty |= bits.and_assign(&running);
                                running.clone_from(bits);
                            }
                            None => *stored = Some(running.clone()),
                        }
                    } else if stored.as_ref() != Some(&running) {
                        dirty |= passes > 1;
                        *stored = Some(running.clone());
                    }
                }
                Event::Mark(slot) => running.set(slot as usize),
                Event::Clear(slot) => running.clear(slot as usize),
                Event::Trace(id) => traces[id as usize].clone_from(&running),
            }
        }

        if !dirty {
            break;
        }
    }

    tracing::trace!(passes, traces = traces.len(), "frame maps converged");
    FrameMaps {
        per_ip,
        traces,
        passes,
    }
}

/// Locals live on entry to a handler are those live at every reached
/// instruction in its range. The operand stack holds only the exception.
fn handler_entry(
    per_ip: &[Option<FrameBitmap>],
    visits: &[u16],
    layout: &FrameLayout,
    start: u32,
    end: u32,
    dirty: &mut bool,
) -> FrameBitmap {
    let mut entry = FrameBitmap::new(layout.slot_count());
    for slot in 0..layout.slot_count() {
        entry.set(slot);
    }
    for ip in start..end {
        if visits[ip as usize] == 0 {
            continue;
        }
        match &per_ip[ip as usize] {
            Some(bits) => {
                entry.and_assign(bits);
            }
            None => *dirty = true,
        }
    }
    entry.clear_range(layout.stack_slots());
    entry.set(layout.stack_slot(0));
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(events: &[Event]) -> EventLog {
        let mut log = EventLog::new();
        for &e in events {
            log.push(e);
        }
        log
    }

    fn ones(bits: &FrameBitmap) -> Vec<usize> {
        bits.iter_ones().collect()
    }

    #[test]
    fn test_straight_line() {
        // 2 locals, 1 stack slot.
        let layout = FrameLayout::new(1, 2, 1, false);
        let log = log(&[
            Event::Mark(0),
            Event::Ip(0),
            Event::Mark(2),
            Event::Ip(1),
            Event::Trace(0),
            Event::Clear(2),
            Event::Mark(1),
            Event::Ip(2),
        ]);
        let maps = build(&log, &[1, 1, 1], &layout, 1);
        assert_eq!(ones(maps.at_ip(0).unwrap()), vec![0]);
        assert_eq!(ones(maps.at_ip(1).unwrap()), vec![0, 2]);
        assert_eq!(ones(maps.trace(0)), vec![0, 2]);
        assert_eq!(ones(maps.at_ip(2).unwrap()), vec![0, 1]);
        assert_eq!(maps.passes(), 1);
    }

    #[test]
    fn test_back_edge_narrows_loop_header() {
        // Local 0 is a reference on entry but an int after the loop body
        // overwrites it; the header must not claim it.
        let layout = FrameLayout::new(1, 1, 0, false);
        let log = log(&[
            Event::Mark(0),
            Event::Ip(0),
            Event::Trace(0),
            Event::Ip(1),
            Event::Clear(0),
            Event::Ip(0),
        ]);
        let maps = build(&log, &[2, 1], &layout, 1);
        assert!(maps.at_ip(0).unwrap().count_ones() == 0);
        assert!(maps.at_ip(1).unwrap().count_ones() == 0);
        assert_eq!(maps.trace(0).count_ones(), 0);
        assert!(maps.passes() >= 2);
    }

    #[test]
    fn test_fork_and_resume() {
        let layout = FrameLayout::new(0, 1, 1, false);
        let log = log(&[
            Event::Ip(0),
            Event::Mark(1),
            Event::Fork(1),
            Event::Clear(1),
            Event::Ip(1),
            Event::Resume(1),
            Event::Ip(2),
        ]);
        let maps = build(&log, &[1, 1, 1], &layout, 0);
        assert_eq!(maps.at_ip(1).unwrap().count_ones(), 0);
        assert_eq!(ones(maps.at_ip(2).unwrap()), vec![1]);
    }

    #[test]
    fn test_handler_entry_intersects_range() {
        // 2 locals, 2 stack slots. Local 0 is a reference across the whole
        // range, local 1 only in part of it.
        let layout = FrameLayout::new(0, 2, 2, false);
        let log = log(&[
            Event::Mark(0),
            Event::Ip(0),
            Event::Mark(1),
            Event::Mark(2),
            Event::Ip(1),
            Event::Clear(2),
            Event::Ip(2),
            Event::Handler { start: 0, end: 2 },
            Event::Ip(3),
        ]);
        let maps = build(&log, &[1, 1, 1, 1], &layout, 0);
        assert_eq!(ones(maps.at_ip(3).unwrap()), vec![0, 2]);
    }

    #[test]
    fn test_rebuild_is_stable() {
        let layout = FrameLayout::new(1, 2, 1, false);
        let log = log(&[
            Event::Mark(0),
            Event::Ip(0),
            Event::Mark(1),
            Event::Fork(1),
            Event::Ip(1),
            Event::Clear(1),
            Event::Ip(0),
            Event::Resume(1),
            Event::Ip(2),
            Event::Trace(0),
        ]);
        let visits = [2, 1, 1];
        let first = build(&log, &visits, &layout, 1);
        let second = build(&log, &visits, &layout, 1);
        assert_eq!(first, second);
    }
}
