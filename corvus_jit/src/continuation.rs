//! First-class continuations over compiled frames.
//!
//! Capture copies every compiled frame of the current call trace into a
//! chain of nodes, innermost first. Each node keeps the whole footprint of
//! its frame, from the lowest operand slot up to and including the
//! parameters:
//!
//! ```text
//!  node 0 (innermost) ──► node 1 ──► ... ──► node n (outermost) ──► None
//!   words = [fp - frame_words, fp + 2 + params)
//! ```
//!
//! Restore writes the footprints back at a new position on a (possibly
//! different) stack, shifting every frame by the same delta, then relinks
//! the saved frame pointers. Return addresses point into code, which never
//! moves, so they are copied unchanged. The outermost frame is linked to the
//! trace boundary it is restored under.
//!
//! Frame footprints overlap: a callee's parameters are the caller's popped
//! operand slots. Both copies hold the same words, so writing frames from
//! the outermost inwards reproduces the original stack exactly.

use crate::code::CompiledCode;
use crate::compiler::Jit;
use crate::error::ContinuationError;
use crate::frame::RETURN_ADDRESS_OFFSET;
use crate::unwind::{FrameState, FrameWalker, StackMemory, slot_address};
use corvus_gc::Traceable;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// One captured activation.
struct CapturedFrame {
    code: Arc<CompiledCode>,
    return_address: u64,
    original_fp: u64,
    words: Box<[u64]>,
}

impl CapturedFrame {
    #[inline]
    fn bottom(&self) -> u64 {
        slot_address(self.original_fp, self.code.layout().bottom_offset())
    }

    #[inline]
    fn top(&self) -> u64 {
        slot_address(self.original_fp, self.code.layout().top_offset())
    }

    fn trace(&self, visit: &mut dyn FnMut(u64)) {
        let layout = self.code.layout();
        // Checked when the frame was captured.
        let Some(bitmap) = self.code.root_map(self.return_address) else {
            return;
        };
        let bottom = layout.bottom_offset();
        for slot in bitmap.iter_ones() {
            let index = (layout.offset(slot) - bottom) as usize;
            visit(self.words[index]);
        }
    }
}

/// A captured chain of compiled frames.
pub struct Continuation {
    frame: CapturedFrame,
    next: Option<Arc<Continuation>>,
}

impl Continuation {
    /// Capture the compiled frames of the current trace, starting at the
    /// frame that owns return address `ip`.
    pub fn capture<M: StackMemory + ?Sized>(
        jit: &Jit,
        stack: &M,
        ip: u64,
        fp: u64,
    ) -> Result<Arc<Continuation>, ContinuationError> {
        let mut frames = Vec::new();
        for frame in FrameWalker::new(jit, stack, ip, fp) {
            // Fatal if the frame cannot be scanned.
            let _ = frame.root_addresses().count();
            let code = frame.code().clone();
            let layout = *code.layout();
            let bottom = slot_address(frame.fp(), layout.bottom_offset());
            let len = (layout.top_offset() - layout.bottom_offset()) as u64;
            let words = (0..len).map(|i| stack.read(bottom + i)).collect();
            frames.push(CapturedFrame {
                code,
                return_address: frame.ip(),
                original_fp: frame.fp(),
                words,
            });
        }

        let depth = frames.len();
        let mut next = None;
        for frame in frames.into_iter().rev() {
            next = Some(Arc::new(Continuation { frame, next }));
        }
        let head = next.ok_or(ContinuationError::NoFrames)?;
        tracing::trace!(depth, "continuation captured");
        Ok(head)
    }

    /// Number of frames in the chain.
    pub fn depth(&self) -> usize {
        self.iter().count()
    }

    fn iter(&self) -> impl Iterator<Item = &Continuation> {
        std::iter::successors(Some(self), |node| node.next.as_deref())
    }

    /// Method of the innermost frame.
    pub fn method(&self) -> &Arc<crate::model::Method> {
        self.frame.code.method()
    }

    /// Write the chain back onto `stack` so the outermost frame ends just
    /// below `top`, linked to the boundary `(boundary_ip, boundary_fp)`.
    ///
    /// Returns the state to resume the innermost frame in: its return
    /// address, relocated frame pointer and stack pointer.
    pub fn restore<M: StackMemory + ?Sized>(
        &self,
        stack: &mut M,
        top: u64,
        boundary_ip: u64,
        boundary_fp: u64,
    ) -> Result<FrameState, ContinuationError> {
        let nodes: Vec<&Continuation> = self.iter().collect();
        let (Some(inner), Some(outer)) = (nodes.first(), nodes.last()) else {
            return Err(ContinuationError::NoFrames);
        };
        let needed = outer.frame.top() - inner.frame.bottom();
        let available = top.saturating_sub(stack.limit());
        if needed > available {
            return Err(ContinuationError::StackOverflow { needed, available });
        }
        let delta = top.wrapping_sub(outer.frame.top());
        let relocate = |address: u64| address.wrapping_add(delta);

        for (index, node) in nodes.iter().enumerate().rev() {
            let frame = &node.frame;
            let bottom = relocate(frame.bottom());
            for (i, &word) in frame.words.iter().enumerate() {
                stack.write(bottom + i as u64, word);
            }
            let fp = relocate(frame.original_fp);
            match nodes.get(index + 1) {
                Some(caller) => stack.write(fp, relocate(caller.frame.original_fp)),
                None => {
                    stack.write(fp, boundary_fp);
                    stack.write(slot_address(fp, RETURN_ADDRESS_OFFSET), boundary_ip);
                }
            }
        }

        let fp = relocate(inner.frame.original_fp);
        tracing::trace!(depth = nodes.len(), "continuation restored");
        Ok(FrameState {
            ip: inner.frame.return_address,
            fp,
            sp: slot_address(fp, inner.frame.code.layout().bottom_offset()),
        })
    }
}

impl Traceable for Continuation {
    fn trace_refs(&self, visit: &mut dyn FnMut(u64)) {
        for node in self.iter() {
            node.frame.trace(visit);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for node in self.iter() {
            list.entry(&format_args!(
                "{} @ {:#x}",
                node.frame.code.method(),
                node.frame.return_address
            ));
        }
        list.finish()
    }
}
