//! Frame layout for compiled methods.
//!
//! The native stack grows toward lower addresses and is addressed in words.
//! A compiled frame looks like this (offsets relative to the frame pointer):
//!
//! ```text
//!            ┌──────────────────────┐
//! fp+2+N-1   │ parameter 0          │  ◄─ pushed first by the caller
//!    ...     │ ...                  │
//! fp+2       │ parameter N-1        │  ◄─ args_at of the call
//!            ├──────────────────────┤
//! fp+1       │ return address       │
//! fp+0       │ saved frame pointer  │  ◄─ fp
//!            ├──────────────────────┤
//! fp-1       │ local N              │
//!    ...     │ ...                  │
//!            │ lock slot (sync)     │
//!            │ operand stack 0      │
//!    ...     │ ...                  │
//! fp-size    │ operand stack max-1  │  ◄─ lowest frame word
//!            └──────────────────────┘
//! ```
//!
//! Parameters stay where the caller put them, so the callee's parameter
//! words overlap the caller's (already popped) operand-stack slots.
//!
//! Slot indices, used by frame bitmaps, number locals first
//! (`0..max_locals`), then operand stack slots, then the lock slot.

/// Words occupied by the saved frame pointer and the return address.
pub const FRAME_HEADER_WORDS: i32 = 2;

/// Word offset of the return address from the frame pointer.
pub const RETURN_ADDRESS_OFFSET: i32 = 1;

/// Fixed-size frame description for one compiled method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    params: u16,
    max_locals: u16,
    max_stack: u16,
    synchronized: bool,
}

impl FrameLayout {
    /// `params` is the parameter footprint including any receiver and must
    /// not exceed `max_locals`.
    pub const fn new(params: u16, max_locals: u16, max_stack: u16, synchronized: bool) -> Self {
        Self {
            params,
            max_locals,
            max_stack,
            synchronized,
        }
    }

    #[inline]
    pub const fn params(&self) -> u16 {
        self.params
    }

    #[inline]
    pub const fn max_locals(&self) -> u16 {
        self.max_locals
    }

    #[inline]
    pub const fn max_stack(&self) -> u16 {
        self.max_stack
    }

    #[inline]
    pub const fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Locals that live below the frame pointer.
    #[inline]
    const fn extra_locals(&self) -> u32 {
        (self.max_locals - self.params) as u32
    }

    /// Number of bitmap slots.
    #[inline]
    pub const fn slot_count(&self) -> usize {
        self.max_locals as usize + self.max_stack as usize + self.synchronized as usize
    }

    /// Words the frame reserves below the frame pointer.
    #[inline]
    pub const fn frame_words(&self) -> u32 {
        self.extra_locals() + self.synchronized as u32 + self.max_stack as u32
    }

    /// Slot index of operand stack position `depth`.
    #[inline]
    pub const fn stack_slot(&self, depth: usize) -> usize {
        self.max_locals as usize + depth
    }

    /// Slot index of the lock slot, for synchronized methods.
    #[inline]
    pub const fn lock_slot(&self) -> Option<usize> {
        if self.synchronized {
            Some(self.max_locals as usize + self.max_stack as usize)
        } else {
            None
        }
    }

    /// Range of slot indices occupied by the operand stack.
    #[inline]
    pub fn stack_slots(&self) -> std::ops::Range<usize> {
        self.max_locals as usize..self.max_locals as usize + self.max_stack as usize
    }

    /// Word offset of `slot` relative to the frame pointer.
    pub fn offset(&self, slot: usize) -> i32 {
        let params = self.params as usize;
        let locals = self.max_locals as usize;
        let stack = self.max_stack as usize;
        let extra = self.extra_locals() as i32;
        let lock = self.synchronized as i32;
        if slot < params {
            FRAME_HEADER_WORDS + (params - 1 - slot) as i32
        } else if slot < locals {
            -1 - (slot - params) as i32
        } else if slot < locals + stack {
            -1 - extra - lock - (slot - locals) as i32
        } else {
            debug_assert_eq!(Some(slot), self.lock_slot());
            -1 - extra
        }
    }

    /// Offset of the last argument of a call made while `depth` operand
    /// stack entries are live (the arguments being the topmost ones).
    #[inline]
    pub const fn args_offset(&self, depth: usize) -> i32 {
        -(self.extra_locals() as i32) - self.synchronized as i32 - depth as i32
    }

    /// Offset one past the highest word that belongs to this frame.
    #[inline]
    pub const fn top_offset(&self) -> i32 {
        FRAME_HEADER_WORDS + self.params as i32
    }

    /// Offset of the lowest word that belongs to this frame.
    #[inline]
    pub const fn bottom_offset(&self) -> i32 {
        -(self.frame_words() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_offsets() {
        let layout = FrameLayout::new(3, 3, 0, false);
        assert_eq!(layout.offset(0), 4);
        assert_eq!(layout.offset(1), 3);
        assert_eq!(layout.offset(2), 2);
        assert_eq!(layout.top_offset(), 5);
    }

    #[test]
    fn test_locals_then_stack() {
        let layout = FrameLayout::new(1, 3, 2, false);
        assert_eq!(layout.frame_words(), 4);
        assert_eq!(layout.offset(1), -1);
        assert_eq!(layout.offset(2), -2);
        assert_eq!(layout.offset(layout.stack_slot(0)), -3);
        assert_eq!(layout.offset(layout.stack_slot(1)), -4);
        assert_eq!(layout.bottom_offset(), -4);
        // One live entry that is also the only argument.
        assert_eq!(layout.args_offset(1), layout.offset(layout.stack_slot(0)));
    }

    #[test]
    fn test_lock_slot_sits_between_locals_and_stack() {
        let layout = FrameLayout::new(1, 2, 2, true);
        assert_eq!(layout.slot_count(), 5);
        assert_eq!(layout.lock_slot(), Some(4));
        assert_eq!(layout.offset(4), -2);
        assert_eq!(layout.offset(layout.stack_slot(0)), -3);
        assert_eq!(layout.frame_words(), 4);
    }

    #[test]
    fn test_offsets_are_distinct() {
        let layout = FrameLayout::new(2, 5, 4, true);
        let mut seen: Vec<i32> = (0..layout.slot_count()).map(|s| layout.offset(s)).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), layout.slot_count());
        assert!(seen.iter().all(|&o| o >= layout.bottom_offset() && o < layout.top_offset()));
        assert!(!seen.contains(&0) && !seen.contains(&1));
    }
}
