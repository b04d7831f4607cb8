//! Fixed-width bitmaps over frame slots.

use smallvec::SmallVec;
use std::fmt;

/// One bit per frame slot; a set bit means the slot holds a reference.
///
/// Frames of up to 128 slots stay inline.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct FrameBitmap {
    words: SmallVec<[u64; 2]>,
    len: usize,
}

impl FrameBitmap {
    /// All-clear bitmap covering `len` slots.
    pub fn new(len: usize) -> Self {
        Self {
            words: SmallVec::from_elem(0, len.div_ceil(64)),
            len,
        }
    }

    /// Number of slots covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, slot: usize) -> bool {
        debug_assert!(slot < self.len);
        self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, slot: usize) {
        debug_assert!(slot < self.len);
        self.words[slot / 64] |= 1 << (slot % 64);
    }

    #[inline]
    pub fn clear(&mut self, slot: usize) {
        debug_assert!(slot < self.len);
        self.words[slot / 64] &= !(1 << (slot % 64));
    }

    /// Clear every slot in `range`.
    pub fn clear_range(&mut self, range: std::ops::Range<usize>) {
        for slot in range {
            self.clear(slot);
        }
    }

    /// Intersect with `other`. Returns whether any bit changed.
    pub fn and_assign(&mut self, other: &FrameBitmap) -> bool {
        debug_assert_eq!(self.len, other.len);
        let mut changed = false;
        for (mine, theirs) in self.words.iter_mut().zip(other.words.iter()) {
            let next = *mine & *theirs;
            changed |= next != *mine;
            *mine = next;
        }
        changed
    }

    /// Number of set slots.
    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Iterate over set slot indices in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(wi * 64 + tz)
            })
        })
    }
}

impl fmt::Debug for FrameBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FrameBitmap(")?;
        for slot in 0..self.len {
            f.write_str(if self.get(slot) { "1" } else { "0" })?;
        }
        f.write_str(")")
    }
}
