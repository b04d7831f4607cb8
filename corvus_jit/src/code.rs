//! Compiled code blocks and the code space.
//!
//! A [`CompiledCode`] is the immovable result of compiling one method:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ CodeBlock      start ─► [Inst, Inst, ..., Inst] ◄─ end │
//! │ object pool    [AtomicU64; n]   (GC roots)             │
//! │ root maps      return offset ─► FrameBitmap (sorted)   │
//! │ ip map         native offset ─► bytecode offset        │
//! │ handlers       exception-table index ─► native offset  │
//! └────────────────────────────────────────────────────────┘
//! ```

use crate::backend::Inst;
use crate::bitmap::FrameBitmap;
use crate::frame::FrameLayout;
use crate::model::Method;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// CodeSpace
// =============================================================================

/// Lowest code address handed out. Keeps small integers from ever looking
/// like code.
pub const CODE_SPACE_BASE: u64 = 0x1_0000;

/// Append-only allocator of code addresses. Ranges are never reused.
#[derive(Debug)]
pub struct CodeSpace {
    next: AtomicU64,
}

impl CodeSpace {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(CODE_SPACE_BASE),
        }
    }

    /// Reserve `len` address units, aligned to 16.
    pub fn reserve(&self, len: usize) -> u64 {
        let size = (len as u64).max(1).next_multiple_of(16);
        self.next.fetch_add(size, Ordering::Relaxed)
    }

    /// Total address units reserved so far.
    pub fn used(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - CODE_SPACE_BASE
    }
}

impl Default for CodeSpace {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CodeBlock
// =============================================================================

/// Instructions placed at a fixed address.
pub struct CodeBlock {
    start: u64,
    insts: Box<[Inst]>,
}

impl CodeBlock {
    pub fn new(start: u64, insts: Box<[Inst]>) -> Self {
        Self { start, insts }
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.insts.len() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end()
    }

    /// Instruction at an absolute address.
    #[inline]
    pub fn at(&self, address: u64) -> Option<&Inst> {
        address
            .checked_sub(self.start)
            .and_then(|i| self.insts.get(i as usize))
    }

    #[inline]
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }
}

impl fmt::Debug for CodeBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeBlock")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &self.insts.len())
            .finish()
    }
}

// =============================================================================
// CompiledCode
// =============================================================================

/// Metadata collected while compiling, before placement.
#[derive(Debug, Default)]
pub struct CodeMetadata {
    pub pool: Vec<u64>,
    /// `(return offset, bitmap)` for every trace point.
    pub root_maps: Vec<(u32, FrameBitmap)>,
    /// `(native offset, bytecode offset)`, ascending by native offset.
    pub ip_map: Vec<(u32, u32)>,
    /// Native offset of each exception handler, indexed like the method's
    /// exception table. `None` for handlers whose range is unreachable.
    pub handlers: Vec<Option<u32>>,
}

/// A compiled method.
pub struct CompiledCode {
    method: Arc<Method>,
    block: Arc<CodeBlock>,
    layout: FrameLayout,
    pool: Box<[AtomicU64]>,
    root_maps: Box<[(u32, FrameBitmap)]>,
    ip_map: Box<[(u32, u32)]>,
    handlers: Box<[Option<u32>]>,
}

impl CompiledCode {
    pub fn new(
        method: Arc<Method>,
        block: Arc<CodeBlock>,
        layout: FrameLayout,
        metadata: CodeMetadata,
    ) -> Self {
        let mut root_maps = metadata.root_maps;
        root_maps.sort_by_key(|&(offset, _)| offset);
        debug_assert!(root_maps.windows(2).all(|w| w[0].0 < w[1].0));
        debug_assert!(metadata.ip_map.windows(2).all(|w| w[0].0 <= w[1].0));
        Self {
            method,
            block,
            layout,
            pool: metadata.pool.into_iter().map(AtomicU64::new).collect(),
            root_maps: root_maps.into_boxed_slice(),
            ip_map: metadata.ip_map.into_boxed_slice(),
            handlers: metadata.handlers.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    #[inline]
    pub fn block(&self) -> &Arc<CodeBlock> {
        &self.block
    }

    #[inline]
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.block.start()
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.block.end()
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        self.block.contains(address)
    }

    /// Frame bitmap for a return address (or trap resume address).
    ///
    /// Only exact matches count: every address at which a frame can be
    /// observed has its own entry.
    pub fn root_map(&self, address: u64) -> Option<&FrameBitmap> {
        let offset = u32::try_from(address.checked_sub(self.start())?).ok()?;
        self.root_maps
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
            .map(|i| &self.root_maps[i].1)
    }

    /// Number of recorded trace points.
    #[inline]
    pub fn root_map_count(&self) -> usize {
        self.root_maps.len()
    }

    /// All `(return offset, bitmap)` pairs.
    #[inline]
    pub fn root_maps(&self) -> &[(u32, FrameBitmap)] {
        &self.root_maps
    }

    /// Bytecode offset of the instruction that produced the call or trap
    /// whose following address is `address`.
    pub fn bytecode_offset(&self, address: u64) -> Option<u32> {
        let offset = u32::try_from(address.checked_sub(self.start())?.checked_sub(1)?).ok()?;
        let idx = self.ip_map.partition_point(|&(native, _)| native <= offset);
        idx.checked_sub(1).map(|i| self.ip_map[i].1)
    }

    /// Absolute address of exception handler `index`, if it was compiled.
    pub fn handler_address(&self, index: usize) -> Option<u64> {
        self.handlers
            .get(index)
            .copied()
            .flatten()
            .map(|offset| self.start() + u64::from(offset))
    }

    #[inline]
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn pool_entry(&self, index: u32) -> Option<u64> {
        self.pool
            .get(index as usize)
            .map(|v| v.load(Ordering::Acquire))
    }

    /// Present every pool entry to `visit` as a root slot.
    pub fn visit_pool(&self, mut visit: impl FnMut(&mut u64)) {
        for entry in self.pool.iter() {
            let mut value = entry.load(Ordering::Acquire);
            visit(&mut value);
            entry.store(value, Ordering::Release);
        }
    }
}

impl fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCode")
            .field("method", &format_args!("{}", self.method))
            .field("start", &format_args!("{:#x}", self.start()))
            .field("len", &self.block.len())
            .field("root_maps", &self.root_maps.len())
            .finish()
    }
}
