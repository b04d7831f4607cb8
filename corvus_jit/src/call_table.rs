//! Call-site table.
//!
//! Every call emitted by the compiler gets a [`CallNode`] keyed by its
//! return address. The node names the target method and holds the address
//! the call currently jumps to. That address starts at whatever the target's
//! entry was when the caller was installed (usually the compile thunk) and is
//! patched at most once, from the thunk to concrete code.

use crate::model::Method;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Call-site flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CallFlags(u8);

impl CallFlags {
    /// No flags.
    pub const NONE: CallFlags = CallFlags(0);
    /// Dispatched through the receiver's vtable.
    pub const VIRTUAL: CallFlags = CallFlags(1 << 0);
    /// The caller's frame is replaced.
    pub const TAIL_CALL: CallFlags = CallFlags(1 << 1);

    /// Check if a flag is set.
    #[inline]
    pub const fn contains(self, other: CallFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Combine flags.
    #[inline]
    pub const fn union(self, other: CallFlags) -> CallFlags {
        CallFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for CallFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// One call site.
#[derive(Debug)]
pub struct CallNode {
    address: u64,
    target: Arc<Method>,
    flags: CallFlags,
    resolved: AtomicU64,
}

impl CallNode {
    pub fn new(address: u64, target: Arc<Method>, flags: CallFlags, initial: u64) -> Self {
        Self {
            address,
            target,
            flags,
            resolved: AtomicU64::new(initial),
        }
    }

    /// Return address of the call.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn target(&self) -> &Arc<Method> {
        &self.target
    }

    #[inline]
    pub fn flags(&self) -> CallFlags {
        self.flags
    }

    /// Address the call currently jumps to.
    #[inline]
    pub fn resolved(&self) -> u64 {
        self.resolved.load(Ordering::Acquire)
    }

    /// Patch the site from the unresolved thunk `from` to `to`.
    ///
    /// Returns `false` if the site was already patched, in which case it
    /// keeps its current address.
    pub fn patch(&self, from: u64, to: u64) -> bool {
        debug_assert_ne!(from, to);
        self.resolved
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Concurrent map from return address to call node.
#[derive(Debug)]
pub struct CallSiteTable {
    nodes: DashMap<u64, Arc<CallNode>, FxBuildHasher>,
}

impl CallSiteTable {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::with_hasher(FxBuildHasher),
        }
    }

    pub fn insert(&self, node: CallNode) -> Arc<CallNode> {
        let node = Arc::new(node);
        let previous = self.nodes.insert(node.address(), node.clone());
        debug_assert!(previous.is_none(), "call site registered twice");
        node
    }

    /// Look up the call whose return address is `address`.
    #[inline]
    pub fn find(&self, address: u64) -> Option<Arc<CallNode>> {
        self.nodes.get(&address).map(|n| n.value().clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for CallSiteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassId, MethodId, MethodParts};
    use corvus_bytecode::{MethodDescriptor, MethodFlags};

    const THUNK: u64 = 0x100;

    fn target() -> Arc<Method> {
        Arc::new(Method::new(
            MethodParts {
                id: MethodId(1),
                class: ClassId(0),
                class_name: Arc::from("t/T"),
                name: Arc::from("callee"),
                descriptor: Arc::from("()V"),
                signature: MethodDescriptor::parse("()V").unwrap(),
                flags: MethodFlags::STATIC,
                code: None,
                vtable_index: None,
            },
            THUNK,
        ))
    }

    #[test]
    fn test_lookup_by_return_address() {
        let table = CallSiteTable::new();
        table.insert(CallNode::new(0x2005, target(), CallFlags::NONE, THUNK));
        table.insert(CallNode::new(0x2009, target(), CallFlags::VIRTUAL, THUNK));

        assert_eq!(table.find(0x2005).unwrap().address(), 0x2005);
        assert!(table.find(0x2009).unwrap().flags().contains(CallFlags::VIRTUAL));
        assert!(table.find(0x2006).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_patch_is_monotonic() {
        let node = CallNode::new(0x2005, target(), CallFlags::NONE, THUNK);
        assert!(node.patch(THUNK, 0x4000));
        assert_eq!(node.resolved(), 0x4000);
        // A second patch from the thunk must not take effect.
        assert!(!node.patch(THUNK, 0x5000));
        assert_eq!(node.resolved(), 0x4000);
    }

    #[test]
    fn test_racing_patches_agree() {
        let node = Arc::new(CallNode::new(0x2005, target(), CallFlags::NONE, THUNK));
        let winners: usize = (0..8u64)
            .map(|i| {
                let node = node.clone();
                std::thread::spawn(move || node.patch(THUNK, 0x4000 + i) as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
        assert_ne!(node.resolved(), THUNK);
    }
}
