//! Address-ordered index of compiled methods.
//!
//! Maps any address inside a compiled block back to its [`CompiledCode`].
//! Used by the stack walker, the unwinder and the machine when control
//! transfers into a block it has not seen yet.

use crate::code::CompiledCode;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

/// Sorted map from code start address to compiled method.
#[derive(Debug, Default)]
pub struct MethodTree {
    blocks: RwLock<BTreeMap<u64, Arc<CompiledCode>>>,
}

impl MethodTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a compiled method. Blocks never overlap.
    pub fn insert(&self, code: Arc<CompiledCode>) {
        let mut blocks = self.blocks.write();
        debug_assert!(
            blocks
                .range(..code.end())
                .next_back()
                .is_none_or(|(_, prev)| prev.end() <= code.start()),
            "overlapping code blocks"
        );
        blocks.insert(code.start(), code);
    }

    /// Find the compiled method containing `address`.
    pub fn find(&self, address: u64) -> Option<Arc<CompiledCode>> {
        // Pairs with the release store that publishes a method's address.
        fence(Ordering::Acquire);
        let blocks = self.blocks.read();
        blocks
            .range(..=address)
            .next_back()
            .filter(|(_, code)| code.contains(address))
            .map(|(_, code)| code.clone())
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Snapshot of every compiled method.
    pub fn all(&self) -> Vec<Arc<CompiledCode>> {
        self.blocks.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Inst;
    use crate::code::{CodeBlock, CodeMetadata};
    use crate::frame::FrameLayout;
    use crate::model::{ClassId, Method, MethodId, MethodParts};
    use corvus_bytecode::{MethodDescriptor, MethodFlags};

    fn code_at(start: u64, len: usize) -> Arc<CompiledCode> {
        let method = Arc::new(Method::new(
            MethodParts {
                id: MethodId(start as u32),
                class: ClassId(0),
                class_name: Arc::from("t/T"),
                name: Arc::from("m"),
                descriptor: Arc::from("()V"),
                signature: MethodDescriptor::parse("()V").unwrap(),
                flags: MethodFlags::STATIC,
                code: None,
                vtable_index: None,
            },
            0,
        ));
        Arc::new(CompiledCode::new(
            method,
            Arc::new(CodeBlock::new(start, vec![Inst::Halt; len].into_boxed_slice())),
            FrameLayout::new(0, 0, 0, false),
            CodeMetadata::default(),
        ))
    }

    #[test]
    fn test_find_inside_and_between_blocks() {
        let tree = MethodTree::new();
        tree.insert(code_at(0x1000, 16));
        tree.insert(code_at(0x2000, 8));

        assert_eq!(tree.find(0x1000).unwrap().start(), 0x1000);
        assert_eq!(tree.find(0x100f).unwrap().start(), 0x1000);
        assert!(tree.find(0x1010).is_none());
        assert_eq!(tree.find(0x2007).unwrap().start(), 0x2000);
        assert!(tree.find(0x2008).is_none());
        assert!(tree.find(0x0fff).is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_concurrent_readers_see_inserts() {
        let tree = Arc::new(MethodTree::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    let start = 0x10_000 + t * 0x100;
                    tree.insert(code_at(start, 4));
                    assert!(tree.find(start + 3).is_some());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tree.all().len(), 4);
    }
}
