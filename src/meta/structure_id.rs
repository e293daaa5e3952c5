use std::sync::atomic::{AtomicU32, Ordering};

use crate::tree::StructureId;

pub const NO_STRUCTURE_ID: StructureId = 0;
pub const META_TREE_ID: StructureId = 1;

/// Hands out structure ids for new stores.
///
/// Ids divisible by 256 are never returned: their big-endian key encoding
/// would end in a zero byte, which marks store name keys in the meta tree.
#[derive(Debug)]
pub struct StructureIdAllocator {
    last: AtomicU32,
}

impl StructureIdAllocator {
    pub fn new(last: StructureId) -> Self {
        Self {
            last: AtomicU32::new(last.max(META_TREE_ID)),
        }
    }

    pub fn allocate(&self) -> StructureId {
        loop {
            let id = self.last.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
            if id & 0xff != 0 {
                return id;
            }
        }
    }

    pub fn last(&self) -> StructureId {
        self.last.load(Ordering::SeqCst)
    }

    /// Never moves backwards.
    pub fn advance_to(&self, id: StructureId) {
        self.last.fetch_max(id, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_after_meta_tree() {
        let allocator = StructureIdAllocator::new(NO_STRUCTURE_ID);
        assert_eq!(allocator.allocate(), 2);
        assert_eq!(allocator.last(), 2);
    }

    #[test]
    fn test_multiples_of_256_are_skipped() {
        let allocator = StructureIdAllocator::new(250);
        let ids: Vec<StructureId> = (0..10).map(|_| allocator.allocate()).collect();
        assert_eq!(ids, vec![251, 252, 253, 254, 255, 257, 258, 259, 260, 261]);

        let allocator = StructureIdAllocator::new(0x1ff);
        assert_eq!(allocator.allocate(), 0x201);
    }

    #[test]
    fn test_advance_to_is_monotonic() {
        let allocator = StructureIdAllocator::new(10);
        allocator.advance_to(5);
        assert_eq!(allocator.last(), 10);
        allocator.advance_to(40);
        assert_eq!(allocator.allocate(), 41);
    }
}
