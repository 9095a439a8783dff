use super::error::CacheError;

pub type BlockId = usize;

/// Pool of fixed-size physical KV blocks with reference counting.
///
/// Refcounts are plain integers: every mutation happens on the engine
/// thread, so no atomics are needed. The free list is LIFO so recently
/// freed (warmest) blocks are handed out first.
pub struct BlockAllocator {
    num_blocks: usize,
    free_list: Vec<BlockId>,
    refcounts: Vec<usize>,
}

impl BlockAllocator {
    pub fn new(num_blocks: usize) -> Self {
        // push 0..num_blocks reversed so that pop gives low IDs first
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            free_list,
            refcounts: vec![0; num_blocks],
        }
    }

    /// Take a free block with refcount 1.
    pub fn allocate(&mut self) -> Result<BlockId, CacheError> {
        let id = self.free_list.pop().ok_or(CacheError::OutOfBlocks {
            requested: 1,
            available: 0,
        })?;
        self.refcounts[id] = 1;
        Ok(id)
    }

    /// Share `src` with one more holder. Returns `src` itself: the new
    /// holder references the same physical block.
    pub fn fork(&mut self, src: BlockId) -> Result<BlockId, CacheError> {
        self.check_live(src)?;
        self.refcounts[src] += 1;
        Ok(src)
    }

    /// Drop one reference; a block whose refcount reaches 0 returns to the
    /// free list.
    pub fn free(&mut self, block_id: BlockId) -> Result<(), CacheError> {
        self.check_live(block_id)?;
        self.refcounts[block_id] -= 1;
        if self.refcounts[block_id] == 0 {
            self.free_list.push(block_id);
        }
        Ok(())
    }

    /// Prepare `src` for an in-place write.
    ///
    /// A uniquely held block is returned as-is with `needs_copy = false`.
    /// A shared block is detached: a fresh block is allocated, `src` loses
    /// one reference, and the caller must schedule a physical copy
    /// `src → new` before writing.
    pub fn copy_on_write(&mut self, src: BlockId) -> Result<(BlockId, bool), CacheError> {
        self.check_live(src)?;
        if self.refcounts[src] == 1 {
            return Ok((src, false));
        }
        let dst = self.allocate()?;
        self.refcounts[src] -= 1;
        Ok((dst, true))
    }

    pub fn refcount(&self, block_id: BlockId) -> usize {
        self.refcounts.get(block_id).copied().unwrap_or(0)
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    fn check_live(&self, block_id: BlockId) -> Result<(), CacheError> {
        if block_id >= self.num_blocks || self.refcounts[block_id] == 0 {
            return Err(CacheError::BlockNotAllocated { block_id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_has_all_free() {
        let alloc = BlockAllocator::new(64);
        assert_eq!(alloc.num_free(), 64);
        assert_eq!(alloc.num_total(), 64);
    }

    #[test]
    fn allocate_sets_refcount_one() {
        let mut alloc = BlockAllocator::new(8);
        let id = alloc.allocate().unwrap();
        assert_eq!(alloc.refcount(id), 1);
        assert_eq!(alloc.num_free(), 7);
    }

    #[test]
    fn allocate_returns_unique_ids() {
        let mut alloc = BlockAllocator::new(16);
        let mut ids: Vec<_> = (0..16).map(|_| alloc.allocate().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn allocate_oom_returns_error() {
        let mut alloc = BlockAllocator::new(1);
        alloc.allocate().unwrap();
        match alloc.allocate() {
            Err(CacheError::OutOfBlocks { available, .. }) => assert_eq!(available, 0),
            other => panic!("expected OutOfBlocks, got {other:?}"),
        }
    }

    #[test]
    fn fork_increments_refcount_and_returns_same_id() {
        let mut alloc = BlockAllocator::new(4);
        let id = alloc.allocate().unwrap();
        let shared = alloc.fork(id).unwrap();
        assert_eq!(shared, id);
        assert_eq!(alloc.refcount(id), 2);
        // no physical block was consumed
        assert_eq!(alloc.num_free(), 3);
    }

    #[test]
    fn free_returns_block_only_at_zero() {
        let mut alloc = BlockAllocator::new(4);
        let id = alloc.allocate().unwrap();
        alloc.fork(id).unwrap();

        alloc.free(id).unwrap();
        assert_eq!(alloc.refcount(id), 1);
        assert_eq!(alloc.num_free(), 3);

        alloc.free(id).unwrap();
        assert_eq!(alloc.refcount(id), 0);
        assert_eq!(alloc.num_free(), 4);
    }

    #[test]
    fn free_unallocated_returns_error() {
        let mut alloc = BlockAllocator::new(4);
        assert!(matches!(
            alloc.free(2),
            Err(CacheError::BlockNotAllocated { block_id: 2 })
        ));
    }

    #[test]
    fn lifo_reuses_most_recently_freed() {
        let mut alloc = BlockAllocator::new(4);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        // b was freed last, so it comes back first
        assert_eq!(alloc.allocate().unwrap(), b);
        assert_eq!(alloc.allocate().unwrap(), a);
    }

    #[test]
    fn cow_unique_block_is_in_place() {
        let mut alloc = BlockAllocator::new(4);
        let id = alloc.allocate().unwrap();
        let (dst, needs_copy) = alloc.copy_on_write(id).unwrap();
        assert_eq!(dst, id);
        assert!(!needs_copy);
        assert_eq!(alloc.refcount(id), 1);
    }

    #[test]
    fn cow_shared_block_detaches() {
        let mut alloc = BlockAllocator::new(4);
        let id = alloc.allocate().unwrap();
        alloc.fork(id).unwrap();

        let (dst, needs_copy) = alloc.copy_on_write(id).unwrap();
        assert!(needs_copy);
        assert_ne!(dst, id);
        assert_eq!(alloc.refcount(id), 1);
        assert_eq!(alloc.refcount(dst), 1);
    }

    #[test]
    fn cow_oom_when_no_block_for_copy() {
        let mut alloc = BlockAllocator::new(1);
        let id = alloc.allocate().unwrap();
        alloc.fork(id).unwrap();
        assert!(alloc.copy_on_write(id).is_err());
    }
}
