mod block_allocator;
mod block_table;
mod error;

pub use block_allocator::{BlockAllocator, BlockId};
pub use block_table::BlockTable;
pub use error::CacheError;

use std::collections::HashMap;

use crate::SeqId;

/// Coordinator for paged KV bookkeeping: the physical block pool plus one
/// block table per live sequence. Pure bookkeeping, no tensor awareness;
/// the model runner consumes the tables and copy lists it produces.
pub struct BlockManager {
    allocator: BlockAllocator,
    tables: HashMap<SeqId, BlockTable>,
    block_size: usize,
}

impl BlockManager {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self {
            allocator: BlockAllocator::new(num_blocks),
            tables: HashMap::new(),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.allocator.num_free()
    }

    pub fn num_total_blocks(&self) -> usize {
        self.allocator.num_total()
    }

    pub fn refcount(&self, block_id: BlockId) -> usize {
        self.allocator.refcount(block_id)
    }

    /// Create an empty block table for a new sequence.
    pub fn register_sequence(&mut self, seq_id: SeqId) -> Result<(), CacheError> {
        if self.tables.contains_key(&seq_id) {
            return Err(CacheError::DuplicateSequence { seq_id });
        }
        self.tables.insert(seq_id, BlockTable::new(self.block_size));
        Ok(())
    }

    pub fn table(&self, seq_id: SeqId) -> Result<&BlockTable, CacheError> {
        self.tables
            .get(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })
    }

    /// New blocks required before `new_tokens` more tokens can be stored.
    pub fn blocks_needed(&self, seq_id: SeqId, new_tokens: usize) -> Result<usize, CacheError> {
        Ok(self.table(seq_id)?.blocks_needed(new_tokens))
    }

    /// Grow a sequence's table so `new_tokens` more tokens fit.
    ///
    /// All-or-nothing: on `OutOfBlocks` the table is left unchanged, which
    /// is the signal the scheduler turns into preemption.
    pub fn allocate_slots(&mut self, seq_id: SeqId, new_tokens: usize) -> Result<(), CacheError> {
        let needed = self.blocks_needed(seq_id, new_tokens)?;
        if needed > self.allocator.num_free() {
            return Err(CacheError::OutOfBlocks {
                requested: needed,
                available: self.allocator.num_free(),
            });
        }
        for _ in 0..needed {
            let id = self.allocator.allocate()?;
            self.tables
                .get_mut(&seq_id)
                .expect("checked above")
                .append_block(id);
        }
        Ok(())
    }

    /// Advance a sequence's stored-token count after a forward pass wrote
    /// KV for `n` positions.
    pub fn advance(&mut self, seq_id: SeqId, n: usize) -> Result<(), CacheError> {
        self.tables
            .get_mut(&seq_id)
            .ok_or(CacheError::UnknownSequence { seq_id })?
            .advance(n);
        Ok(())
    }

    /// Give `child` a table sharing every physical block of `parent`.
    pub fn fork_sequence(&mut self, parent: SeqId, child: SeqId) -> Result<(), CacheError> {
        if self.tables.contains_key(&child) {
            return Err(CacheError::DuplicateSequence { seq_id: child });
        }
        let parent_table = self
            .tables
            .get(&parent)
            .ok_or(CacheError::UnknownSequence { seq_id: parent })?
            .clone();
        for &block_id in parent_table.block_ids() {
            self.allocator.fork(block_id)?;
        }
        self.tables.insert(child, parent_table);
        Ok(())
    }

    /// Drop a sequence's table, decrementing every block it referenced.
    /// A sequence without a table (already freed) is a no-op.
    pub fn free_sequence(&mut self, seq_id: SeqId) -> Result<(), CacheError> {
        if let Some(mut table) = self.tables.remove(&seq_id) {
            for block_id in table.release() {
                self.allocator.free(block_id)?;
            }
        }
        Ok(())
    }

    /// Detach any shared blocks overlapping written positions
    /// `[start_pos, start_pos + n)`, returning the physical copies the
    /// model runner must perform before the pass.
    pub fn copy_on_write_range(
        &mut self,
        seq_id: SeqId,
        start_pos: usize,
        n: usize,
    ) -> Result<Vec<(BlockId, BlockId)>, CacheError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let first_block = start_pos / self.block_size;
        let last_block = (start_pos + n - 1) / self.block_size;
        let mut copy_ops = Vec::new();
        for logical_idx in first_block..=last_block {
            let src = self
                .tables
                .get(&seq_id)
                .ok_or(CacheError::UnknownSequence { seq_id })?
                .block_ids()[logical_idx];
            let (dst, needs_copy) = self.allocator.copy_on_write(src)?;
            if needs_copy {
                self.tables
                    .get_mut(&seq_id)
                    .expect("checked above")
                    .replace_block(logical_idx, dst);
                copy_ops.push((src, dst));
            }
        }
        Ok(copy_ops)
    }

    /// Every block's refcount must equal the number of live tables that
    /// reference it. Cheap to verify, and any mismatch is a scheduler or
    /// sampler bug.
    pub fn check_ref_integrity(&self) -> bool {
        let mut counts: HashMap<BlockId, usize> = HashMap::new();
        for table in self.tables.values() {
            for &id in table.block_ids() {
                *counts.entry(id).or_default() += 1;
            }
        }
        for id in 0..self.allocator.num_total() {
            if self.allocator.refcount(id) != counts.get(&id).copied().unwrap_or(0) {
                return false;
            }
        }
        true
    }
}
