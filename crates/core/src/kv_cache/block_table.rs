use super::block_allocator::BlockId;

/// Per-sequence mapping: logical block index → physical BlockId.
///
/// Logical block `i` covers token positions `[i*block_size, (i+1)*block_size)`;
/// the last block may be partially filled.
#[derive(Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens_stored: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens_stored: 0,
            block_size,
        }
    }

    /// Total tokens whose KV is currently stored.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens_stored
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// How many new blocks are needed to store `new_tokens` additional tokens.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        if new_tokens == 0 {
            return 0;
        }
        let total_after = self.num_tokens_stored + new_tokens;
        let blocks_required = total_after.div_ceil(self.block_size);
        blocks_required.saturating_sub(self.blocks.len())
    }

    /// Append a newly allocated block ID.
    pub fn append_block(&mut self, block_id: BlockId) {
        self.blocks.push(block_id);
    }

    /// Advance fill by `n` tokens (after their KV has been written).
    pub fn advance(&mut self, n: usize) {
        self.num_tokens_stored += n;
        debug_assert!(self.num_tokens_stored <= self.blocks.len() * self.block_size);
    }

    /// Physical slot IDs for token positions `[start_pos, start_pos + n)`.
    pub fn slot_mapping(&self, start_pos: usize, n: usize) -> Vec<usize> {
        (start_pos..start_pos + n)
            .map(|pos| {
                let block_idx = pos / self.block_size;
                let offset = pos % self.block_size;
                self.blocks[block_idx] * self.block_size + offset
            })
            .collect()
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Swap the physical block at `logical_idx` (after a copy-on-write).
    pub fn replace_block(&mut self, logical_idx: usize, block_id: BlockId) {
        self.blocks[logical_idx] = block_id;
    }

    /// Release all blocks, returning their IDs for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.num_tokens_stored = 0;
        std::mem::take(&mut self.blocks)
    }
}
