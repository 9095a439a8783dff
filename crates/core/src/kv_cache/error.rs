use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error("no block table for sequence {seq_id}")]
    UnknownSequence { seq_id: u64 },

    #[error("sequence {seq_id} already has a block table")]
    DuplicateSequence { seq_id: u64 },
}
