use thiserror::Error;

/// A fixed-size slot of accelerator cache memory.
///
/// Each block holds the attention cache of one sequence for a fixed span of
/// `block_size` token positions. Blocks are indistinguishable and
/// interchangeable; a sequence's blocks are contiguous in logical order but
/// need not be contiguous in the physical pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheBlock {
    /// Unique identifier of this block within the pool
    block_id: u32,
    /// Number of token positions this block can hold
    block_size: usize,
    /// Number of sequences currently holding this block. With recomputation
    /// mode preemption only, this is always 0 (free) or 1 (owned).
    ref_count: usize,
}

impl CacheBlock {
    /// Constructor
    pub fn new(block_id: u32, block_size: usize) -> Self {
        Self {
            block_id,
            block_size,
            ref_count: 0,
        }
    }

    /// Getter for `block_id`
    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `ref_count`
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Checks if the block is unowned
    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    /// Increments the `ref_count` by one
    pub fn increment_ref_count(&mut self) {
        self.ref_count += 1;
    }

    /// Decreases the reference count by one.
    ///
    /// # Errors
    ///
    /// Returns `BlockError::ReferenceCountError` if the reference count is
    /// already zero.
    pub fn decrease_ref_count(&mut self) -> Result<(), BlockError> {
        if self.ref_count == 0 {
            return Err(BlockError::ReferenceCountError(self.block_id));
        }
        self.ref_count -= 1;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Reference count of block `{0}` is already zero")]
    ReferenceCountError(u32),
}
