use std::collections::HashMap;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{info_span, instrument, trace, Span};

use crate::{
    block::{BlockError, CacheBlock},
    config::{CacheConfig, SchedulerPolicy},
    sequence::Sequence,
};

/// Outcome of an admission capacity check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    /// The sequence can be admitted now
    Ok,
    /// Not enough free capacity now, but enough once other sequences release
    /// their blocks
    Later,
    /// The whole pool can never satisfy this sequence
    Never,
}

/// `BlockManager` - the fixed-capacity pool of paged KV cache blocks.
///
/// Allocation is all-or-nothing and never blocks. Blocks are interchangeable;
/// the free table keeps insertion order so that identical request arrival
/// orders reproduce identical block assignments across runs (and across
/// cooperating ranks).
#[derive(Debug)]
pub struct BlockManager {
    /// Block size, in token positions
    block_size: usize,
    /// Total number of blocks, fixed at construction
    num_blocks: usize,
    /// Free blocks, keyed by block id, in deterministic first-fit order
    free_table: IndexMap<u32, CacheBlock>,
    /// Blocks owned per sequence, keyed by request id, in logical order
    block_tables: HashMap<u64, Vec<CacheBlock>>,
    /// Outstanding worst-case reservations per sequence, in blocks. Only
    /// populated under `GuaranteedNoEvict`; drained as the sequence's actual
    /// allocation grows.
    reservations: HashMap<u64, usize>,
    /// Tracing span
    span: Span,
}

impl BlockManager {
    /// Constructor
    pub fn new(cache_config: &CacheConfig) -> Self {
        let block_size = cache_config.block_size();
        let num_blocks = cache_config.num_blocks();
        let free_table = (0..num_blocks as u32)
            .map(|block_id| (block_id, CacheBlock::new(block_id, block_size)))
            .collect();
        Self {
            block_size,
            num_blocks,
            free_table,
            block_tables: HashMap::new(),
            reservations: HashMap::new(),
            span: info_span!("block-manager"),
        }
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks in the pool
    pub fn num_total_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Number of currently free blocks
    pub fn num_free_blocks(&self) -> usize {
        self.free_table.len()
    }

    /// Number of blocks assigned to sequences
    pub fn num_allocated_blocks(&self) -> usize {
        self.num_blocks - self.free_table.len()
    }

    /// Sum of outstanding worst-case reservations
    pub fn num_reserved_blocks(&self) -> usize {
        self.reservations.values().sum()
    }

    /// Free blocks not spoken for by outstanding reservations; the headroom
    /// admission may use.
    pub fn num_available_blocks(&self) -> usize {
        self.free_table.len() - self.num_reserved_blocks()
    }

    /// Number of blocks needed to hold `num_tokens` token positions
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Capacity check for admitting `sequence` under `policy`.
    ///
    /// `MaxUtilization` checks only the immediate need (prompt plus any
    /// retained generated prefix); `GuaranteedNoEvict` checks the worst-case
    /// final size so the sequence can run to completion without eviction.
    pub fn can_admit(&self, sequence: &Sequence, policy: SchedulerPolicy) -> AllocationStatus {
        let required = match policy {
            SchedulerPolicy::MaxUtilization => self.blocks_needed(sequence.total_len()),
            SchedulerPolicy::GuaranteedNoEvict => {
                sequence.worst_case_num_blocks(self.block_size)
            }
        };
        if required > self.num_blocks {
            AllocationStatus::Never
        } else if required <= self.num_available_blocks() {
            AllocationStatus::Ok
        } else {
            AllocationStatus::Later
        }
    }

    /// Assigns blocks for `sequence`'s current length, all-or-nothing.
    ///
    /// Under `GuaranteedNoEvict` the remaining worst-case growth is recorded
    /// as a reservation, to be consumed by later `append_slot` calls.
    ///
    /// # Panics
    ///
    /// Allocating for a sequence that already owns blocks is a scheduler bug.
    #[instrument(skip_all, fields(request_id = sequence.request_id()))]
    pub fn allocate(
        &mut self,
        sequence: &Sequence,
        policy: SchedulerPolicy,
    ) -> Result<(), BlockManagerError> {
        let request_id = sequence.request_id();
        assert!(
            !self.block_tables.contains_key(&request_id),
            "request {request_id} already owns cache blocks"
        );

        let immediate = self.blocks_needed(sequence.total_len());
        if immediate > self.free_table.len() {
            return Err(BlockManagerError::NotEnoughFreeBlocks {
                needed: immediate,
                free: self.free_table.len(),
            });
        }

        let mut table = Vec::with_capacity(immediate);
        for _ in 0..immediate {
            // First-fit: the oldest entry of the ordered free table.
            let (_, mut block) = self
                .free_table
                .shift_remove_index(0)
                .expect("free table drained mid-allocation");
            block.increment_ref_count();
            table.push(block);
        }
        trace!(
            "allocated {immediate} blocks to request {request_id}, {} free",
            self.free_table.len()
        );
        self.block_tables.insert(request_id, table);

        if policy == SchedulerPolicy::GuaranteedNoEvict {
            let worst = sequence.worst_case_num_blocks(self.block_size);
            self.reservations
                .insert(request_id, worst.saturating_sub(immediate));
        }
        Ok(())
    }

    /// Grows a sequence's block list so it can hold `new_total_len` tokens.
    ///
    /// Returns `Ok(false)` when the pool is exhausted, which triggers
    /// eviction consideration in the scheduler. A plain decode step crosses
    /// at most one block boundary; a speculative multi-token step may cross
    /// several, so growth loops until the new length is covered.
    ///
    /// # Panics
    ///
    /// Extending a sequence that owns no blocks is a scheduler bug.
    #[instrument(skip(self))]
    pub fn append_slot(
        &mut self,
        request_id: u64,
        new_total_len: usize,
    ) -> Result<bool, BlockManagerError> {
        let needed = self.blocks_needed(new_total_len);
        let table = self
            .block_tables
            .get_mut(&request_id)
            .unwrap_or_else(|| panic!("request {request_id} owns no cache blocks"));

        while needed > table.len() {
            let Some((_, mut block)) = self.free_table.shift_remove_index(0) else {
                return Ok(false);
            };
            block.increment_ref_count();
            table.push(block);

            if let Some(reserved) = self.reservations.get_mut(&request_id) {
                *reserved = reserved.saturating_sub(1);
            }
        }
        Ok(true)
    }

    /// Returns all of a sequence's blocks to the free set and drops its
    /// outstanding reservation. The blocks are available for the next
    /// admission pass.
    ///
    /// # Panics
    ///
    /// Releasing a sequence that owns no blocks (including releasing twice)
    /// is a fatal contract violation, not a silent no-op.
    #[instrument(skip(self))]
    pub fn free(&mut self, request_id: u64) -> Result<(), BlockManagerError> {
        let table = self
            .block_tables
            .remove(&request_id)
            .unwrap_or_else(|| panic!("releasing cache blocks of request {request_id} twice"));
        for mut block in table {
            block.decrease_ref_count()?;
            self.free_table.insert(block.block_id(), block);
        }
        self.reservations.remove(&request_id);
        trace!("released request {request_id}, {} free", self.free_table.len());
        Ok(())
    }

    /// The physical block ids assigned to a sequence, in logical order
    pub fn block_table_ids(&self, request_id: u64) -> Option<Vec<u32>> {
        self.block_tables
            .get(&request_id)
            .map(|table| table.iter().map(|block| block.block_id()).collect())
    }
}

#[derive(Debug, Error)]
pub enum BlockManagerError {
    #[error("Not enough free blocks: needed `{needed}`, free `{free}`")]
    NotEnoughFreeBlocks { needed: usize, free: usize },
    #[error("Block error: `{0}`")]
    BlockError(#[from] BlockError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::tests::create_sequence;

    const BLOCK_SIZE: usize = 4;
    const NUM_BLOCKS: usize = 8;

    fn block_manager() -> BlockManager {
        let cache_config =
            CacheConfig::new(BLOCK_SIZE, NUM_BLOCKS).expect("Failed to generate `CacheConfig`");
        BlockManager::new(&cache_config)
    }

    #[test]
    fn test_allocate_and_free() {
        let mut manager = block_manager();
        let sequence = create_sequence(1, 10, 4, None);

        assert_eq!(
            manager.can_admit(&sequence, SchedulerPolicy::MaxUtilization),
            AllocationStatus::Ok
        );
        manager
            .allocate(&sequence, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");

        // 10 prompt tokens over 4-token blocks need 3 blocks.
        assert_eq!(manager.num_allocated_blocks(), 3);
        assert_eq!(manager.block_table_ids(1), Some(vec![0, 1, 2]));

        manager.free(1).expect("Failed to free");
        assert_eq!(manager.num_allocated_blocks(), 0);
        assert_eq!(manager.num_free_blocks(), NUM_BLOCKS);
    }

    #[test]
    fn test_admission_is_all_or_nothing() {
        let mut manager = block_manager();
        // 26 tokens -> 7 blocks.
        let first = create_sequence(1, 26, 4, None);
        manager
            .allocate(&first, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");
        assert_eq!(manager.num_free_blocks(), 1);

        // 6 tokens -> 2 blocks; only 1 free, so nothing is granted.
        let second = create_sequence(2, 6, 4, None);
        assert_eq!(
            manager.can_admit(&second, SchedulerPolicy::MaxUtilization),
            AllocationStatus::Later
        );
        assert!(manager
            .allocate(&second, SchedulerPolicy::MaxUtilization)
            .is_err());
        assert_eq!(manager.num_free_blocks(), 1);
        assert!(manager.block_table_ids(2).is_none());
    }

    #[test]
    fn test_never_admittable() {
        let manager = block_manager();
        // 40 tokens -> 10 blocks, more than the whole pool.
        let sequence = create_sequence(1, 40, 4, None);
        assert_eq!(
            manager.can_admit(&sequence, SchedulerPolicy::MaxUtilization),
            AllocationStatus::Never
        );
    }

    #[test]
    fn test_append_slot_grows_at_block_boundary() {
        let mut manager = block_manager();
        let sequence = create_sequence(1, 4, 8, None);
        manager
            .allocate(&sequence, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");
        assert_eq!(manager.num_allocated_blocks(), 1);

        // Token 5 crosses into a second block; 6..8 then fit inside it.
        assert!(manager.append_slot(1, 5).expect("Failed to append"));
        assert_eq!(manager.num_allocated_blocks(), 2);
        for new_len in 6..=8 {
            assert!(manager.append_slot(1, new_len).expect("Failed to append"));
            assert_eq!(manager.num_allocated_blocks(), 2);
        }
        assert!(manager.append_slot(1, 9).expect("Failed to append"));
        assert_eq!(manager.num_allocated_blocks(), 3);
    }

    #[test]
    fn test_append_slot_reports_exhaustion() {
        let cache_config = CacheConfig::new(4, 1).expect("Failed to generate `CacheConfig`");
        let mut manager = BlockManager::new(&cache_config);
        let sequence = create_sequence(1, 4, 8, None);
        manager
            .allocate(&sequence, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");

        assert!(!manager.append_slot(1, 5).expect("Failed to append"));
    }

    #[test]
    fn test_freed_blocks_are_reused_deterministically() {
        let mut manager = block_manager();
        let first = create_sequence(1, 8, 4, None);
        let second = create_sequence(2, 8, 4, None);
        manager
            .allocate(&first, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");
        manager
            .allocate(&second, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");
        assert_eq!(manager.block_table_ids(1), Some(vec![0, 1]));
        assert_eq!(manager.block_table_ids(2), Some(vec![2, 3]));

        manager.free(1).expect("Failed to free");

        // The next admission takes the oldest free entries: 4..7 remained,
        // then 0 and 1 were re-added.
        let third = create_sequence(3, 24, 4, None);
        manager
            .allocate(&third, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");
        assert_eq!(manager.block_table_ids(3), Some(vec![4, 5, 6, 7, 0, 1]));
    }

    #[test]
    fn test_no_evict_reservations() {
        let mut manager = block_manager();
        // Prompt 4 (1 block) + max 12 new tokens -> worst case 4 blocks.
        let first = create_sequence(1, 4, 12, None);
        manager
            .allocate(&first, SchedulerPolicy::GuaranteedNoEvict)
            .expect("Failed to allocate");
        assert_eq!(manager.num_allocated_blocks(), 1);
        assert_eq!(manager.num_reserved_blocks(), 3);
        assert_eq!(manager.num_available_blocks(), 4);

        // Growth consumes the reservation rather than shared headroom.
        assert!(manager.append_slot(1, 5).expect("Failed to append"));
        assert_eq!(manager.num_reserved_blocks(), 2);
        assert_eq!(manager.num_available_blocks(), 4);

        // A second worst-case-5-block sequence no longer fits the headroom.
        let second = create_sequence(2, 8, 12, None);
        assert_eq!(
            manager.can_admit(&second, SchedulerPolicy::GuaranteedNoEvict),
            AllocationStatus::Later
        );

        manager.free(1).expect("Failed to free");
        assert_eq!(manager.num_reserved_blocks(), 0);
        assert_eq!(
            manager.can_admit(&second, SchedulerPolicy::GuaranteedNoEvict),
            AllocationStatus::Ok
        );
    }

    #[test]
    fn test_pool_invariant_holds_across_churn() {
        let mut manager = block_manager();
        for round in 0..4u64 {
            for offset in 0..2 {
                let sequence = create_sequence(round * 2 + offset, 12, 4, None);
                manager
                    .allocate(&sequence, SchedulerPolicy::MaxUtilization)
                    .expect("Failed to allocate");
                assert!(manager.num_allocated_blocks() <= manager.num_total_blocks());
            }
            manager.free(round * 2).expect("Failed to free");
            manager.free(round * 2 + 1).expect("Failed to free");
        }
        assert_eq!(manager.num_free_blocks(), NUM_BLOCKS);
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn test_double_release_is_fatal() {
        let mut manager = block_manager();
        let sequence = create_sequence(1, 4, 4, None);
        manager
            .allocate(&sequence, SchedulerPolicy::MaxUtilization)
            .expect("Failed to allocate");
        manager.free(1).expect("Failed to free");
        let _ = manager.free(1);
    }
}
