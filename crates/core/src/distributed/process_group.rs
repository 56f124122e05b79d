//! Process group abstractions.
//!
//! A process group is the set of data-parallel workers taking part in a
//! collective. Each worker owns one shard of the training batch.

/// Rank bookkeeping shared by every communicator.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this worker (0..world_size).
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Whether this is rank 0.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether collectives can short-circuit to identity.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Fixed rank/size process group.
///
/// `new()` is the single-worker group where every collective is identity;
/// `with_rank` fakes a position in a larger group for tests.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(
            rank < world_size,
            "rank {rank} outside a group of {world_size} workers"
        );
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}
