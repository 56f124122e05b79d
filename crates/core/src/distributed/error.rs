//! Error types for collective operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Ranks contributed tensors of different shapes to one collective.
    #[error("rank {rank} sent shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        rank: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A participant left the group or its slot was never filled.
    #[error("collective {op} failed: {reason}")]
    Collective { op: &'static str, reason: String },

    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
