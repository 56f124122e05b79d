//! Error types for FLMR encoding, scoring and indexing.

use std::path::PathBuf;

use thiserror::Error;

use crate::distributed::DistributedError;

/// Errors surfaced by the assembler, scorer, batch encoder and trainer.
///
/// Sub-networks (BERT, CLIP, mapping network, reader heads) return
/// `candle_core::Result`; those errors are wrapped in [`FlmrError::Candle`]
/// when they cross into this layer.
#[derive(Debug, Error)]
pub enum FlmrError {
    /// Mutually exclusive inputs were both supplied, or a requested
    /// modality's inputs are missing.
    #[error("input contract violation: {0}")]
    InputContract(String),

    /// Batch-size or sequence-length disagreement between tensors.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An image (or other per-document resource) could not be loaded.
    #[error("failed to load {path}: {reason}", path = path.display())]
    ResourceLoad { path: PathBuf, reason: String },

    /// Collective communication failed.
    #[error("distributed error: {0}")]
    Distributed(#[from] DistributedError),

    /// Tokenizer failed to load or encode.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlmrError {
    pub(crate) fn input_contract(msg: impl Into<String>) -> Self {
        Self::InputContract(msg.into())
    }

    pub(crate) fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FlmrError>;
