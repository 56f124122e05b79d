pub mod config;
pub mod distributed;
pub mod error;
pub mod indexing;
pub mod loader;
pub mod masking;
pub mod models;
pub mod multimodal;
pub mod scoring;
pub mod tokenizer;
pub mod training;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{FlmrError, Result};
