//! Persistent settings for the `flmr` command line.
//!
//! Priority, highest first:
//! 1. Command line flags
//! 2. Config file (`<config_dir>/flmr/config.toml`)
//! 3. Built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_MAX_ANSWER_LEN: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Retriever checkpoint directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Span reader checkpoint directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_model: Option<PathBuf>,

    /// Documents per encoder batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Weight dtype (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Storage dtype for document embeddings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_dtype: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_answer_len: Option<usize>,

    /// Force CPU even when CUDA is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<bool>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("flmr").join("config.toml"))
    }

    /// Load the default file; a missing or unreadable file means defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Overwrite fields that `other` sets.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.reader_model.is_some() {
            self.reader_model = other.reader_model.clone();
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.doc_dtype.is_some() {
            self.doc_dtype = other.doc_dtype.clone();
        }
        if other.top_k.is_some() {
            self.top_k = other.top_k;
        }
        if other.max_answer_len.is_some() {
            self.max_answer_len = other.max_answer_len;
        }
        if other.cpu.is_some() {
            self.cpu = other.cpu;
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn top_k(&self) -> usize {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }

    pub fn max_answer_len(&self) -> usize {
        self.max_answer_len.unwrap_or(DEFAULT_MAX_ANSWER_LEN)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
