//! Local checkpoint discovery and weight loading.
//!
//! A checkpoint directory holds `config.json`, one or more `*.safetensors`
//! shards (optionally listed by `model.safetensors.index.json`) and a
//! `tokenizer.json`, either at the top level or under
//! `query_tokenizer/` and `context_tokenizer/`.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::config::FlmrConfig;
use crate::error::{FlmrError, Result};
use crate::models::bert::BertConfig;
use crate::models::{FlmrModel, FlmrReader};
use crate::tokenizer::FlmrTokenizer;

/// Query sequences are truncated to this many ids by default.
pub const DEFAULT_QUERY_MAX_LENGTH: usize = 32;
/// Document sequences are truncated to this many ids by default.
pub const DEFAULT_DOC_MAX_LENGTH: usize = 512;

#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub dir: PathBuf,
    pub config_json: PathBuf,
    pub weights: Vec<PathBuf>,
    pub query_tokenizer: PathBuf,
    pub context_tokenizer: PathBuf,
}

impl ModelFiles {
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config_json = require(dir.join("config.json"))?;
        let weights = safetensor_paths(&dir)?;
        let shared = dir.join("tokenizer.json");
        let query_tokenizer = pick_tokenizer(&dir, "query_tokenizer", &shared)?;
        let context_tokenizer = pick_tokenizer(&dir, "context_tokenizer", &shared)?;
        Ok(Self {
            dir,
            config_json,
            weights,
            query_tokenizer,
            context_tokenizer,
        })
    }

    pub fn flmr_config(&self) -> Result<FlmrConfig> {
        FlmrConfig::from_json_str(&read_to_string(&self.config_json)?)
    }

    pub fn bert_config(&self) -> Result<BertConfig> {
        Ok(serde_json::from_str(&read_to_string(&self.config_json)?)?)
    }
}

/// Loaded retriever plus its two tokenizers.
pub struct LoadedRetriever {
    pub config: FlmrConfig,
    pub model: FlmrModel,
    pub query_tokenizer: FlmrTokenizer,
    pub context_tokenizer: FlmrTokenizer,
}

/// Creates a VarBuilder over memory-mapped safetensors shards.
pub fn load_weights(paths: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    if paths.is_empty() {
        return Err(FlmrError::input_contract("no safetensors files given"));
    }
    // SAFETY: the shards must not be modified while the mapping is alive.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

pub fn load_retriever(files: &ModelFiles, dtype: DType, device: &Device) -> Result<LoadedRetriever> {
    let config = files.flmr_config()?;
    let query_tokenizer = FlmrTokenizer::from_file(&files.query_tokenizer)?
        .with_max_length(DEFAULT_QUERY_MAX_LENGTH)?;
    let context_tokenizer = FlmrTokenizer::from_file(&files.context_tokenizer)?
        .with_max_length(DEFAULT_DOC_MAX_LENGTH.min(config.max_position_embeddings))?;
    let vb = load_weights(&files.weights, dtype, device)?;
    let model = FlmrModel::new(&config, &context_tokenizer, vb)?;
    tracing::info!(
        dir = %files.dir.display(),
        shards = files.weights.len(),
        ?dtype,
        "loaded FLMR retriever"
    );
    Ok(LoadedRetriever {
        config,
        model,
        query_tokenizer,
        context_tokenizer,
    })
}

pub fn load_reader(
    files: &ModelFiles,
    dtype: DType,
    device: &Device,
) -> Result<(FlmrReader, FlmrTokenizer)> {
    let cfg = files.bert_config()?;
    let tokenizer = FlmrTokenizer::from_file(&files.context_tokenizer)?
        .with_max_length(cfg.max_position_embeddings)?;
    let vb = load_weights(&files.weights, dtype, device)?;
    let reader = FlmrReader::new(&cfg, vb)?;
    tracing::info!(dir = %files.dir.display(), "loaded span reader");
    Ok((reader, tokenizer))
}

fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| FlmrError::ResourceLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn require(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(FlmrError::ResourceLoad {
            path,
            reason: "file not found".to_string(),
        })
    }
}

fn pick_tokenizer(dir: &Path, subdir: &str, shared: &Path) -> Result<PathBuf> {
    let specific = dir.join(subdir).join("tokenizer.json");
    if specific.is_file() {
        return Ok(specific);
    }
    require(shared.to_path_buf())
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<std::result::Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut rest = basename;
    while let Some(c) = rest.chars().next() {
        let digits = c.is_ascii_digit();
        let end = rest
            .find(|ch: char| ch.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (segment, tail) = rest.split_at(end);
        parts.push(if digits {
            Ok(segment.parse::<u64>().unwrap_or(u64::MAX))
        } else {
            Err(segment.to_string())
        });
        rest = tail;
    }
    parts
}

fn safetensor_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join("model.safetensors.index.json");
    let mut filenames: Vec<String> = if index_path.is_file() {
        let index: serde_json::Value = serde_json::from_str(&read_to_string(&index_path)?)?;
        let weight_map = index["weight_map"].as_object().ok_or_else(|| FlmrError::ResourceLoad {
            path: index_path.clone(),
            reason: "missing weight_map".to_string(),
        })?;
        weight_map
            .values()
            .filter_map(|v| v.as_str().map(String::from))
            .collect()
    } else {
        std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".safetensors"))
            .collect()
    };
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();

    if filenames.is_empty() {
        return Err(FlmrError::ResourceLoad {
            path: dir.to_path_buf(),
            reason: "no safetensors weights found".to_string(),
        });
    }
    filenames.into_iter().map(|f| require(dir.join(f))).collect()
}
