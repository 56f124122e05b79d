//! On-disk document index.
//!
//! Embeddings go into a safetensors file; passage ids and the layout go into a
//! `<index>.json` sidecar.
//!
//! | layout  | tensors                                   |
//! |---------|-------------------------------------------|
//! | flatten | `embeddings (T, dim)`, `doclens (N,) u32`  |
//! | dense   | `embeddings (N, L, dim)`, `mask (N, L) u8` |
//! | ragged  | `doc.{i} (len_i, dim)`                     |

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use flmr_core::indexing::{IndexOutputMode, IndexedDocuments};
use flmr_core::scoring::{colbert_score, colbert_score_packed};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Flatten,
    Dense,
    Ragged,
}

impl From<IndexOutputMode> for Layout {
    fn from(mode: IndexOutputMode) -> Self {
        match mode {
            IndexOutputMode::Flatten => Layout::Flatten,
            IndexOutputMode::Dense => Layout::Dense,
            IndexOutputMode::Ragged => Layout::Ragged,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    layout: Layout,
    ids: Vec<String>,
}

pub struct StoredIndex {
    pub ids: Vec<String>,
    pub documents: IndexedDocuments,
}

fn manifest_path(index: &Path) -> PathBuf {
    let mut name = index.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

pub fn save(path: &Path, ids: &[String], documents: &IndexedDocuments) -> anyhow::Result<()> {
    let n = documents.num_documents()?;
    if ids.len() != n {
        bail!("{} ids for {n} documents", ids.len());
    }
    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    match documents {
        IndexedDocuments::Flattened {
            embeddings,
            doclens,
        } => {
            let lens: Vec<u32> = doclens.iter().map(|&l| l as u32).collect();
            tensors.insert("embeddings".into(), embeddings.clone());
            tensors.insert("doclens".into(), Tensor::from_vec(lens, n, &Device::Cpu)?);
        }
        IndexedDocuments::Dense { embeddings, mask } => {
            tensors.insert("embeddings".into(), embeddings.clone());
            tensors.insert("mask".into(), mask.to_dtype(DType::U8)?);
        }
        IndexedDocuments::Ragged(docs) => {
            for (i, doc) in docs.iter().enumerate() {
                tensors.insert(format!("doc.{i}"), doc.clone());
            }
        }
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("write {}", path.display()))?;
    let manifest = Manifest {
        layout: documents.mode().into(),
        ids: ids.to_vec(),
    };
    fs::write(manifest_path(path), serde_json::to_string(&manifest)?)?;
    tracing::info!(path = %path.display(), documents = n, layout = ?manifest.layout, "saved index");
    Ok(())
}

pub fn load(path: &Path, device: &Device) -> anyhow::Result<StoredIndex> {
    let manifest_file = manifest_path(path);
    let manifest: Manifest = serde_json::from_str(
        &fs::read_to_string(&manifest_file)
            .with_context(|| format!("read {}", manifest_file.display()))?,
    )?;
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("read {}", path.display()))?;
    let mut take = |name: &str| {
        tensors
            .remove(name)
            .with_context(|| format!("{} has no tensor `{name}`", path.display()))
    };
    let documents = match manifest.layout {
        Layout::Flatten => {
            let embeddings = take("embeddings")?;
            let doclens = take("doclens")?
                .to_vec1::<u32>()?
                .into_iter()
                .map(|l| l as usize)
                .collect();
            IndexedDocuments::Flattened {
                embeddings,
                doclens,
            }
        }
        Layout::Dense => IndexedDocuments::Dense {
            embeddings: take("embeddings")?,
            mask: take("mask")?,
        },
        Layout::Ragged => IndexedDocuments::Ragged(
            (0..manifest.ids.len())
                .map(|i| take(&format!("doc.{i}")))
                .collect::<anyhow::Result<_>>()?,
        ),
    };
    if documents.num_documents()? != manifest.ids.len() {
        bail!(
            "{} lists {} ids but the index holds {} documents",
            manifest_file.display(),
            manifest.ids.len(),
            documents.num_documents()?
        );
    }
    Ok(StoredIndex {
        ids: manifest.ids,
        documents,
    })
}

/// Score one query `(1, q_len, dim)` against every stored document.
pub fn score_query(query: &Tensor, documents: &IndexedDocuments) -> anyhow::Result<Vec<f32>> {
    let scores = match documents {
        IndexedDocuments::Flattened {
            embeddings,
            doclens,
        } => colbert_score_packed(query, embeddings, doclens)?,
        IndexedDocuments::Dense { embeddings, mask } => colbert_score(query, embeddings, mask)?,
        IndexedDocuments::Ragged(docs) => {
            let doclens: Vec<usize> = docs.iter().map(|d| d.dim(0)).collect::<Result<_, _>>()?;
            colbert_score_packed(query, &Tensor::cat(docs, 0)?, &doclens)?
        }
    };
    Ok(scores.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

/// Indices of the `k` highest scores, best first.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.truncate(k);
    order
}
