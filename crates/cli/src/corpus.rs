//! JSON-lines passage files.
//!
//! One object per line: `{"id": "...", "title": "...", "text": "...", "image": "path"}`.
//! Only `text` is required. Blank lines are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use flmr_core::indexing::{DocumentCollection, DocumentImages};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Passage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub image: Option<PathBuf>,
}

pub fn read_passages(path: &Path) -> anyhow::Result<Vec<Passage>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut passages = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let passage: Passage = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", path.display(), line_no + 1))?;
        passages.push(passage);
    }
    if passages.is_empty() {
        bail!("{} contains no passages", path.display());
    }
    Ok(passages)
}

/// Passage ids, falling back to the line position.
pub fn passage_ids(passages: &[Passage]) -> Vec<String> {
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| p.id.clone().unwrap_or_else(|| i.to_string()))
        .collect()
}

/// Either every passage names an image or none does.
pub fn to_collection(passages: &[Passage]) -> anyhow::Result<DocumentCollection> {
    let docs = DocumentCollection::from_texts(passages.iter().map(|p| p.text.clone()));
    let images: Vec<PathBuf> = passages.iter().filter_map(|p| p.image.clone()).collect();
    if images.is_empty() {
        return Ok(docs);
    }
    if images.len() != passages.len() {
        bail!(
            "{} of {} passages have an image; expected all or none",
            images.len(),
            passages.len()
        );
    }
    Ok(docs.with_images(DocumentImages::Paths(images))?)
}
