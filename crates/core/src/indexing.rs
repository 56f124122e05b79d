//! Corpus-scale document and query encoding.
//!
//! Documents are tokenized, sorted by token length so each batch pads as
//! little as possible, encoded batch by batch and put back into input order
//! with the inverse of the sort permutation. Any parallel image data is
//! reordered with the same permutation as the text.

use std::ops::Range;
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

use crate::config::ModalitySet;
use crate::error::{FlmrError, Result};
use crate::models::{ragged_rows, DocOutputMode, EncoderInputs, FlmrModel};
use crate::multimodal::ImageProcessor;
use crate::tokenizer::FlmrTokenizer;

// ─── Sorting and batching ────────────────────────────────────────────────────

/// Permutation that sorts items by length, and its inverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthSort {
    /// `order[i]` is the original index of the i-th shortest item.
    pub order: Vec<usize>,
    /// `reverse_indices[j]` is where original item `j` sits after sorting.
    pub reverse_indices: Vec<usize>,
}

impl LengthSort {
    /// Items in sorted order.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.order.iter().map(|&i| items[i].clone()).collect()
    }

    /// Sorted items back in original order.
    pub fn restore<T: Clone>(&self, sorted: &[T]) -> Vec<T> {
        self.reverse_indices.iter().map(|&i| sorted[i].clone()).collect()
    }

    /// Restore the original order along dim 0 of a tensor.
    pub fn restore_tensor(&self, sorted: &Tensor) -> Result<Tensor> {
        Ok(sorted.index_select(&index_tensor(&self.reverse_indices, sorted.device())?, 0)?)
    }
}

/// Stable ascending sort by length; equal lengths keep their input order.
pub fn sort_by_length(lengths: &[usize]) -> LengthSort {
    let mut order: Vec<usize> = (0..lengths.len()).collect();
    order.sort_by_key(|&i| lengths[i]);
    let mut reverse_indices = vec![0; order.len()];
    for (sorted_pos, &original) in order.iter().enumerate() {
        reverse_indices[original] = sorted_pos;
    }
    LengthSort {
        order,
        reverse_indices,
    }
}

/// Contiguous ranges of at most `batch_size` items covering `0..len`.
pub fn split_into_batches(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Zero-pad every tensor along dim 1 to the longest one and concatenate
/// along dim 0. Works for `(B, L)` masks and `(B, L, dim)` embeddings.
pub fn pad_and_concat(parts: &[Tensor]) -> Result<Tensor> {
    let max_len = parts
        .iter()
        .map(|t| t.dim(1))
        .collect::<candle_core::Result<Vec<_>>>()?
        .into_iter()
        .max()
        .ok_or_else(|| FlmrError::input_contract("nothing to concatenate"))?;
    let padded = parts
        .iter()
        .map(|t| {
            let len = t.dim(1)?;
            if len == max_len {
                Ok(t.clone())
            } else {
                t.pad_with_zeros(1, 0, max_len - len)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&padded, 0)?)
}

fn index_tensor(indices: &[usize], device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Ok(Tensor::from_vec(idx, indices.len(), device)?)
}

// ─── Collections ─────────────────────────────────────────────────────────────

/// Images aligned one-to-one with a collection's texts.
#[derive(Debug, Clone)]
pub enum DocumentImages {
    /// `(N, vision_encoder_dim)` precomputed pooled features.
    Features(Tensor),
    /// Image files, loaded per batch.
    Paths(Vec<PathBuf>),
}

impl DocumentImages {
    fn len(&self) -> Result<usize> {
        Ok(match self {
            DocumentImages::Features(t) => t.dim(0)?,
            DocumentImages::Paths(p) => p.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DocumentCollection {
    texts: Vec<String>,
    images: Option<DocumentImages>,
}

impl DocumentCollection {
    pub fn from_texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self {
            texts: texts.into_iter().map(Into::into).collect(),
            images: None,
        }
    }

    /// Attach images; their count must match the number of texts.
    pub fn with_images(mut self, images: DocumentImages) -> Result<Self> {
        let n = images.len()?;
        if n != self.texts.len() {
            return Err(FlmrError::shape_mismatch(format!(
                "{n} images for {} texts",
                self.texts.len()
            )));
        }
        self.images = Some(images);
        Ok(self)
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn images(&self) -> Option<&DocumentImages> {
        self.images.as_ref()
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

/// How an encoded collection is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutputMode {
    /// One `(N, L_max, dim)` tensor and its `(N, L_max)` mask.
    Dense,
    /// Valid token rows of every document back to back, plus per-document
    /// counts.
    Flatten,
    /// One `(valid_len, dim)` tensor per document.
    Ragged,
}

#[derive(Debug)]
pub enum IndexedDocuments {
    Dense {
        embeddings: Tensor,
        mask: Tensor,
    },
    Flattened {
        /// `(sum(doclens), dim)`
        embeddings: Tensor,
        doclens: Vec<usize>,
    },
    Ragged(Vec<Tensor>),
}

impl IndexedDocuments {
    pub fn mode(&self) -> IndexOutputMode {
        match self {
            IndexedDocuments::Dense { .. } => IndexOutputMode::Dense,
            IndexedDocuments::Flattened { .. } => IndexOutputMode::Flatten,
            IndexedDocuments::Ragged(_) => IndexOutputMode::Ragged,
        }
    }

    pub fn num_documents(&self) -> Result<usize> {
        Ok(match self {
            IndexedDocuments::Dense { embeddings, .. } => embeddings.dim(0)?,
            IndexedDocuments::Flattened { doclens, .. } => doclens.len(),
            IndexedDocuments::Ragged(docs) => docs.len(),
        })
    }

    /// Valid token rows of each document, whatever the layout.
    pub fn per_document(&self) -> Result<Vec<Tensor>> {
        match self {
            IndexedDocuments::Dense { embeddings, mask } => ragged_rows(embeddings, mask),
            IndexedDocuments::Flattened {
                embeddings,
                doclens,
            } => {
                let mut offset = 0;
                doclens
                    .iter()
                    .map(|&len| {
                        let doc = embeddings.narrow(0, offset, len)?;
                        offset += len;
                        Ok(doc)
                    })
                    .collect()
            }
            IndexedDocuments::Ragged(docs) => Ok(docs.clone()),
        }
    }
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

/// Drives an [`FlmrModel`] over whole collections.
pub struct BatchEncoder<'a> {
    model: &'a FlmrModel,
    query_tokenizer: &'a FlmrTokenizer,
    context_tokenizer: &'a FlmrTokenizer,
    images: Option<ImageProcessor>,
    batch_size: usize,
}

impl<'a> BatchEncoder<'a> {
    pub fn new(
        model: &'a FlmrModel,
        query_tokenizer: &'a FlmrTokenizer,
        context_tokenizer: &'a FlmrTokenizer,
        batch_size: usize,
    ) -> Self {
        let images = model.vision_config().map(|cfg| {
            ImageProcessor::from_vision_config(cfg, model.device()).with_dtype(model.dtype())
        });
        Self {
            model,
            query_tokenizer,
            context_tokenizer,
            images,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Encode a collection with the model's context modalities.
    ///
    /// A failing batch (e.g. an unreadable image) fails the whole call.
    /// Images are ignored when the context side is text-only.
    pub fn encode_documents(
        &self,
        docs: &DocumentCollection,
        mode: IndexOutputMode,
    ) -> Result<IndexedDocuments> {
        Ok(self.encode_documents_with_tokens(docs, mode)?.0)
    }

    /// Like [`encode_documents`](Self::encode_documents), also returning each
    /// document's context token ids in input order.
    pub fn encode_documents_with_tokens(
        &self,
        docs: &DocumentCollection,
        mode: IndexOutputMode,
    ) -> Result<(IndexedDocuments, Vec<Vec<u32>>)> {
        if docs.is_empty() {
            return Err(FlmrError::input_contract("document collection is empty"));
        }
        let device = self.model.device();
        let ids = self.context_tokenizer.encode_batch(docs.texts())?;
        let lengths: Vec<usize> = ids.iter().map(Vec::len).collect();
        let sort = sort_by_length(&lengths);
        let uses_vision = self.model.modalities().context.uses_vision();
        let batches = split_into_batches(docs.len(), self.batch_size);
        info!(
            num_docs = docs.len(),
            batch_size = self.batch_size,
            num_batches = batches.len(),
            ?mode,
            "encoding documents"
        );

        let doc_mode = match mode {
            IndexOutputMode::Ragged => DocOutputMode::Ragged,
            IndexOutputMode::Dense | IndexOutputMode::Flatten => DocOutputMode::WithMask,
        };

        let mut padded: Vec<(Tensor, Tensor)> = Vec::new();
        let mut ragged: Vec<Tensor> = Vec::new();
        for (batch_idx, range) in batches.into_iter().enumerate() {
            let members = &sort.order[range];
            let batch_ids: Vec<Vec<u32>> = members.iter().map(|&i| ids[i].clone()).collect();
            let text = self.context_tokenizer.tensorize(&batch_ids, device)?;
            let pixels;
            let features;
            let mut inputs = EncoderInputs::text(&text.input_ids, &text.attention_mask);
            match docs.images().filter(|_| uses_vision) {
                Some(DocumentImages::Features(all)) => {
                    features = all.index_select(&index_tensor(members, all.device())?, 0)?;
                    inputs = inputs.with_features(&features);
                }
                Some(DocumentImages::Paths(all)) => {
                    let processor = self.images.as_ref().ok_or_else(|| {
                        FlmrError::input_contract(
                            "image paths given but the model has no vision encoder",
                        )
                    })?;
                    let paths: Vec<&PathBuf> = members.iter().map(|&i| &all[i]).collect();
                    pixels = processor.load_batch(&paths)?;
                    inputs = inputs.with_pixels(&pixels);
                }
                None => {}
            }

            let encoded = self.model.doc(&inputs, doc_mode)?;
            debug!(
                batch = batch_idx,
                docs = members.len(),
                seq_len = text.seq_len(),
                "encoded document batch"
            );
            match doc_mode {
                DocOutputMode::Ragged => ragged.extend(encoded.into_ragged()?),
                _ => padded.push(encoded.into_padded()?),
            }
        }

        let out = match mode {
            IndexOutputMode::Ragged => IndexedDocuments::Ragged(sort.restore(&ragged)),
            IndexOutputMode::Dense => {
                let (embeddings, mask) = concat_restored(&sort, &padded)?;
                IndexedDocuments::Dense { embeddings, mask }
            }
            IndexOutputMode::Flatten => {
                let (embeddings, mask) = concat_restored(&sort, &padded)?;
                flatten(&embeddings, &mask)?
            }
        };
        info!(num_docs = docs.len(), "finished encoding documents");
        Ok((out, ids))
    }

    /// Encode text queries in chunks of `batch_size`; chunk outputs are
    /// zero-padded to a common length. Returns `(embeddings, mask)`.
    pub fn query_from_text<S: AsRef<str>>(&self, queries: &[S]) -> Result<(Tensor, Tensor)> {
        if queries.is_empty() {
            return Err(FlmrError::input_contract("no queries to encode"));
        }
        let device = self.model.device();
        let ids = self.query_tokenizer.encode_batch(queries)?;
        let mut embeddings = Vec::new();
        let mut masks = Vec::new();
        for range in split_into_batches(ids.len(), self.batch_size) {
            let text = self.query_tokenizer.tensorize(&ids[range], device)?;
            let q = self.model.query_with(
                &EncoderInputs::text(&text.input_ids, &text.attention_mask),
                Some(ModalitySet::TextOnly),
            )?;
            embeddings.push(q.embeddings);
            masks.push(q.mask);
        }
        debug!(num_queries = queries.len(), "encoded queries");
        Ok((pad_and_concat(&embeddings)?, pad_and_concat(&masks)?))
    }
}

fn concat_restored(sort: &LengthSort, parts: &[(Tensor, Tensor)]) -> Result<(Tensor, Tensor)> {
    let embeddings: Vec<Tensor> = parts.iter().map(|(e, _)| e.clone()).collect();
    let masks: Vec<Tensor> = parts.iter().map(|(_, m)| m.clone()).collect();
    let embeddings = sort.restore_tensor(&pad_and_concat(&embeddings)?)?;
    let mask = sort.restore_tensor(&pad_and_concat(&masks)?)?;
    Ok((embeddings, mask))
}

/// Keep the mask-true rows of `(N, L, dim)` in document order.
fn flatten(embeddings: &Tensor, mask: &Tensor) -> Result<IndexedDocuments> {
    let (n, len, dim) = embeddings.dims3()?;
    let mask = mask.to_dtype(DType::U8)?;
    let doclens: Vec<usize> = mask
        .to_vec2::<u8>()?
        .iter()
        .map(|row| row.iter().filter(|&&m| m != 0).count())
        .collect();
    let keep: Vec<usize> = mask
        .flatten_all()?
        .to_vec1::<u8>()?
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0)
        .map(|(i, _)| i)
        .collect();
    let rows = embeddings.reshape((n * len, dim))?;
    let embeddings = if keep.is_empty() {
        Tensor::zeros((0, dim), rows.dtype(), rows.device())?
    } else {
        rows.index_select(&index_tensor(&keep, rows.device())?, 0)?
    };
    Ok(IndexedDocuments::Flattened {
        embeddings,
        doclens,
    })
}
