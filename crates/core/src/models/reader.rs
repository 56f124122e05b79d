//! Extractive span reader.
//!
//! A BERT encoder over `[CLS] question [SEP] title [SEP] text [SEP]` with two
//! heads: `qa_outputs` (2 units per token: start / end logits) and
//! `qa_classifier` (1 unit on the first token: passage relevance).
//! Passages are not normalized against each other; ranking by relevance is
//! left to the caller.

use candle_core::{Device, Module, Result, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::bert::{BertConfig, BertModel};
use crate::tokenizer::{FlmrTokenizer, TokenizedBatch};

pub struct ReaderOutput {
    /// `(N, L)`
    pub start_logits: Tensor,
    /// `(N, L)`
    pub end_logits: Tensor,
    /// `(N,)`
    pub relevance_logits: Tensor,
}

/// Best answer span inside one passage, token indices inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanPrediction {
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

/// Tokenized reader batch for one question and N passages.
pub struct ReaderInputs {
    pub batch: TokenizedBatch,
    /// Index of the first passage-text token in each row.
    pub text_starts: Vec<usize>,
    /// Unpadded length of each row.
    pub lengths: Vec<usize>,
}

impl ReaderInputs {
    pub fn new<S: AsRef<str>>(
        tokenizer: &FlmrTokenizer,
        question: &str,
        titles: &[S],
        texts: &[S],
        device: &Device,
    ) -> crate::Result<Self> {
        if titles.len() != texts.len() {
            return Err(crate::FlmrError::ShapeMismatch(format!(
                "{} titles for {} texts",
                titles.len(),
                texts.len()
            )));
        }
        let sep = tokenizer.token_to_id("[SEP]");
        let mut rows = Vec::with_capacity(texts.len());
        let mut text_starts = Vec::with_capacity(texts.len());
        for (title, text) in titles.iter().zip(texts) {
            let passage = format!("{} [SEP] {}", title.as_ref(), text.as_ref());
            let ids = tokenizer.encode_pair(question, &passage)?;
            // Text follows the second [SEP].
            let start = sep
                .and_then(|sep| {
                    ids.iter()
                        .enumerate()
                        .filter(|(_, &id)| id == sep)
                        .nth(1)
                        .map(|(i, _)| i + 1)
                })
                .unwrap_or(0);
            text_starts.push(start);
            rows.push(ids);
        }
        let lengths = rows.iter().map(Vec::len).collect();
        Ok(Self {
            batch: tokenizer.tensorize(&rows, device)?,
            text_starts,
            lengths,
        })
    }
}

pub struct FlmrReader {
    encoder: BertModel,
    qa_outputs: Linear,
    qa_classifier: Linear,
}

impl FlmrReader {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("span_predictor");
        Ok(Self {
            encoder: BertModel::new(cfg, vb.pp("encoder").pp("bert_model"))?,
            qa_outputs: linear(cfg.hidden_size, 2, vb.pp("qa_outputs"))?,
            qa_classifier: linear(cfg.hidden_size, 1, vb.pp("qa_classifier"))?,
        })
    }

    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<ReaderOutput> {
        let (n_passages, seq_len) = input_ids.dims2()?;
        let sequence_output = self.encoder.forward(input_ids, attention_mask, None)?;

        let logits = self.qa_outputs.forward(&sequence_output)?;
        let start_logits = logits.narrow(D::Minus1, 0, 1)?.squeeze(D::Minus1)?;
        let end_logits = logits.narrow(D::Minus1, 1, 1)?.squeeze(D::Minus1)?;

        let cls = sequence_output.narrow(1, 0, 1)?.squeeze(1)?;
        let relevance_logits = self.qa_classifier.forward(&cls)?.reshape(n_passages)?;

        Ok(ReaderOutput {
            start_logits: start_logits.reshape((n_passages, seq_len))?,
            end_logits: end_logits.reshape((n_passages, seq_len))?,
            relevance_logits,
        })
    }
}

impl ReaderOutput {
    /// Highest `start + end` span per passage within its text region
    /// (`text_starts[i]..lengths[i] - 1`, excluding the final [SEP]) and at
    /// most `max_answer_len` tokens long.
    pub fn best_spans(
        &self,
        text_starts: &[usize],
        lengths: &[usize],
        max_answer_len: usize,
    ) -> Result<Vec<Option<SpanPrediction>>> {
        let start = self.start_logits.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        let end = self.end_logits.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        Ok(start
            .iter()
            .zip(&end)
            .zip(text_starts.iter().zip(lengths))
            .map(|((s, e), (&lo, &len))| best_span(s, e, lo, len.saturating_sub(1), max_answer_len))
            .collect())
    }
}

fn best_span(
    start: &[f32],
    end: &[f32],
    lo: usize,
    hi: usize,
    max_answer_len: usize,
) -> Option<SpanPrediction> {
    let hi = hi.min(start.len());
    let mut best: Option<SpanPrediction> = None;
    for i in lo..hi {
        for j in i..hi.min(i + max_answer_len) {
            let score = start[i] + end[j];
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(SpanPrediction {
                    start: i,
                    end: j,
                    score,
                });
            }
        }
    }
    best
}
