//! Per-token keep masks for late-interaction encoding.
//!
//! Document-side masks drop padding and punctuation; query-side masks drop
//! padding only (an empty [`Skiplist`]).

use std::collections::HashSet;

use candle_core::{DType, Result, Tensor};

use crate::tokenizer::FlmrTokenizer;

/// ASCII punctuation characters whose token ids are skipped on the document side.
pub const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Immutable set of token ids excluded from document-side keep masks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Skiplist {
    ids: HashSet<u32>,
}

impl Skiplist {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_token_ids(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Build from the first sub-token id of every punctuation character.
    pub fn from_tokenizer(tokenizer: &FlmrTokenizer) -> crate::Result<Self> {
        let mut ids = HashSet::new();
        let mut buf = [0u8; 4];
        for symbol in PUNCTUATION.chars() {
            if let Some(id) = tokenizer.first_token_id(symbol.encode_utf8(&mut buf))? {
                ids.insert(id);
            }
        }
        Ok(Self { ids })
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Keep mask for a `(batch, seq_len)` token-id tensor.
///
/// Returns a `U8` tensor of the same shape: 1 where the id is neither the
/// padding id nor in `skiplist`, 0 otherwise.
pub fn keep_mask(input_ids: &Tensor, skiplist: &Skiplist, pad_id: u32) -> Result<Tensor> {
    let (batch, seq_len) = input_ids.dims2()?;
    let rows = input_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let mut mask = Vec::with_capacity(batch * seq_len);
    for row in &rows {
        mask.extend(
            row.iter()
                .map(|&id| u8::from(id != pad_id && !skiplist.contains(id))),
        );
    }
    Tensor::from_vec(mask, (batch, seq_len), input_ids.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn ids(rows: &[&[u32]]) -> Tensor {
        let width = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn padding_is_dropped_with_empty_skiplist() {
        let input = ids(&[&[5, 6, 7, 0], &[8, 0, 0, 0]]);
        let mask = keep_mask(&input, &Skiplist::empty(), 0).unwrap();
        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1, 0], vec![1, 0, 0, 0]]
        );
    }

    #[test]
    fn skiplist_ids_are_dropped() {
        let input = ids(&[&[5, 9, 7, 9, 0]]);
        let skiplist = Skiplist::from_token_ids([9]);
        let mask = keep_mask(&input, &skiplist, 0).unwrap();
        assert_eq!(mask.to_vec2::<u8>().unwrap(), vec![vec![1, 0, 1, 0, 0]]);
    }

    #[test]
    fn skiplist_from_tokenizer_covers_punctuation() {
        let tokenizer = FlmrTokenizer::for_testing(128);
        let skiplist = Skiplist::from_tokenizer(&tokenizer).unwrap();
        assert_eq!(skiplist.len(), PUNCTUATION.chars().count());
        let comma = tokenizer.token_to_id(",").unwrap();
        assert!(skiplist.contains(comma));
        let word = tokenizer.token_to_id("t3").unwrap();
        assert!(!skiplist.contains(word));
    }

    #[test]
    fn query_and_document_masks_differ_on_punctuation() {
        let tokenizer = FlmrTokenizer::for_testing(128);
        let skiplist = Skiplist::from_tokenizer(&tokenizer).unwrap();
        let batch = tokenizer
            .tensorize(&[tokenizer.encode("t1 , t2", false).unwrap()], &Device::Cpu)
            .unwrap();
        let doc = keep_mask(&batch.input_ids, &skiplist, 0).unwrap();
        let query = keep_mask(&batch.input_ids, &Skiplist::empty(), 0).unwrap();
        assert_eq!(doc.to_vec2::<u8>().unwrap(), vec![vec![1, 0, 1]]);
        assert_eq!(query.to_vec2::<u8>().unwrap(), vec![vec![1, 1, 1]]);
    }
}
