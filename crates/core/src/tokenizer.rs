use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::{Tokenizer, TruncationParams};

use crate::error::{FlmrError, Result};

/// Padded token-id and attention-mask tensors for one batch, both `U32`
/// with shape `(batch, max_len)`.
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
}

impl TokenizedBatch {
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }
}

/// Wrapper around a `tokenizers` BERT-style tokenizer.
pub struct FlmrTokenizer {
    inner: Tokenizer,
    pad_token_id: u32,
}

impl FlmrTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| FlmrError::Tokenizer(format!("load {}: {e}", path.display())))?;
        let pad_token_id = inner.token_to_id("[PAD]").unwrap_or(0);
        Ok(Self {
            inner,
            pad_token_id,
        })
    }

    /// Word-level tokenizer for tests.
    ///
    /// Ids: `[PAD]`=0, `[UNK]`=1, `[CLS]`=2, `[SEP]`=3, then one id per ASCII
    /// punctuation character, then words `t0`, `t1`, ... up to `vocab_size`.
    /// Single sequences are wrapped as `[CLS] $A [SEP]`, pairs as
    /// `[CLS] $A [SEP] $B [SEP]`.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;
        use tokenizers::processors::template::TemplateProcessing;
        use tokenizers::AddedToken;

        let mut vocab = ahash::AHashMap::new();
        for (id, special) in ["[PAD]", "[UNK]", "[CLS]", "[SEP]"].iter().enumerate() {
            vocab.insert(special.to_string(), id as u32);
        }
        for symbol in crate::masking::PUNCTUATION.chars() {
            let id = vocab.len() as u32;
            vocab.insert(symbol.to_string(), id);
        }
        let first_word = vocab.len();
        for i in 0..vocab_size.saturating_sub(first_word) {
            vocab.insert(format!("t{i}"), (first_word + i) as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".into())
            .build()
            .expect("build test tokenizer model");
        let template = TemplateProcessing::builder()
            .try_single("[CLS] $A [SEP]")
            .expect("single template")
            .try_pair("[CLS] $A [SEP] $B:1 [SEP]:1")
            .expect("pair template")
            .special_tokens(vec![("[CLS]", 2), ("[SEP]", 3)])
            .build()
            .expect("build template processor");

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer.with_post_processor(Some(template));
        tokenizer.add_special_tokens(&[
            AddedToken::from("[CLS]", true),
            AddedToken::from("[SEP]", true),
        ]);
        Self {
            inner: tokenizer,
            pad_token_id: 0,
        }
    }

    /// Truncate every encoding to at most `max_length` ids (special tokens
    /// included).
    pub fn with_max_length(mut self, max_length: usize) -> Result<Self> {
        self.inner
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| FlmrError::Tokenizer(format!("truncation: {e}")))?;
        Ok(self)
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| FlmrError::Tokenizer(format!("encode: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a sequence pair with special tokens, e.g. question and passage.
    pub fn encode_pair(&self, first: &str, second: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode((first, second), true)
            .map_err(|e| FlmrError::Tokenizer(format!("encode pair: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|text| self.encode(text.as_ref(), true))
            .collect()
    }

    /// First sub-token id of `text` without special tokens.
    pub fn first_token_id(&self, text: &str) -> Result<Option<u32>> {
        Ok(self.encode(text, false)?.first().copied())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| FlmrError::Tokenizer(format!("decode: {e}")))
    }

    /// Right-pad `sequences` to the longest one with the padding id.
    pub fn tensorize(&self, sequences: &[Vec<u32>], device: &Device) -> Result<TokenizedBatch> {
        pad_sequences(sequences, self.pad_token_id, device)
    }
}

pub fn pad_sequences(
    sequences: &[Vec<u32>],
    pad_id: u32,
    device: &Device,
) -> Result<TokenizedBatch> {
    let batch = sequences.len();
    let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(batch * max_len);
    let mut mask = Vec::with_capacity(batch * max_len);
    for seq in sequences {
        ids.extend_from_slice(seq);
        ids.extend(std::iter::repeat(pad_id).take(max_len - seq.len()));
        mask.extend(std::iter::repeat(1u32).take(seq.len()));
        mask.extend(std::iter::repeat(0u32).take(max_len - seq.len()));
    }
    Ok(TokenizedBatch {
        input_ids: Tensor::from_vec(ids, (batch, max_len), device)?,
        attention_mask: Tensor::from_vec(mask, (batch, max_len), device)?,
    })
}
