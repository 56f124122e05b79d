//! BERT text encoder used by both retrieval towers and the span reader.
//!
//! Bidirectional attention with an additive padding mask, absolute position
//! embeddings, token type embeddings and post-LayerNorm residual blocks.
//! The pooled output is the first ([CLS]) position, optionally passed
//! through `encode_proj`.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::FlmrConfig;

/// Additive bias applied to attention scores of padded keys.
const MASKED_ATTENTION_BIAS: f64 = -10000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
    pub projection_dim: usize,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            projection_dim: 0,
        }
    }
}

impl From<&FlmrConfig> for BertConfig {
    fn from(cfg: &FlmrConfig) -> Self {
        Self {
            vocab_size: cfg.vocab_size,
            hidden_size: cfg.hidden_size,
            num_hidden_layers: cfg.num_hidden_layers,
            num_attention_heads: cfg.num_attention_heads,
            intermediate_size: cfg.intermediate_size,
            max_position_embeddings: cfg.max_position_embeddings,
            type_vocab_size: cfg.type_vocab_size,
            layer_norm_eps: cfg.layer_norm_eps,
            projection_dim: cfg.projection_dim,
        }
    }
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                cfg.type_vocab_size,
                hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: Option<&Tensor>) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;

        let word_emb = self.word_embeddings.forward(input_ids)?;

        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?
            .unsqueeze(0)?
            .expand((batch_size, seq_len))?;
        let pos_emb = self.position_embeddings.forward(&position_ids)?;

        let type_emb = match token_type_ids {
            Some(ids) => self.token_type_embeddings.forward(&ids.to_dtype(DType::U32)?)?,
            None => {
                let zeros = Tensor::zeros((batch_size, seq_len), DType::U32, input_ids.device())?;
                self.token_type_embeddings.forward(&zeros)?
            }
        };

        let embeddings = (word_emb + pos_emb)?.add(&type_emb)?;
        self.layer_norm.forward(&embeddings)
    }
}

// ─── Self-Attention ──────────────────────────────────────────────────────────

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl BertSelfAttention {
    fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            query: linear(hidden_size, hidden_size, vb.pp("query"))?,
            key: linear(hidden_size, hidden_size, vb.pp("key"))?,
            value: linear(hidden_size, hidden_size, vb.pp("value"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, x: &Tensor, batch_size: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `attention_bias` is `(batch, 1, 1, seq_len)`, 0 for real keys and a
    /// large negative value for padded keys.
    fn forward(&self, hidden_states: &Tensor, attention_bias: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self.split_heads(&self.query.forward(hidden_states)?, batch_size, seq_len)?;
        let k = self.split_heads(&self.key.forward(hidden_states)?, batch_size, seq_len)?;
        let v = self.split_heads(&self.value.forward(hidden_states)?, batch_size, seq_len)?;

        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let attn_weights = attn_weights.broadcast_add(attention_bias)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        attn_output
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))
    }
}

// ─── Residual dense + LayerNorm ──────────────────────────────────────────────

/// `LayerNorm(dense(x) + residual)`; used after attention and after the FFN.
struct BertResidualOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl BertResidualOutput {
    fn new(in_dim: usize, hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(in_dim, hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(hidden_size, eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, residual: &Tensor) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.layer_norm.forward(&(hidden_states + residual)?)
    }
}

// ─── Encoder Layer ──────────────────────────────────────────────────────────

struct BertLayer {
    self_attention: BertSelfAttention,
    attention_output: BertResidualOutput,
    intermediate: Linear,
    output: BertResidualOutput,
}

impl BertLayer {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let vb_attn = vb.pp("attention");
        Ok(Self {
            self_attention: BertSelfAttention::new(
                cfg.hidden_size,
                cfg.num_attention_heads,
                vb_attn.pp("self"),
            )?,
            attention_output: BertResidualOutput::new(
                cfg.hidden_size,
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb_attn.pp("output"),
            )?,
            intermediate: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: BertResidualOutput::new(
                cfg.intermediate_size,
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("output"),
            )?,
        })
    }

    fn forward(&self, hidden_states: &Tensor, attention_bias: &Tensor) -> Result<Tensor> {
        let attn = self.self_attention.forward(hidden_states, attention_bias)?;
        let attn = self.attention_output.forward(&attn, hidden_states)?;
        let ffn = self.intermediate.forward(&attn)?.gelu_erf()?;
        self.output.forward(&ffn, &attn)
    }
}

// ─── Full BERT Model ─────────────────────────────────────────────────────────

/// BERT encoder stack (`embeddings.*`, `encoder.layer.{i}.*`).
pub struct BertModel {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
}

impl BertModel {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = BertEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_layers = vb.pp("encoder").pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| BertLayer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }

    /// Last hidden states, `(batch, seq_len, hidden)`.
    ///
    /// `attention_mask` is `(batch, seq_len)` of 0/1 in any dtype.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut hidden_states = self.embeddings.forward(input_ids, token_type_ids)?;
        let attention_bias = attention_bias(attention_mask, hidden_states.dtype())?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &attention_bias)?;
        }
        Ok(hidden_states)
    }
}

/// `(batch, seq_len)` 0/1 mask to a `(batch, 1, 1, seq_len)` additive bias.
fn attention_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch_size, seq_len) = attention_mask.dims2()?;
    let mask = attention_mask.to_dtype(dtype)?;
    let bias = ((mask.ones_like()? - mask)? * MASKED_ATTENTION_BIAS)?;
    bias.reshape((batch_size, 1, 1, seq_len))
}

/// Text encoder output.
pub struct TextEncoderOutput {
    /// `(batch, seq_len, hidden)`
    pub last_hidden_state: Tensor,
    /// `(batch, hidden)` or `(batch, projection_dim)`
    pub pooled: Tensor,
}

/// BERT encoder wrapped with the FLMR/DPR weight layout
/// (`bert_model.*`, optional `encode_proj`).
pub struct TextEncoder {
    bert_model: BertModel,
    encode_proj: Option<Linear>,
    hidden_size: usize,
}

impl TextEncoder {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let bert_model = BertModel::new(cfg, vb.pp("bert_model"))?;
        let encode_proj = if cfg.projection_dim > 0 {
            Some(linear(cfg.hidden_size, cfg.projection_dim, vb.pp("encode_proj"))?)
        } else {
            None
        };
        Ok(Self {
            bert_model,
            encode_proj,
            hidden_size: cfg.hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        token_type_ids: Option<&Tensor>,
    ) -> Result<TextEncoderOutput> {
        let last_hidden_state = self
            .bert_model
            .forward(input_ids, attention_mask, token_type_ids)?;
        let cls = last_hidden_state.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = match &self.encode_proj {
            Some(proj) => proj.forward(&cls)?,
            None => cls,
        };
        Ok(TextEncoderOutput {
            last_hidden_state,
            pooled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_bert_config() -> BertConfig {
        BertConfig {
            vocab_size: 64,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 64,
            max_position_embeddings: 64,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            projection_dim: 0,
        }
    }

    fn random_encoder(cfg: &BertConfig) -> TextEncoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TextEncoder::new(cfg, vb).expect("build encoder")
    }

    #[test]
    fn test_text_encoder_shapes() {
        let cfg = tiny_bert_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let encoder = TextEncoder::new(&cfg, vb).expect("build encoder");

        let input_ids = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 5), DType::U32, &Device::Cpu).unwrap();
        let out = encoder.forward(&input_ids, &mask, None).expect("forward");
        assert_eq!(out.last_hidden_state.dims(), &[2, 5, 32]);
        assert_eq!(out.pooled.dims(), &[2, 32]);
    }

    #[test]
    fn test_encode_proj_changes_pooled_size() {
        let mut cfg = tiny_bert_config();
        cfg.projection_dim = 8;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let encoder = TextEncoder::new(&cfg, vb).expect("build encoder");

        let input_ids = Tensor::zeros((1, 3), DType::U32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 3), DType::U32, &Device::Cpu).unwrap();
        let out = encoder.forward(&input_ids, &mask, None).expect("forward");
        assert_eq!(out.last_hidden_state.dims(), &[1, 3, 32]);
        assert_eq!(out.pooled.dims(), &[1, 8]);
    }

    #[test]
    fn test_padding_does_not_change_real_tokens() {
        let cfg = tiny_bert_config();
        let encoder = random_encoder(&cfg);
        let device = Device::Cpu;

        let short = Tensor::new(&[[2u32, 7, 9]], &device).unwrap();
        let short_mask = Tensor::new(&[[1u32, 1, 1]], &device).unwrap();
        let padded = Tensor::new(&[[2u32, 7, 9, 0, 0]], &device).unwrap();
        let padded_mask = Tensor::new(&[[1u32, 1, 1, 0, 0]], &device).unwrap();

        let a = encoder
            .forward(&short, &short_mask, None)
            .unwrap()
            .last_hidden_state;
        let b = encoder
            .forward(&padded, &padded_mask, None)
            .unwrap()
            .last_hidden_state
            .narrow(1, 0, 3)
            .unwrap();
        let diff = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "padding leaked into real tokens: {diff}");
    }

    #[test]
    fn test_attention_is_bidirectional() {
        let cfg = tiny_bert_config();
        let encoder = random_encoder(&cfg);
        let device = Device::Cpu;
        let mask = Tensor::ones((1, 3), DType::U32, &device).unwrap();

        let a = Tensor::new(&[[2u32, 7, 9]], &device).unwrap();
        let b = Tensor::new(&[[2u32, 7, 11]], &device).unwrap();
        let first_a = encoder
            .forward(&a, &mask, None)
            .unwrap()
            .last_hidden_state
            .narrow(1, 0, 1)
            .unwrap();
        let first_b = encoder
            .forward(&b, &mask, None)
            .unwrap()
            .last_hidden_state
            .narrow(1, 0, 1)
            .unwrap();
        let diff = (first_a - first_b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0, "later token should affect the first position");
    }

    #[test]
    fn test_token_types_are_used() {
        let cfg = tiny_bert_config();
        let encoder = random_encoder(&cfg);
        let device = Device::Cpu;
        let ids = Tensor::new(&[[2u32, 7, 3, 9]], &device).unwrap();
        let mask = Tensor::ones((1, 4), DType::U32, &device).unwrap();
        let types = Tensor::new(&[[0u32, 0, 1, 1]], &device).unwrap();

        let plain = encoder.forward(&ids, &mask, None).unwrap().pooled;
        let typed = encoder.forward(&ids, &mask, Some(&types)).unwrap().pooled;
        let diff = (plain - typed)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_attention_bias_values() {
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();
        let bias = attention_bias(&mask, DType::F32).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 1, 3]);
        let vals = bias.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(vals, vec![0.0, 0.0, -10000.0]);
    }
}
