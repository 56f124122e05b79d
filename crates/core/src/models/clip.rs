//! CLIP vision tower (`CLIPVisionModel`).
//!
//! class_embedding + patch_embedding (no bias) + position_embedding →
//! pre_layrnorm (typo preserved) → pre-norm encoder. The late-interaction
//! model reads the CLS position of `last_hidden_state`, which is taken
//! before `post_layernorm`.
//!
//! Weight paths (relative to the tower prefix):
//! - `vision_model.embeddings.{class_embedding,patch_embedding,position_embedding}.*`
//! - `vision_model.pre_layrnorm.{weight,bias}`
//! - `vision_model.encoder.layers.{i}.{layer_norm1,layer_norm2,self_attn,mlp}.*`
//! - `vision_model.post_layernorm.{weight,bias}`

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{
    conv2d_no_bias, embedding, layer_norm, linear, ops::softmax_last_dim, Conv2dConfig, Embedding,
    LayerNorm, Linear, VarBuilder,
};

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ClipVisionConfig {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub num_channels: usize,
    pub layer_norm_eps: f64,
    pub quick_gelu: bool,
}

impl ClipVisionConfig {
    /// Read a HF `vision_config` object; missing keys take ViT-B/32 values.
    pub fn from_json(v: &serde_json::Value) -> Self {
        let g = |key, default: usize| {
            v.get(key)
                .and_then(|x| x.as_u64())
                .unwrap_or(default as u64) as usize
        };
        let eps = v
            .get("layer_norm_eps")
            .and_then(|x| x.as_f64())
            .unwrap_or(1e-5);
        let quick_gelu = v
            .get("hidden_act")
            .and_then(|x| x.as_str())
            .map_or(true, |act| act == "quick_gelu");
        Self {
            hidden_size: g("hidden_size", 768),
            num_attention_heads: g("num_attention_heads", 12),
            num_hidden_layers: g("num_hidden_layers", 12),
            intermediate_size: g("intermediate_size", 3072),
            image_size: g("image_size", 224),
            patch_size: g("patch_size", 32),
            num_channels: g("num_channels", 3),
            layer_norm_eps: eps,
            quick_gelu,
        }
    }

    pub fn num_positions(&self) -> usize {
        let side = self.image_size / self.patch_size;
        side * side + 1
    }
}

// ─── Encoder building blocks ─────────────────────────────────────────────────

struct ClipAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    fn new(hidden_size: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = hidden_size / num_heads;
        Ok(Self {
            q_proj: linear(hidden_size, hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, hidden_size, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, hidden_size, vb.pp("v_proj"))?,
            out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn heads(&self, proj: &Linear, x: &Tensor, b: usize, s: usize) -> Result<Tensor> {
        proj.forward(x)?
            .reshape((b, s, self.num_heads, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()
    }

    /// `x`: `[B, S, D]` → `[B, S, D]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        let q = self.heads(&self.q_proj, x, b, s)?;
        let k = self.heads(&self.k_proj, x, b, s)?;
        let v = self.heads(&self.v_proj, x, b, s)?;

        let attn = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let attn = softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

struct ClipMlp {
    fc1: Linear,
    fc2: Linear,
    quick_gelu: bool,
}

impl ClipMlp {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
            quick_gelu: cfg.quick_gelu,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?;
        let h = if self.quick_gelu {
            // x * sigmoid(1.702 * x)
            (&h * candle_nn::ops::sigmoid(&(&h * 1.702)?)?)?
        } else {
            h.gelu_erf()?
        };
        self.fc2.forward(&h)
    }
}

struct ClipEncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: ClipAttention,
    layer_norm2: LayerNorm,
    mlp: ClipMlp,
}

impl ClipEncoderLayer {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let eps = cfg.layer_norm_eps;
        Ok(Self {
            layer_norm1: layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm1"))?,
            self_attn: ClipAttention::new(
                cfg.hidden_size,
                cfg.num_attention_heads,
                vb.pp("self_attn"),
            )?,
            layer_norm2: layer_norm(cfg.hidden_size, eps, vb.pp("layer_norm2"))?,
            mlp: ClipMlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.self_attn.forward(&self.layer_norm1.forward(x)?)?)?;
        let mlp = self.mlp.forward(&self.layer_norm2.forward(&x)?)?;
        x + mlp
    }
}

// ─── Vision embeddings ───────────────────────────────────────────────────────

struct ClipVisionEmbeddings {
    class_embedding: Tensor,            // [H_v]
    patch_embedding: candle_nn::Conv2d, // no bias
    position_embedding: Embedding,
    num_positions: usize,
    device: Device,
}

impl ClipVisionEmbeddings {
    fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let class_embedding = vb.get(cfg.hidden_size, "class_embedding")?;
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let patch_embedding = conv2d_no_bias(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embedding"),
        )?;
        let position_embedding = embedding(
            cfg.num_positions(),
            cfg.hidden_size,
            vb.pp("position_embedding"),
        )?;
        Ok(Self {
            class_embedding,
            patch_embedding,
            position_embedding,
            num_positions: cfg.num_positions(),
            device: vb.device().clone(),
        })
    }

    /// `pixel_values`: `[B, C, H, W]` → `[B, N+1, H_v]`.
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let b = pixel_values.dim(0)?;
        let h_v = self.class_embedding.dim(0)?;

        let patches = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten(2, 3)?
            .permute((0, 2, 1))?
            .contiguous()?;

        let cls = self
            .class_embedding
            .reshape((1, 1, h_v))?
            .broadcast_as((b, 1, h_v))?
            .contiguous()?;
        let embeddings = Tensor::cat(&[&cls, &patches], 1)?;

        let seq = embeddings.dim(1)?;
        let pos_ids = Tensor::arange(0u32, seq.min(self.num_positions) as u32, &self.device)?;
        let pos_emb = self.position_embedding.forward(&pos_ids)?;
        embeddings.broadcast_add(&pos_emb)
    }
}

// ─── Vision model ────────────────────────────────────────────────────────────

pub struct ClipVisionOutput {
    /// `[B, N+1, H_v]`, before `post_layernorm`.
    pub last_hidden_state: Tensor,
    /// `post_layernorm(last_hidden_state[:, 0])`, `[B, H_v]`.
    pub pooled: Tensor,
}

pub struct ClipVisionModel {
    embeddings: ClipVisionEmbeddings,
    pre_layrnorm: LayerNorm,
    layers: Vec<ClipEncoderLayer>,
    post_layernorm: LayerNorm,
    config: ClipVisionConfig,
}

impl ClipVisionModel {
    /// `vb` points at the tower (the `vision_model` prefix is added here).
    pub fn new(cfg: &ClipVisionConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("vision_model");
        let eps = cfg.layer_norm_eps;
        let vb_layers = vb.pp("encoder").pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| ClipEncoderLayer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embeddings: ClipVisionEmbeddings::new(cfg, vb.pp("embeddings"))?,
            pre_layrnorm: layer_norm(cfg.hidden_size, eps, vb.pp("pre_layrnorm"))?,
            layers,
            post_layernorm: layer_norm(cfg.hidden_size, eps, vb.pp("post_layernorm"))?,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &ClipVisionConfig {
        &self.config
    }

    pub fn forward(&self, pixel_values: &Tensor) -> Result<ClipVisionOutput> {
        let x = self.embeddings.forward(pixel_values)?;
        let mut x = self.pre_layrnorm.forward(&x)?;
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        let cls = x.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.post_layernorm.forward(&cls)?;
        Ok(ClipVisionOutput {
            last_hidden_state: x,
            pooled,
        })
    }

    /// CLS vector of `last_hidden_state`, `[B, H_v]`.
    pub fn cls_features(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let out = self.forward(pixel_values)?;
        out.last_hidden_state.narrow(1, 0, 1)?.squeeze(1)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny_vision_json() -> serde_json::Value {
        serde_json::json!({
            "hidden_size": 32,
            "num_attention_heads": 2,
            "num_hidden_layers": 2,
            "intermediate_size": 64,
            "image_size": 16,
            "patch_size": 8,
            "num_channels": 3,
            "layer_norm_eps": 1e-5
        })
    }

    #[test]
    fn test_config_defaults_are_vit_b32() {
        let cfg = ClipVisionConfig::from_json(&serde_json::json!({}));
        assert_eq!(cfg.hidden_size, 768);
        assert_eq!(cfg.image_size, 224);
        assert_eq!(cfg.patch_size, 32);
        assert_eq!(cfg.num_positions(), 50);
        assert!(cfg.quick_gelu);
    }

    #[test]
    fn test_forward_shapes() {
        let cfg = ClipVisionConfig::from_json(&tiny_vision_json());
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = ClipVisionModel::new(&cfg, vb).expect("construct");

        let pixels = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let out = model.forward(&pixels).unwrap();
        // (16 / 8)^2 patches + CLS
        assert_eq!(out.last_hidden_state.dims(), &[2, 5, 32]);
        assert_eq!(out.pooled.dims(), &[2, 32]);
        assert_eq!(model.cls_features(&pixels).unwrap().dims(), &[2, 32]);
    }

    #[test]
    fn test_cls_features_skip_post_layernorm() {
        let cfg = ClipVisionConfig::from_json(&tiny_vision_json());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ClipVisionModel::new(&cfg, vb).expect("construct");

        let pixels = Tensor::randn(0f32, 1.0, (1, 3, 16, 16), &Device::Cpu).unwrap();
        let out = model.forward(&pixels).unwrap();
        let cls = model.cls_features(&pixels).unwrap();
        let raw = out.last_hidden_state.narrow(1, 0, 1).unwrap().squeeze(1).unwrap();
        let same = (cls - raw)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(same, 0.0);
    }
}
