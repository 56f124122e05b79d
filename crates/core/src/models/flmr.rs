//! FLMR late-interaction retrieval model.
//!
//! Each side (query / context) owns a text tower (BERT + linear projection to
//! `dim`) and a vision tower (optional CLIP encoder + mapping network). The
//! towers are either shared between the two sides or loaded as two separate
//! parameter sets, depending on the checkpoint config.
//!
//! Encoding assembles the requested modalities into one token sequence with
//! the vision pseudo-tokens first, multiplies text rows by the keep mask,
//! L2-normalizes every row and, for documents, optionally down-casts.
//!
//! Weight paths (`{side}` is `context` or `query`):
//! - `{side}_text_encoder.bert_model.*`, `{side}_text_encoder.encode_proj.*`
//! - `{side}_text_encoder_linear.weight`
//! - `{side}_vision_encoder.vision_model.*`
//! - `{side}_vision_projection.model.{0,2}.*`

use std::sync::Arc;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::config::{FlmrConfig, ModalityConfig, ModalitySet, Side};
use crate::error::{FlmrError, Result};
use crate::masking::{keep_mask, Skiplist};
use crate::scoring;
use crate::tokenizer::FlmrTokenizer;

use super::bert::{BertConfig, TextEncoder};
use super::clip::{ClipVisionConfig, ClipVisionModel};
use super::mapping::{MappingConfig, MappingNetwork};

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// Raw inputs for one encoding call. Any subset may be given; the requested
/// [`ModalitySet`] decides which of them must be present.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderInputs<'a> {
    /// `(B, L)` token ids.
    pub input_ids: Option<&'a Tensor>,
    /// `(B, L)` 0/1 attention mask.
    pub attention_mask: Option<&'a Tensor>,
    /// `(B, C, H, W)` normalized pixels.
    pub pixel_values: Option<&'a Tensor>,
    /// `(B, vision_encoder_dim)` precomputed pooled vision features.
    pub image_features: Option<&'a Tensor>,
}

impl<'a> EncoderInputs<'a> {
    pub fn text(input_ids: &'a Tensor, attention_mask: &'a Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            attention_mask: Some(attention_mask),
            ..Default::default()
        }
    }

    pub fn pixels(pixel_values: &'a Tensor) -> Self {
        Self {
            pixel_values: Some(pixel_values),
            ..Default::default()
        }
    }

    pub fn features(image_features: &'a Tensor) -> Self {
        Self {
            image_features: Some(image_features),
            ..Default::default()
        }
    }

    pub fn with_text(mut self, input_ids: &'a Tensor, attention_mask: &'a Tensor) -> Self {
        self.input_ids = Some(input_ids);
        self.attention_mask = Some(attention_mask);
        self
    }

    pub fn with_pixels(mut self, pixel_values: &'a Tensor) -> Self {
        self.pixel_values = Some(pixel_values);
        self
    }

    pub fn with_features(mut self, image_features: &'a Tensor) -> Self {
        self.image_features = Some(image_features);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum ImageInput<'a> {
    Pixels(&'a Tensor),
    Features(&'a Tensor),
}

struct TextInput<'a> {
    input_ids: &'a Tensor,
    attention_mask: &'a Tensor,
}

/// Inputs checked against the requested modalities.
struct ResolvedInputs<'a> {
    text: Option<TextInput<'a>>,
    image: Option<ImageInput<'a>>,
}

impl<'a> ResolvedInputs<'a> {
    fn resolve(inputs: &EncoderInputs<'a>, modality: ModalitySet) -> Result<Self> {
        let image = match (inputs.pixel_values, inputs.image_features) {
            (Some(_), Some(_)) => {
                return Err(FlmrError::input_contract(
                    "pixel_values and image_features cannot be provided at the same time",
                ))
            }
            (Some(p), None) => Some(ImageInput::Pixels(p)),
            (None, Some(f)) => Some(ImageInput::Features(f)),
            (None, None) => None,
        };
        let text = match (inputs.input_ids, inputs.attention_mask) {
            (Some(input_ids), Some(attention_mask)) => {
                if input_ids.dims() != attention_mask.dims() {
                    return Err(FlmrError::shape_mismatch(format!(
                        "input_ids {:?} and attention_mask {:?} differ",
                        input_ids.dims(),
                        attention_mask.dims()
                    )));
                }
                Some(TextInput {
                    input_ids,
                    attention_mask,
                })
            }
            (None, None) => None,
            _ => {
                return Err(FlmrError::input_contract(
                    "input_ids and attention_mask must be provided together",
                ))
            }
        };
        if text.is_none() && image.is_none() {
            return Err(FlmrError::input_contract(
                "neither text nor image inputs were provided",
            ));
        }
        if modality.uses_text() && text.is_none() {
            return Err(FlmrError::input_contract(
                "text output requested but input_ids/attention_mask are missing",
            ));
        }
        if modality.uses_vision() && image.is_none() {
            return Err(FlmrError::input_contract(
                "vision output requested but neither pixel_values nor image_features were given",
            ));
        }
        let resolved = Self {
            text: text.filter(|_| modality.uses_text()),
            image: image.filter(|_| modality.uses_vision()),
        };
        resolved.check_batch()?;
        Ok(resolved)
    }

    fn check_batch(&self) -> Result<()> {
        let text_batch = match &self.text {
            Some(t) => Some(t.input_ids.dims2()?.0),
            None => None,
        };
        let image_batch = match self.image {
            Some(ImageInput::Pixels(p)) => Some(p.dims4()?.0),
            Some(ImageInput::Features(f)) => Some(f.dims2()?.0),
            None => None,
        };
        match (text_batch, image_batch) {
            (Some(t), Some(i)) if t != i => Err(FlmrError::shape_mismatch(format!(
                "text batch {t} != image batch {i}"
            ))),
            _ => Ok(()),
        }
    }
}

// ─── Towers ──────────────────────────────────────────────────────────────────

/// One sub-network per side, either shared or independently owned.
pub enum Towers<T> {
    Shared(Arc<T>),
    Separate { query: T, context: T },
}

impl<T> Towers<T> {
    pub fn get(&self, side: Side) -> &T {
        match self {
            Towers::Shared(tower) => tower,
            Towers::Separate { query, .. } if side == Side::Query => query,
            Towers::Separate { context, .. } => context,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Towers::Shared(_))
    }

    fn load(
        separate: bool,
        vb: &VarBuilder,
        load: impl Fn(VarBuilder, &str) -> candle_core::Result<T>,
    ) -> candle_core::Result<Self> {
        let context = load(vb.clone(), "context")?;
        if separate {
            let query = load(vb.clone(), "query")?;
            Ok(Towers::Separate { query, context })
        } else {
            Ok(Towers::Shared(Arc::new(context)))
        }
    }
}

pub struct TextTower {
    encoder: TextEncoder,
    linear: Linear,
}

impl TextTower {
    fn new(cfg: &FlmrConfig, vb: VarBuilder, side: &str) -> candle_core::Result<Self> {
        let bert_cfg = BertConfig::from(cfg);
        Ok(Self {
            encoder: TextEncoder::new(&bert_cfg, vb.pp(format!("{side}_text_encoder")))?,
            linear: linear_no_bias(
                cfg.hidden_size,
                cfg.dim,
                vb.pp(format!("{side}_text_encoder_linear")),
            )?,
        })
    }

    /// `(B, L, dim)` projected token states.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.encoder.forward(input_ids, attention_mask, None)?;
        self.linear.forward(&out.last_hidden_state)
    }
}

pub struct VisionTower {
    encoder: Option<ClipVisionModel>,
    projection: MappingNetwork,
    dtype: DType,
}

impl VisionTower {
    fn new(
        cfg: &FlmrConfig,
        vision_cfg: Option<&ClipVisionConfig>,
        vb: VarBuilder,
        side: &str,
    ) -> candle_core::Result<Self> {
        let mapping = MappingConfig {
            vision_dim: cfg.vision_encoder_dim,
            dim: cfg.dim,
            prefix_length: cfg.mapping_network_prefix_length,
        };
        let encoder = match vision_cfg {
            Some(vc) => Some(ClipVisionModel::new(
                vc,
                vb.pp(format!("{side}_vision_encoder")),
            )?),
            None => None,
        };
        Ok(Self {
            encoder,
            projection: MappingNetwork::new(mapping, vb.pp(format!("{side}_vision_projection")))?,
            dtype: vb.dtype(),
        })
    }

    /// `(B, prefix_length, dim)` pseudo-tokens. Inputs are cast to the
    /// weight dtype.
    fn forward(&self, image: ImageInput<'_>) -> Result<Tensor> {
        let features = match image {
            ImageInput::Features(f) => f.to_dtype(self.dtype)?,
            ImageInput::Pixels(p) => match &self.encoder {
                Some(encoder) => encoder.cls_features(&p.to_dtype(self.dtype)?)?,
                None => {
                    return Err(FlmrError::input_contract(
                        "pixel_values given but the model has no vision encoder",
                    ))
                }
            },
        };
        Ok(self.projection.forward(&features)?)
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

/// Assembled, not yet normalized, token sequence for one side.
struct Assembled {
    embeddings: Tensor,
    mask: Tensor,
}

pub struct QueryEncoding {
    /// `(B, L, dim)`, L2-normalized rows.
    pub embeddings: Tensor,
    /// `(B, L)` `U8`; padding only, punctuation kept.
    pub mask: Tensor,
    /// `(B, dim)`, first position before normalization.
    pub pooled: Tensor,
}

/// Document output shaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocOutputMode {
    /// Padded embeddings, mask and pooled vector.
    Dense,
    /// Padded embeddings and mask only, for downstream masked reduction.
    WithMask,
    /// One `(valid_len, dim)` tensor per document.
    Ragged,
}

pub enum DocEncoding {
    Dense {
        embeddings: Tensor,
        mask: Tensor,
        pooled: Tensor,
    },
    Masked {
        embeddings: Tensor,
        mask: Tensor,
    },
    Ragged(Vec<Tensor>),
}

impl DocEncoding {
    pub fn mode(&self) -> DocOutputMode {
        match self {
            DocEncoding::Dense { .. } => DocOutputMode::Dense,
            DocEncoding::Masked { .. } => DocOutputMode::WithMask,
            DocEncoding::Ragged(_) => DocOutputMode::Ragged,
        }
    }

    /// `(embeddings, mask)` of the padded variants.
    pub fn into_padded(self) -> Result<(Tensor, Tensor)> {
        match self {
            DocEncoding::Dense {
                embeddings, mask, ..
            }
            | DocEncoding::Masked { embeddings, mask } => Ok((embeddings, mask)),
            DocEncoding::Ragged(_) => Err(FlmrError::input_contract(
                "ragged document encoding has no padded tensor",
            )),
        }
    }

    pub fn into_ragged(self) -> Result<Vec<Tensor>> {
        match self {
            DocEncoding::Ragged(docs) => Ok(docs),
            _ => Err(FlmrError::input_contract(
                "document encoding is padded, not ragged",
            )),
        }
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

pub struct FlmrModel {
    text: Towers<TextTower>,
    vision: Towers<VisionTower>,
    skiplist: Arc<Skiplist>,
    modalities: ModalityConfig,
    context_dtype: Option<DType>,
    vision_config: Option<ClipVisionConfig>,
    pad_token_id: u32,
    dim: usize,
    prefix_length: usize,
    device: Device,
    dtype: DType,
}

impl FlmrModel {
    /// Build the model; the punctuation skiplist comes from the context
    /// tokenizer when `mask_punctuation` is set.
    pub fn new(cfg: &FlmrConfig, context_tokenizer: &FlmrTokenizer, vb: VarBuilder) -> Result<Self> {
        let skiplist = if cfg.mask_punctuation {
            Skiplist::from_tokenizer(context_tokenizer)?
        } else {
            Skiplist::empty()
        };
        Self::with_skiplist(cfg, skiplist, vb)
    }

    pub fn with_skiplist(cfg: &FlmrConfig, skiplist: Skiplist, vb: VarBuilder) -> Result<Self> {
        let modalities = cfg.modality_config()?;
        let vision_config = cfg
            .use_vision_encoder
            .then(|| ClipVisionConfig::from_json(&cfg.vision_config));

        let text = Towers::load(cfg.separate_query_and_context_text_encoder, &vb, |vb, side| {
            TextTower::new(cfg, vb, side)
        })?;
        let vision = Towers::load(
            cfg.separate_query_and_context_vision_encoder,
            &vb,
            |vb, side| VisionTower::new(cfg, vision_config.as_ref(), vb, side),
        )?;

        tracing::debug!(
            dim = cfg.dim,
            prefix_length = cfg.mapping_network_prefix_length,
            shared_text = text.is_shared(),
            shared_vision = vision.is_shared(),
            vision_encoder = cfg.use_vision_encoder,
            skiplist = skiplist.len(),
            "built FLMR model"
        );

        Ok(Self {
            text,
            vision,
            skiplist: Arc::new(skiplist),
            modalities,
            context_dtype: None,
            vision_config,
            pad_token_id: cfg.pad_token_id,
            dim: cfg.dim,
            prefix_length: cfg.mapping_network_prefix_length,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Store document embeddings in `dtype` (e.g. `F16`) after normalization.
    pub fn with_context_dtype(mut self, dtype: Option<DType>) -> Self {
        self.context_dtype = dtype;
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn prefix_length(&self) -> usize {
        self.prefix_length
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Weight dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn modalities(&self) -> ModalityConfig {
        self.modalities
    }

    pub fn skiplist(&self) -> &Skiplist {
        &self.skiplist
    }

    pub fn vision_config(&self) -> Option<&ClipVisionConfig> {
        self.vision_config.as_ref()
    }

    fn assemble(
        &self,
        side: Side,
        inputs: &EncoderInputs<'_>,
        modality: ModalitySet,
    ) -> Result<Assembled> {
        let resolved = ResolvedInputs::resolve(inputs, modality)?;

        let text = match resolved.text {
            Some(t) => {
                let empty = Skiplist::empty();
                let skiplist = match side {
                    Side::Query => &empty,
                    Side::Context => self.skiplist.as_ref(),
                };
                let input_ids = t.input_ids.to_device(&self.device)?;
                let attention_mask = t.attention_mask.to_device(&self.device)?;
                let embeddings = self
                    .text
                    .get(side)
                    .forward(&input_ids, &attention_mask)?;
                let mask = keep_mask(&input_ids, skiplist, self.pad_token_id)?;
                let embeddings = embeddings
                    .broadcast_mul(&mask.to_dtype(embeddings.dtype())?.unsqueeze(2)?)?;
                Some(Assembled { embeddings, mask })
            }
            None => None,
        };

        let vision = match resolved.image {
            Some(image) => {
                let embeddings = self.vision.get(side).forward(image)?;
                let (batch, prefix, _) = embeddings.dims3()?;
                let mask = Tensor::ones((batch, prefix), DType::U8, &self.device)?;
                Some(Assembled { embeddings, mask })
            }
            None => None,
        };

        match (modality, vision, text) {
            (ModalitySet::VisionThenText, Some(v), Some(t)) => Ok(Assembled {
                embeddings: Tensor::cat(&[&v.embeddings, &t.embeddings], 1)?,
                mask: Tensor::cat(&[&v.mask, &t.mask], 1)?,
            }),
            (ModalitySet::VisionOnly, Some(v), _) => Ok(v),
            (ModalitySet::TextOnly, _, Some(t)) => Ok(t),
            _ => Err(FlmrError::input_contract(
                "requested modality produced no output",
            )),
        }
    }

    /// Encode queries with the configured query modalities.
    pub fn query(&self, inputs: &EncoderInputs<'_>) -> Result<QueryEncoding> {
        self.query_with(inputs, None)
    }

    /// Encode queries, optionally overriding the query modalities.
    pub fn query_with(
        &self,
        inputs: &EncoderInputs<'_>,
        modality: Option<ModalitySet>,
    ) -> Result<QueryEncoding> {
        let modality = modality.unwrap_or(self.modalities.query);
        let Assembled { embeddings, mask } = self.assemble(Side::Query, inputs, modality)?;
        let pooled = embeddings.narrow(1, 0, 1)?.squeeze(1)?;
        Ok(QueryEncoding {
            embeddings: l2_normalize(&embeddings)?,
            mask,
            pooled,
        })
    }

    /// Encode documents with the configured context modalities.
    pub fn doc(&self, inputs: &EncoderInputs<'_>, mode: DocOutputMode) -> Result<DocEncoding> {
        self.doc_with(inputs, mode, None)
    }

    pub fn doc_with(
        &self,
        inputs: &EncoderInputs<'_>,
        mode: DocOutputMode,
        modality: Option<ModalitySet>,
    ) -> Result<DocEncoding> {
        let modality = modality.unwrap_or(self.modalities.context);
        let Assembled { embeddings, mask } = self.assemble(Side::Context, inputs, modality)?;
        let mut embeddings = l2_normalize(&embeddings)?;
        if let Some(dtype) = self.context_dtype {
            embeddings = embeddings.to_dtype(dtype)?;
        }
        Ok(match mode {
            DocOutputMode::Dense => DocEncoding::Dense {
                pooled: embeddings.narrow(1, 0, 1)?.squeeze(1)?,
                embeddings,
                mask,
            },
            DocOutputMode::WithMask => DocEncoding::Masked { embeddings, mask },
            DocOutputMode::Ragged => DocEncoding::Ragged(ragged_rows(&embeddings, &mask)?),
        })
    }

    /// MaxSim scores, see [`scoring::colbert_score`].
    pub fn score(&self, q: &Tensor, d: &Tensor, mask: &Tensor) -> Result<Tensor> {
        scoring::colbert_score(q, d, mask)
    }
}

/// Row-wise L2 normalization over the last dimension.
pub fn l2_normalize(tensor: &Tensor) -> Result<Tensor> {
    let norm = tensor.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    let norm = norm.clamp(1e-12, f64::MAX)?;
    Ok(tensor.broadcast_div(&norm)?)
}

/// Keep only the mask-true rows of each `(L, dim)` item.
pub fn ragged_rows(embeddings: &Tensor, mask: &Tensor) -> Result<Vec<Tensor>> {
    let (batch, seq_len, dim) = embeddings.dims3()?;
    if mask.dims() != [batch, seq_len] {
        return Err(FlmrError::shape_mismatch(format!(
            "mask {:?} does not match embeddings {:?}",
            mask.dims(),
            embeddings.dims()
        )));
    }
    let rows = mask.to_dtype(DType::U8)?.to_vec2::<u8>()?;
    rows.iter()
        .enumerate()
        .map(|(b, keep)| {
            let idx: Vec<u32> = keep
                .iter()
                .enumerate()
                .filter(|(_, &k)| k != 0)
                .map(|(i, _)| i as u32)
                .collect();
            let item = embeddings.get(b)?;
            if idx.is_empty() {
                return Ok(Tensor::zeros((0, dim), embeddings.dtype(), embeddings.device())?);
            }
            let n = idx.len();
            let idx = Tensor::from_vec(idx, n, embeddings.device())?;
            Ok(item.index_select(&idx, 0)?)
        })
        .collect()
}
