use serde::{Deserialize, Serialize};

use crate::error::{FlmrError, Result};

/// FLMR checkpoint configuration (`config.json`).
///
/// The text tower fields follow the BERT layout; the remaining fields control
/// the vision tower, the mapping network and which modality outputs are
/// concatenated on each side. Missing keys fall back to the reference
/// defaults, unknown keys are kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlmrConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    /// Late-interaction embedding dimension shared by both modalities.
    pub dim: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: String,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
    pub pad_token_id: u32,
    /// When > 0 the text encoder projects its pooled output to this size.
    pub projection_dim: usize,

    pub mask_punctuation: bool,
    pub mapping_network_prefix_length: usize,
    pub vision_encoder_dim: usize,
    pub use_vision_encoder: bool,
    pub vision_model_version: String,
    /// CLIP vision tower config; empty object means CLIP ViT-B/32 defaults.
    pub vision_config: serde_json::Value,

    pub separate_query_and_context_text_encoder: bool,
    pub separate_query_and_context_vision_encoder: bool,

    pub query_concat_output_from_vision_encoder: bool,
    pub query_concat_output_from_text_encoder: bool,
    pub context_concat_output_from_vision_encoder: bool,
    pub context_concat_output_from_text_encoder: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for FlmrConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            dim: 128,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: "gelu".to_string(),
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            pad_token_id: 0,
            projection_dim: 0,
            mask_punctuation: true,
            mapping_network_prefix_length: 32,
            vision_encoder_dim: 768,
            use_vision_encoder: true,
            vision_model_version: "openai/clip-vit-base-patch32".to_string(),
            vision_config: serde_json::Value::Object(serde_json::Map::new()),
            separate_query_and_context_text_encoder: false,
            separate_query_and_context_vision_encoder: false,
            query_concat_output_from_vision_encoder: true,
            query_concat_output_from_text_encoder: true,
            context_concat_output_from_vision_encoder: false,
            context_concat_output_from_text_encoder: true,
            extra: serde_json::Map::new(),
        }
    }
}

impl FlmrConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Resolve the four concatenation flags into per-side modality sets.
    pub fn modality_config(&self) -> Result<ModalityConfig> {
        ModalityConfig::from_flags(
            self.query_concat_output_from_vision_encoder,
            self.query_concat_output_from_text_encoder,
            self.context_concat_output_from_vision_encoder,
            self.context_concat_output_from_text_encoder,
        )
    }
}

/// Which encoder outputs make up one side's late-interaction sequence.
///
/// `VisionThenText` always places the vision pseudo-tokens before the text
/// tokens; the document index relies on valid positions forming a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalitySet {
    TextOnly,
    VisionOnly,
    VisionThenText,
}

impl ModalitySet {
    /// Resolve a (vision, text) flag pair. Neither flag set is an error.
    pub fn from_flags(vision: bool, text: bool) -> Result<Self> {
        match (vision, text) {
            (true, true) => Ok(Self::VisionThenText),
            (true, false) => Ok(Self::VisionOnly),
            (false, true) => Ok(Self::TextOnly),
            (false, false) => Err(FlmrError::input_contract(
                "at least one of vision or text output must be requested",
            )),
        }
    }

    pub fn uses_vision(self) -> bool {
        matches!(self, Self::VisionOnly | Self::VisionThenText)
    }

    pub fn uses_text(self) -> bool {
        matches!(self, Self::TextOnly | Self::VisionThenText)
    }
}

/// Encoding side. Query and context sides differ in masking policy and may
/// own separate tower weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Query,
    Context,
}

/// Modality selection for both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModalityConfig {
    pub query: ModalitySet,
    pub context: ModalitySet,
}

impl ModalityConfig {
    pub fn from_flags(
        query_vision: bool,
        query_text: bool,
        context_vision: bool,
        context_text: bool,
    ) -> Result<Self> {
        Ok(Self {
            query: ModalitySet::from_flags(query_vision, query_text)?,
            context: ModalitySet::from_flags(context_vision, context_text)?,
        })
    }

    pub fn side(&self, side: Side) -> ModalitySet {
        match side {
            Side::Query => self.query,
            Side::Context => self.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLMR_CONFIG: &str = r#"{
        "architectures": ["FLMRModelForRetrieval"],
        "attention_probs_dropout_prob": 0.1,
        "dim": 128,
        "hidden_act": "gelu",
        "hidden_size": 768,
        "intermediate_size": 3072,
        "mapping_network_prefix_length": 32,
        "mask_punctuation": true,
        "max_position_embeddings": 512,
        "model_type": "flmr",
        "num_attention_heads": 12,
        "num_hidden_layers": 12,
        "pad_token_id": 0,
        "query_concat_output_from_text_encoder": true,
        "query_concat_output_from_vision_encoder": true,
        "context_concat_output_from_text_encoder": true,
        "context_concat_output_from_vision_encoder": false,
        "use_vision_encoder": true,
        "vision_encoder_dim": 768,
        "vision_model_version": "openai/clip-vit-base-patch32",
        "vocab_size": 30522
    }"#;

    #[test]
    fn parse_flmr_config() {
        let cfg = FlmrConfig::from_json_str(FLMR_CONFIG).expect("parse config");
        assert_eq!(cfg.hidden_size, 768);
        assert_eq!(cfg.dim, 128);
        assert_eq!(cfg.mapping_network_prefix_length, 32);
        assert!(cfg.mask_punctuation);
        assert!(!cfg.separate_query_and_context_text_encoder);
        assert_eq!(cfg.layer_norm_eps, 1e-12);
        assert_eq!(
            cfg.extra.get("model_type").and_then(|v| v.as_str()),
            Some("flmr")
        );
    }

    #[test]
    fn missing_fields_use_defaults() {
        let cfg = FlmrConfig::from_json_str(r#"{"dim": 64}"#).expect("parse");
        assert_eq!(cfg.dim, 64);
        assert_eq!(cfg.vocab_size, 30522);
        assert_eq!(cfg.projection_dim, 0);
        assert!(cfg.use_vision_encoder);
    }

    #[test]
    fn default_modalities() {
        let modalities = FlmrConfig::default().modality_config().expect("valid");
        assert_eq!(modalities.query, ModalitySet::VisionThenText);
        assert_eq!(modalities.context, ModalitySet::TextOnly);
        assert_eq!(modalities.side(Side::Context), ModalitySet::TextOnly);
    }

    #[test]
    fn modality_set_covers_all_flag_combinations() {
        assert_eq!(
            ModalitySet::from_flags(true, true).unwrap(),
            ModalitySet::VisionThenText
        );
        assert_eq!(
            ModalitySet::from_flags(true, false).unwrap(),
            ModalitySet::VisionOnly
        );
        assert_eq!(
            ModalitySet::from_flags(false, true).unwrap(),
            ModalitySet::TextOnly
        );
        assert!(matches!(
            ModalitySet::from_flags(false, false),
            Err(FlmrError::InputContract(_))
        ));
    }

    #[test]
    fn side_without_modality_is_rejected() {
        let mut cfg = FlmrConfig::default();
        cfg.context_concat_output_from_text_encoder = false;
        assert!(cfg.modality_config().is_err());
    }
}
