use crate::config::FlmrConfig;
use crate::models::bert::BertConfig;

/// Tiny FLMR config for tests: 2-layer BERT (hidden 32), `dim` 8,
/// 4 vision pseudo-tokens and a 1-layer CLIP tower on 16x16 images
/// (hidden 16, matching `vision_encoder_dim`).
pub fn tiny_flmr_config() -> FlmrConfig {
    FlmrConfig {
        vocab_size: 128,
        hidden_size: 32,
        dim: 8,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        intermediate_size: 64,
        max_position_embeddings: 64,
        mapping_network_prefix_length: 4,
        vision_encoder_dim: 16,
        vision_config: serde_json::json!({
            "hidden_size": 16,
            "num_attention_heads": 2,
            "num_hidden_layers": 1,
            "intermediate_size": 32,
            "image_size": 16,
            "patch_size": 8,
            "num_channels": 3,
            "layer_norm_eps": 1e-5
        }),
        ..FlmrConfig::default()
    }
}

/// Tiny BERT config for the span reader.
pub fn tiny_reader_config() -> BertConfig {
    BertConfig {
        vocab_size: 128,
        hidden_size: 32,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        intermediate_size: 64,
        max_position_embeddings: 64,
        ..BertConfig::default()
    }
}
