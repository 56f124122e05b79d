//! Neural sub-networks.
//!
//! `bert` and `clip` are the text and vision towers, `mapping` turns pooled
//! vision features into pseudo-tokens, `flmr` assembles both into the
//! late-interaction retriever and `reader` is the extractive span reader.

pub mod bert;
pub mod clip;
pub mod flmr;
pub mod mapping;
pub mod reader;

pub use bert::{BertConfig, BertModel, TextEncoder, TextEncoderOutput};
pub use clip::{ClipVisionConfig, ClipVisionModel, ClipVisionOutput};
pub use flmr::{
    l2_normalize, ragged_rows, DocEncoding, DocOutputMode, EncoderInputs, FlmrModel,
    QueryEncoding, Towers,
};
pub use mapping::{MappingConfig, MappingNetwork};
pub use reader::{FlmrReader, ReaderInputs, ReaderOutput, SpanPrediction};
