//! Shared test utilities for flmr-core.
//!
//! Tiny model configurations, a word-level tokenizer and randomly initialized
//! models for unit and integration tests.

mod tiny_config;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::config::FlmrConfig;
use crate::models::flmr::FlmrModel;
use crate::models::reader::FlmrReader;
use crate::tokenizer::FlmrTokenizer;

pub use tiny_config::{tiny_flmr_config, tiny_reader_config};

/// Build an FLMR model with randomly initialized weights on CPU.
///
/// The returned `VarMap` owns the weights; keep it alive to inspect or train
/// them.
pub fn random_model(cfg: FlmrConfig) -> (FlmrModel, FlmrTokenizer, VarMap) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let tokenizer = FlmrTokenizer::for_testing(cfg.vocab_size);
    let model = FlmrModel::new(&cfg, &tokenizer, vb).expect("build tiny FLMR model");
    (model, tokenizer, varmap)
}

/// Build a span reader with randomly initialized weights on CPU.
pub fn random_reader() -> (FlmrReader, FlmrTokenizer, VarMap) {
    let cfg = tiny_reader_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let tokenizer = FlmrTokenizer::for_testing(cfg.vocab_size);
    let reader = FlmrReader::new(&cfg, vb).expect("build tiny reader");
    (reader, tokenizer, varmap)
}
