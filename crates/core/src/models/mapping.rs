//! Vision-to-text mapping network.
//!
//! Projects one pooled vision vector per image into `prefix_length`
//! pseudo-tokens living in the late-interaction embedding space:
//!
//! ```text
//! [B, vision_dim] → Linear → tanh → Linear → [B, prefix_length * dim]
//!                → reshape [B, prefix_length, dim]
//! ```
//!
//! Weights are stored as `model.0` and `model.2` (a torch `Sequential` with
//! the activation at index 1).

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingConfig {
    pub vision_dim: usize,
    pub dim: usize,
    pub prefix_length: usize,
}

impl MappingConfig {
    pub fn output_size(&self) -> usize {
        self.dim * self.prefix_length
    }

    pub fn hidden_size(&self) -> usize {
        self.output_size() / 2
    }
}

pub struct MappingNetwork {
    fc1: Linear,
    fc2: Linear,
    cfg: MappingConfig,
}

impl MappingNetwork {
    pub fn new(cfg: MappingConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("model");
        Ok(Self {
            fc1: linear(cfg.vision_dim, cfg.hidden_size(), vb.pp("0"))?,
            fc2: linear(cfg.hidden_size(), cfg.output_size(), vb.pp("2"))?,
            cfg,
        })
    }

    pub fn prefix_length(&self) -> usize {
        self.cfg.prefix_length
    }

    /// `features`: `[B, vision_dim]` → `[B, prefix_length, dim]`.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let batch = features.dim(0)?;
        let hidden = self.fc1.forward(features)?.tanh()?;
        self.fc2
            .forward(&hidden)?
            .reshape((batch, self.cfg.prefix_length, self.cfg.dim))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn cfg() -> MappingConfig {
        MappingConfig {
            vision_dim: 16,
            dim: 8,
            prefix_length: 4,
        }
    }

    #[test]
    fn test_output_shape() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let net = MappingNetwork::new(cfg(), vb).unwrap();
        let features = Tensor::ones((3, 16), DType::F32, &Device::Cpu).unwrap();
        let out = net.forward(&features).unwrap();
        assert_eq!(out.dims(), &[3, 4, 8]);
        assert_eq!(net.prefix_length(), 4);
    }

    #[test]
    fn test_hidden_is_half_of_output() {
        assert_eq!(cfg().output_size(), 32);
        assert_eq!(cfg().hidden_size(), 16);
    }

    #[test]
    fn test_rows_come_from_flat_output() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = MappingNetwork::new(cfg(), vb).unwrap();
        let features = Tensor::randn(0f32, 1.0, (2, 16), &Device::Cpu).unwrap();

        let out = net.forward(&features).unwrap();
        let flat = net
            .fc2
            .forward(&net.fc1.forward(&features).unwrap().tanh().unwrap())
            .unwrap();
        // Second pseudo-token of item 1 is columns [8, 16) of its flat output.
        let row = out.get(1).unwrap().get(1).unwrap().to_vec1::<f32>().unwrap();
        let cols = flat.get(1).unwrap().narrow(0, 8, 8).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(row, cols);
    }
}
