//! Image loading and CLIP-style preprocessing.
//!
//! Images are resized to fill a square of the vision tower's input size,
//! scaled to `[0, 1]` and normalized per channel with the CLIP mean/std.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;

use crate::error::{FlmrError, Result};
use crate::models::clip::ClipVisionConfig;

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_5, 0.261_302_6, 0.275_777_1];

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    image_size: usize,
    mean: [f32; 3],
    std: [f32; 3],
    device: Device,
    dtype: DType,
}

impl ImageProcessor {
    pub fn new(image_size: usize, device: &Device) -> Self {
        Self {
            image_size,
            mean: CLIP_MEAN,
            std: CLIP_STD,
            device: device.clone(),
            dtype: DType::F32,
        }
    }

    pub fn from_vision_config(cfg: &ClipVisionConfig, device: &Device) -> Self {
        Self::new(cfg.image_size, device)
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Decode one file into a `(3, H, W)` tensor.
    pub fn load(&self, path: &Path) -> Result<Tensor> {
        let img = image::ImageReader::open(path)
            .map_err(|e| resource_error(path, e))?
            .with_guessed_format()
            .map_err(|e| resource_error(path, e))?
            .decode()
            .map_err(|e| resource_error(path, e))?;
        self.preprocess(&img)
    }

    /// Decode every file into a `(N, 3, H, W)` batch. The first failure
    /// aborts the whole batch.
    pub fn load_batch<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Tensor> {
        let images = paths
            .iter()
            .map(|p| self.load(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        if images.is_empty() {
            return Err(FlmrError::input_contract("no images to load"));
        }
        Ok(Tensor::stack(&images, 0)?)
    }

    pub fn preprocess(&self, img: &DynamicImage) -> Result<Tensor> {
        let size = self.image_size;
        let rgb = img
            .resize_to_fill(size as u32, size as u32, FilterType::Triangle)
            .to_rgb8()
            .into_raw();
        let mean = Tensor::new(&self.mean, &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.std, &Device::Cpu)?.reshape((3, 1, 1))?;
        let pixels = Tensor::from_vec(rgb, (size, size, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1. / 255., 0.)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?;
        Ok(pixels.to_dtype(self.dtype)?.to_device(&self.device)?)
    }
}

fn resource_error(path: &Path, err: impl std::fmt::Display) -> FlmrError {
    FlmrError::ResourceLoad {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, w: u32, h: u32, px: [u8; 3]) -> std::path::PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(w, h, Rgb(px)).save(&path).unwrap();
        path
    }

    #[test]
    fn test_load_resizes_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "white.png", 40, 20, [255, 255, 255]);
        let proc = ImageProcessor::new(16, &Device::Cpu);
        let t = proc.load(&path).unwrap();
        assert_eq!(t.dims(), &[3, 16, 16]);

        let red = t.get(0).unwrap().get(0).unwrap().get(0).unwrap();
        let expected = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((red.to_scalar::<f32>().unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn test_load_batch_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_png(dir.path(), "a.png", 8, 8, [0, 0, 0]);
        let b = write_png(dir.path(), "b.png", 32, 32, [10, 20, 30]);
        let proc = ImageProcessor::new(16, &Device::Cpu);
        let batch = proc.load_batch(&[a, b]).unwrap();
        assert_eq!(batch.dims(), &[2, 3, 16, 16]);
    }

    #[test]
    fn test_output_dtype_follows_processor() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "grey.png", 8, 8, [128, 128, 128]);
        let processor = ImageProcessor::new(4, &Device::Cpu).with_dtype(DType::F16);
        let pixels = processor.load_batch(&[path]).unwrap();
        assert_eq!(pixels.dtype(), DType::F16);
        assert_eq!(pixels.dims(), &[1, 3, 4, 4]);
    }

    #[test]
    fn test_missing_file_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write_png(dir.path(), "ok.png", 8, 8, [1, 2, 3]);
        let missing = dir.path().join("missing.png");
        let proc = ImageProcessor::new(16, &Device::Cpu);
        let err = proc.load_batch(&[ok, missing.clone()]).unwrap_err();
        match err {
            FlmrError::ResourceLoad { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_corrupt_file_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"not an image").unwrap();
        let proc = ImageProcessor::new(16, &Device::Cpu);
        assert!(matches!(
            proc.load(&path),
            Err(FlmrError::ResourceLoad { .. })
        ));
    }
}
