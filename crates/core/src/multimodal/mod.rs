//! Image inputs for the vision tower.

pub mod image;

pub use self::image::{ImageProcessor, CLIP_MEAN, CLIP_STD};
