// src/detection/mod.rs

mod client;
mod onnx;
pub mod postprocess;
mod roi;

use crate::types::Detection;
use anyhow::Result;
use image::RgbImage;

pub use client::DetectorClient;
pub use onnx::OnnxPlateDetector;
pub use roi::retain_in_roi;

/// Frame in, raw plate boxes out (frame pixel coordinates).
/// Called from the blocking pool; implementations may block.
pub trait PlateDetector: Send + 'static {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;
}
