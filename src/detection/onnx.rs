// src/detection/onnx.rs

use super::postprocess::{decode_output, letterbox};
use super::PlateDetector;
use crate::types::{Detection, DetectionConfig};
use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, info};

/// YOLO plate detector on ONNX Runtime (CPU).
pub struct OnnxPlateDetector {
    session: Session,
    input_name: String,
    input_size: usize,
    /// Boxes below this never leave the decoder
    decode_floor: f32,
}

impl OnnxPlateDetector {
    pub fn new(cfg: &DetectionConfig) -> Result<Self> {
        info!("Loading plate detector: {}", cfg.model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(cfg.intra_threads)?
            .commit_from_file(&cfg.model_path)
            .with_context(|| format!("Failed to load detector model {}", cfg.model_path))?;

        info!(
            "✓ Plate detector initialized ({}x{}, input '{}')",
            cfg.input_size, cfg.input_size, cfg.input_name
        );
        Ok(Self {
            session,
            input_name: cfg.input_name.clone(),
            input_size: cfg.input_size,
            decode_floor: cfg.conf_threshold,
        })
    }
}

impl PlateDetector for OnnxPlateDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (input, lb) = letterbox(image, self.input_size);

        let shape = [1usize, 3, self.input_size, self.input_size];
        let input_value = ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_value])?;
        let (out_shape, data) = outputs[0].try_extract_tensor::<f32>()?;
        let dims: Vec<i64> = out_shape.iter().copied().collect();

        let detections = decode_output(
            &dims,
            data,
            &lb,
            self.decode_floor,
            image.width() as f32,
            image.height() as f32,
        )?;
        debug!("Detector produced {} raw box(es) from {:?}", detections.len(), dims);
        Ok(detections)
    }
}
