// src/detection/client.rs
//
// Async face of the detector. Inference runs on the blocking pool under a
// timeout; any failure becomes an empty result plus a counter bump so the
// detection loop never stalls on the model.

use super::postprocess::threshold_and_nms;
use super::PlateDetector;
use crate::pipeline::metrics::PipelineMetrics;
use crate::pipeline::rate_gate::RateGate;
use crate::types::{Detection, DetectionConfig, Frame};
use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WARN_EVERY_SEC: f64 = 5.0;

pub struct DetectorClient<D: PlateDetector> {
    detector: Arc<Mutex<D>>,
    conf_threshold: f32,
    nms_iou: f32,
    timeout: Duration,
    metrics: PipelineMetrics,
    warn_gate: RateGate,
}

impl<D: PlateDetector> DetectorClient<D> {
    pub fn new(detector: D, cfg: &DetectionConfig, metrics: PipelineMetrics) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
            conf_threshold: cfg.conf_threshold,
            nms_iou: cfg.nms_iou,
            timeout: Duration::from_secs_f64(cfg.timeout_sec),
            metrics,
            warn_gate: RateGate::new(WARN_EVERY_SEC),
        }
    }

    /// Thresholded, NMS-filtered boxes for `frame`. Empty on any failure.
    pub async fn detect(&mut self, frame: Arc<Frame>, now: f64) -> Vec<Detection> {
        self.metrics.inc(&self.metrics.detector_runs);
        let started = Instant::now();

        match self.run(frame).await {
            Ok(raw) => {
                let elapsed_us = started.elapsed().as_micros() as u64;
                self.metrics.set_timing(&self.metrics.detector_time_us, elapsed_us);
                let detections = threshold_and_nms(raw, self.conf_threshold, self.nms_iou);
                self.metrics.add(&self.metrics.detections, detections.len() as u64);
                debug!("Detected {} plate box(es) in {}us", detections.len(), elapsed_us);
                detections
            }
            Err(e) => {
                self.metrics.inc(&self.metrics.detector_errors);
                if self.warn_gate.allow(now) {
                    let suppressed = self.warn_gate.take_suppressed();
                    warn!("Detector failed: {:#} ({} similar suppressed)", e, suppressed);
                }
                Vec::new()
            }
        }
    }

    async fn run(&self, frame: Arc<Frame>) -> Result<Vec<Detection>> {
        let detector = Arc::clone(&self.detector);
        let job = tokio::task::spawn_blocking(move || {
            // A timed-out inference may still hold the session
            let mut guard = match detector.try_lock() {
                Ok(g) => g,
                Err(TryLockError::WouldBlock) => bail!("detector still busy with a previous frame"),
                Err(TryLockError::Poisoned(p)) => p.into_inner(),
            };
            guard.detect(&frame.image)
        });

        match tokio::time::timeout(self.timeout, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(anyhow!("detector task failed: {}", join_err)),
            Err(_) => bail!("detector timed out after {:?}", self.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::atomic::Ordering;

    enum Script {
        Boxes(Vec<Detection>),
        Fail,
        Sleep(Duration),
    }

    struct FakeDetector(Script);

    impl PlateDetector for FakeDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
            match &self.0 {
                Script::Boxes(b) => Ok(b.clone()),
                Script::Fail => bail!("model exploded"),
                Script::Sleep(d) => {
                    std::thread::sleep(*d);
                    Ok(Vec::new())
                }
            }
        }
    }

    fn frame() -> Arc<Frame> {
        Arc::new(Frame {
            image: RgbImage::new(64, 48),
            timestamp: 0.0,
            seq: 1,
        })
    }

    fn det(bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id: None,
        }
    }

    fn cfg(timeout_sec: f64) -> DetectionConfig {
        DetectionConfig {
            conf_threshold: 0.35,
            nms_iou: 0.45,
            timeout_sec,
            ..DetectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_threshold_and_nms_applied() {
        let metrics = PipelineMetrics::new();
        let boxes = vec![
            det([0.0, 0.0, 40.0, 12.0], 0.9),
            det([1.0, 0.0, 41.0, 12.0], 0.8),
            det([10.0, 30.0, 50.0, 42.0], 0.2),
        ];
        let mut client = DetectorClient::new(FakeDetector(Script::Boxes(boxes)), &cfg(1.0), metrics.clone());

        let dets = client.detect(frame(), 0.0).await;
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].confidence, 0.9);
        assert_eq!(metrics.detections.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_model_error_is_empty_and_counted() {
        let metrics = PipelineMetrics::new();
        let mut client = DetectorClient::new(FakeDetector(Script::Fail), &cfg(1.0), metrics.clone());

        assert!(client.detect(frame(), 0.0).await.is_empty());
        assert!(client.detect(frame(), 0.5).await.is_empty());
        assert_eq!(metrics.detector_errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.detector_runs.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_empty_and_busy_session_skipped() {
        let metrics = PipelineMetrics::new();
        let mut client = DetectorClient::new(
            FakeDetector(Script::Sleep(Duration::from_millis(300))),
            &cfg(0.05),
            metrics.clone(),
        );

        assert!(client.detect(frame(), 0.0).await.is_empty());
        // the first inference is still running on the blocking pool
        assert!(client.detect(frame(), 0.1).await.is_empty());
        assert_eq!(metrics.detector_errors.load(Ordering::Relaxed), 2);
    }
}
