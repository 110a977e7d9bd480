// src/pipeline/detection_loop.rs
//
// Fixed-rate detection task. Sole owner of tracker, stabilizer and
// best-crop state; the sender only talks back through the feedback channel.
//
// Per tick:
//   latest frame → detector → ROI → tracker → stabilizer → best stable track
//   → crop → sanity → best-crop window → candidate queue

use super::candidate_queue::CandidateQueue;
use super::metrics::PipelineMetrics;
use super::rate_gate::RateGate;
use crate::analysis::plate_tracker::PlateTracker;
use crate::analysis::stabilizer::{build_strategy, Observation, StabilityStrategy};
use crate::capture::FrameHandle;
use crate::detection::{retain_in_roi, DetectorClient, PlateDetector};
use crate::selection::{
    crop_image, crop_rect, BestCropSelector, Candidate, RejectReporter, SanityFilter, SanityInput,
};
use crate::types::{bbox_area, Clock, Config, CropConfig, Frame, RoiConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const STALE_LOG_EVERY_SEC: f64 = 5.0;

/// OCR result routed back from the sender.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub track_id: u32,
    /// Normalized plate text
    pub plate: String,
    pub confidence: f32,
}

/// Per-track box for the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayBox {
    pub track_id: u32,
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub hits: u32,
    pub stable: bool,
    pub plate: Option<String>,
}

pub struct DetectionLoop<D: PlateDetector> {
    frames: FrameHandle,
    detector: DetectorClient<D>,
    roi: RoiConfig,
    tracker: PlateTracker,
    stabilizer: Box<dyn StabilityStrategy>,
    sanity: SanityFilter,
    rejects: RejectReporter,
    /// None when best-crop selection is disabled
    selector: Option<BestCropSelector>,
    crop_cfg: CropConfig,
    queue: Arc<CandidateQueue>,
    feedback: mpsc::Receiver<Feedback>,
    overlay: watch::Sender<Vec<OverlayBox>>,
    clock: Clock,
    metrics: PipelineMetrics,
    det_fps: f64,
    last_seq: u64,
    stale_gate: RateGate,
}

impl<D: PlateDetector> DetectionLoop<D> {
    pub fn new(
        cfg: &Config,
        frames: FrameHandle,
        detector: DetectorClient<D>,
        queue: Arc<CandidateQueue>,
        feedback: mpsc::Receiver<Feedback>,
        clock: Clock,
        metrics: PipelineMetrics,
    ) -> (Self, watch::Receiver<Vec<OverlayBox>>) {
        let (overlay, overlay_rx) = watch::channel(Vec::new());
        let selector = cfg
            .best_crop
            .enable
            .then(|| BestCropSelector::new(cfg.best_crop.clone()));

        let this = Self {
            frames,
            detector,
            roi: cfg.detection.roi.clone(),
            tracker: PlateTracker::new(cfg.tracking.clone()),
            stabilizer: build_strategy(&cfg.stabilization, cfg.detection.det_fps),
            sanity: SanityFilter::new(cfg.sanity.clone()),
            rejects: RejectReporter::new(&cfg.sanity),
            selector,
            crop_cfg: cfg.crop.clone(),
            queue,
            feedback,
            overlay,
            clock,
            metrics,
            det_fps: cfg.detection.det_fps,
            last_seq: 0,
            stale_gate: RateGate::new(STALE_LOG_EVERY_SEC),
        };
        (this, overlay_rx)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs_f64(1.0 / self.det_fps.max(0.1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "✓ Detection loop running at {:.1} fps (stabilization: {:?}, best-crop: {})",
            self.det_fps,
            self.stabilizer.mode(),
            if self.selector.is_some() { "on" } else { "off" }
        );
        if self.roi.is_active() {
            info!("✓ Scene ROI: rect {:?}, {} polygon point(s)", self.roi.rect, self.roi.polygon.len());
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    self.tick(now).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        let discarded = self.selector.as_ref().map(|s| s.pending()).unwrap_or(0);
        info!(
            "Detection loop stopped ({} buffered crop(s) discarded)",
            discarded
        );
    }

    async fn tick(&mut self, now: f64) {
        self.drain_feedback(now);

        let frame = match self.frames.latest() {
            Some((frame, false)) if frame.seq != self.last_seq => frame,
            Some((_, true)) => {
                if self.stale_gate.allow(now) {
                    debug!("Latest frame is stale, detector idle");
                }
                self.release_due(now);
                return;
            }
            _ => {
                self.release_due(now);
                return;
            }
        };
        self.last_seq = frame.seq;

        let mut detections = self.detector.detect(Arc::clone(&frame), now).await;
        let outside = retain_in_roi(&self.roi, &mut detections);
        if outside > 0 {
            self.metrics.add(&self.metrics.roi_filtered, outside as u64);
        }
        self.tracker.update(&detections, now);

        let frame_area = frame.area().max(1.0);
        let mut overlay = Vec::with_capacity(self.tracker.tracks().len());
        // (track id, raw box, confidence, plate text, conf × area)
        let mut best: Option<(u32, [f32; 4], f32, Option<String>, f32)> = None;

        for track in self.tracker.tracks().iter().filter(|t| t.matched_now) {
            if track.hits == 1 {
                self.metrics.inc(&self.metrics.tracks_created);
            }
            let obs = Observation {
                track_id: Some(track.id),
                plate: track.plate_text.as_deref(),
            };
            self.stabilizer.observe(obs, now);
            let stable = self.stabilizer.is_stable(obs, now);

            if stable {
                let score = track.confidence * bbox_area(&track.raw_bbox) / frame_area;
                if best.as_ref().map_or(true, |b| score > b.4) {
                    best = Some((
                        track.id,
                        track.raw_bbox,
                        track.confidence,
                        track.plate_text.clone(),
                        score,
                    ));
                }
            }
            overlay.push(OverlayBox {
                track_id: track.id,
                bbox: track.bbox,
                confidence: track.confidence,
                hits: track.hits,
                stable,
                plate: track.plate_text.clone(),
            });
        }
        self.stabilizer.prune(now);
        self.overlay.send_replace(overlay);

        let Some((track_id, raw_bbox, confidence, plate_hint, _)) = best else {
            self.release_due(now);
            return;
        };
        self.metrics.inc(&self.metrics.stable_candidates);

        let released = match self.make_candidate(&frame, track_id, raw_bbox, confidence, plate_hint, now) {
            Some(candidate) => match self.selector.as_mut() {
                Some(selector) => selector.offer(candidate, now),
                None => vec![candidate],
            },
            None => self.poll_selector(now),
        };
        self.forward(released);
    }

    /// Crop and sanity-check a stable track. None when rejected.
    fn make_candidate(
        &mut self,
        frame: &Frame,
        track_id: u32,
        raw_bbox: [f32; 4],
        confidence: f32,
        plate_hint: Option<String>,
        now: f64,
    ) -> Option<Candidate> {
        let (fw, fh) = frame.image.dimensions();
        let Some(rect) = crop_rect(&raw_bbox, fw, fh, &self.crop_cfg) else {
            debug!("Track {} box leaves no crop inside the frame", track_id);
            return None;
        };
        let crop = crop_image(&frame.image, rect);
        let area_ratio = bbox_area(&raw_bbox) / frame.area().max(1.0);

        let verdict = self.sanity.check(&SanityInput {
            crop_w: rect.width,
            crop_h: rect.height,
            confidence,
            area_ratio,
        });
        if !verdict.passed {
            self.metrics.inc(&self.metrics.sanity_rejects);
            self.rejects.report(
                &verdict,
                track_id,
                &frame.image,
                &raw_bbox,
                &crop,
                now,
                self.clock.wall(now),
            );
            return None;
        }

        Some(Candidate::new(
            track_id,
            crop,
            raw_bbox,
            confidence,
            area_ratio,
            frame.timestamp,
            plate_hint,
        ))
    }

    fn drain_feedback(&mut self, now: f64) {
        while let Ok(fb) = self.feedback.try_recv() {
            debug!(
                "Feedback: track {} read as {} ({:.2})",
                fb.track_id, fb.plate, fb.confidence
            );
            self.tracker.attach_reading(fb.track_id, &fb.plate, fb.confidence);
            self.stabilizer.observe(
                Observation {
                    track_id: None,
                    plate: Some(&fb.plate),
                },
                now,
            );
        }
    }

    fn poll_selector(&mut self, now: f64) -> Vec<Candidate> {
        self.selector
            .as_mut()
            .map(|s| s.poll(now))
            .unwrap_or_default()
    }

    fn release_due(&mut self, now: f64) {
        let released = self.poll_selector(now);
        self.forward(released);
    }

    /// Batches arrive best first; they are queued best last because the
    /// sender takes the newest entry.
    fn forward(&self, candidates: Vec<Candidate>) {
        for c in candidates.into_iter().rev() {
            debug!(
                "Forwarding track {} crop {}x{} (score {:.4})",
                c.track_id,
                c.crop.width(),
                c.crop.height(),
                c.score
            );
            self.metrics.inc(&self.metrics.candidates_forwarded);
            self.queue.push(c);
        }
    }
}
