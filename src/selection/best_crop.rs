// src/selection/best_crop.rs
//
// Short buffering window that forwards only the best-scoring crops of a
// vehicle pass instead of every frame.
//
//   score = confidence × area_ratio × sharpness
//
// The window opens on the first candidate and closes `window_sec` later,
// or as soon as `max_buffered` candidates are waiting. `poll` closes an
// overdue window even when the detector has gone quiet.

use crate::types::BestCropConfig;
use image::{GrayImage, RgbImage};
use tracing::debug;

const SHARPNESS_MIN: f32 = 1.0;
const SHARPNESS_MAX: f32 = 1000.0;

#[derive(Debug, Clone)]
pub struct Candidate {
    pub track_id: u32,
    pub crop: RgbImage,
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub area_ratio: f32,
    pub sharpness: f32,
    pub score: f32,
    /// Monotonic timestamp of the source frame
    pub frame_ts: f64,
    /// Best OCR text already known for the track
    pub plate_hint: Option<String>,
}

impl Candidate {
    pub fn new(
        track_id: u32,
        crop: RgbImage,
        bbox: [f32; 4],
        confidence: f32,
        area_ratio: f32,
        frame_ts: f64,
        plate_hint: Option<String>,
    ) -> Self {
        let sharpness = laplacian_variance(&image::imageops::grayscale(&crop))
            .clamp(SHARPNESS_MIN, SHARPNESS_MAX);
        let score = confidence * area_ratio * sharpness;
        Self {
            track_id,
            crop,
            bbox,
            confidence,
            area_ratio,
            sharpness,
            score,
            frame_ts,
            plate_hint,
        }
    }
}

/// Variance of the 4-neighbour Laplacian response over the interior pixels.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0.0f64;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }

    let mean = sum / n;
    ((sum_sq / n) - mean * mean).max(0.0) as f32
}

pub struct BestCropSelector {
    cfg: BestCropConfig,
    window_started: Option<f64>,
    buffer: Vec<Candidate>,
}

impl BestCropSelector {
    pub fn new(cfg: BestCropConfig) -> Self {
        let cap = cfg.max_buffered;
        Self {
            cfg,
            window_started: None,
            buffer: Vec::with_capacity(cap),
        }
    }

    /// Buffer a candidate. Returns whatever the window released as a result.
    pub fn offer(&mut self, candidate: Candidate, now: f64) -> Vec<Candidate> {
        let mut released = self.poll(now);

        if self.window_started.is_none() {
            self.window_started = Some(now);
            debug!("Best-crop window opened by track {}", candidate.track_id);
        }
        self.buffer.push(candidate);

        if self.buffer.len() >= self.cfg.max_buffered {
            released.extend(self.close("full"));
        }
        released
    }

    /// Close the window if it is overdue.
    pub fn poll(&mut self, now: f64) -> Vec<Candidate> {
        match self.window_started {
            Some(start) if now - start >= self.cfg.window_sec => self.close("timeout"),
            _ => Vec::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn close(&mut self, why: &str) -> Vec<Candidate> {
        self.window_started = None;
        let mut batch = std::mem::take(&mut self.buffer);
        if batch.is_empty() {
            return batch;
        }
        let buffered = batch.len();
        batch.sort_by(|a, b| b.score.total_cmp(&a.score));
        batch.truncate(self.cfg.max_send);
        debug!(
            "Best-crop window closed ({}): {} buffered, forwarding {} (top score {:.4})",
            why,
            buffered,
            batch.len(),
            batch[0].score
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn cand(track_id: u32, score: f32) -> Candidate {
        Candidate {
            track_id,
            crop: RgbImage::new(4, 2),
            bbox: [0.0, 0.0, 4.0, 2.0],
            confidence: 0.9,
            area_ratio: 0.01,
            sharpness: 1.0,
            score,
            frame_ts: 0.0,
            plate_hint: None,
        }
    }

    fn selector(max_send: usize) -> BestCropSelector {
        BestCropSelector::new(BestCropConfig {
            enable: true,
            window_sec: 1.5,
            max_send,
            max_buffered: 8,
        })
    }

    #[test]
    fn test_forwards_only_best_of_window() {
        let mut s = selector(1);
        assert!(s.offer(cand(1, 0.42), 0.0).is_empty());
        assert!(s.offer(cand(2, 0.55), 0.5).is_empty());
        assert!(s.offer(cand(3, 0.30), 1.0).is_empty());

        let out = s.poll(1.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 2);
        assert!((out[0].score - 0.55).abs() < 1e-6);
        assert_eq!(s.pending(), 0);
    }

    #[test]
    fn test_top_n_in_score_order() {
        let mut s = selector(2);
        s.offer(cand(1, 0.1), 0.0);
        s.offer(cand(2, 0.9), 0.1);
        s.offer(cand(3, 0.5), 0.2);
        let out = s.poll(2.0);
        let ids: Vec<u32> = out.iter().map(|c| c.track_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_window_closes_without_new_candidates() {
        let mut s = selector(1);
        s.offer(cand(1, 0.2), 10.0);
        assert!(s.poll(11.0).is_empty());
        assert_eq!(s.poll(11.6).len(), 1);
        assert!(s.poll(20.0).is_empty());
    }

    #[test]
    fn test_late_candidate_starts_new_window() {
        let mut s = selector(1);
        s.offer(cand(1, 0.2), 0.0);
        let out = s.offer(cand(2, 0.9), 3.0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 1);
        assert_eq!(s.pending(), 1);
    }

    #[test]
    fn test_full_buffer_closes_early() {
        let mut s = BestCropSelector::new(BestCropConfig {
            enable: true,
            window_sec: 10.0,
            max_send: 1,
            max_buffered: 3,
        });
        s.offer(cand(1, 0.1), 0.0);
        s.offer(cand(2, 0.3), 0.1);
        let out = s.offer(cand(3, 0.2), 0.2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id, 2);
    }

    #[test]
    fn test_sharpness_flat_vs_edges() {
        let flat = GrayImage::from_pixel(16, 16, Luma([128]));
        assert_eq!(laplacian_variance(&flat), 0.0);

        let stripes = GrayImage::from_fn(16, 16, |x, _| Luma([if x % 2 == 0 { 0 } else { 255 }]));
        assert!(laplacian_variance(&stripes) > 1000.0);
    }

    #[test]
    fn test_candidate_score_uses_clamped_sharpness() {
        let c = Candidate::new(1, RgbImage::new(16, 8), [0.0; 4], 0.8, 0.02, 0.0, None);
        assert_eq!(c.sharpness, 1.0);
        assert!((c.score - 0.016).abs() < 1e-6);
    }
}
