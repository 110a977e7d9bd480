// src/analysis/plate_tracker.rs
//
// IoU tracker for plate boxes across sampled frames.
//
// Design:
//   - Greedy global IoU matching (few plates per frame)
//   - EMA-smoothed box, raw box kept alongside
//   - Tracks coast through short detection gaps for `hold_sec`
//   - Best OCR reading attached back onto the track that produced it

use crate::types::{iou, Detection, TrackingConfig};
use serde::Serialize;
use tracing::debug;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: u32,
    /// EMA-smoothed box
    pub bbox: [f32; 4],
    /// Last matched detection box
    pub raw_bbox: [f32; 4],
    pub confidence: f32,
    pub hits: u32,
    pub created_at: f64,
    pub last_matched_at: f64,
    pub plate_text: Option<String>,
    pub plate_conf: f32,
    /// Matched during the most recent `update`
    pub matched_now: bool,
}

impl Track {
    fn new(id: u32, det: &Detection, now: f64) -> Self {
        Self {
            id,
            bbox: det.bbox,
            raw_bbox: det.bbox,
            confidence: det.confidence,
            hits: 1,
            created_at: now,
            last_matched_at: now,
            plate_text: None,
            plate_conf: 0.0,
            matched_now: true,
        }
    }

    fn update_with_detection(&mut self, det: &Detection, alpha: f32, now: f64) {
        for i in 0..4 {
            self.bbox[i] = alpha * det.bbox[i] + (1.0 - alpha) * self.bbox[i];
        }
        self.raw_bbox = det.bbox;
        self.confidence = det.confidence;
        self.hits += 1;
        self.last_matched_at = now;
        self.matched_now = true;
    }

    pub fn unmatched_for(&self, now: f64) -> f64 {
        now - self.last_matched_at
    }
}

// ============================================================================
// TRACKER
// ============================================================================

pub struct PlateTracker {
    config: TrackingConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl PlateTracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Associate one detector pass with live tracks. Returns the surviving tracks.
    pub fn update(&mut self, detections: &[Detection], now: f64) -> &[Track] {
        let hold = self.config.hold_sec;
        self.tracks.retain(|t| {
            let keep = t.unmatched_for(now) <= hold;
            if !keep {
                debug!("Track {} expired after {} hits", t.id, t.hits);
            }
            keep
        });
        for t in &mut self.tracks {
            t.matched_now = false;
        }

        // Every (track, detection) pair above threshold, best IoU first.
        // Ties resolve by track then detection order so results are reproducible.
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let score = iou(&track.bbox, &det.bbox);
                if score >= self.config.iou_min {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.2.total_cmp(&a.2)
                .then(a.0.cmp(&b.0))
                .then(a.1.cmp(&b.1))
        });

        let mut track_used = vec![false; self.tracks.len()];
        let mut det_used = vec![false; detections.len()];

        for (ti, di, score) in pairs {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            self.tracks[ti].update_with_detection(&detections[di], self.config.alpha, now);
            debug!(
                "Track {} matched (iou={:.2}, hits={})",
                self.tracks[ti].id, score, self.tracks[ti].hits
            );
        }

        for (di, det) in detections.iter().enumerate() {
            if det_used[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            debug!("Track {} created (conf={:.2})", id, det.confidence);
            self.tracks.push(Track::new(id, det, now));
        }

        &self.tracks
    }

    /// Record an OCR reading for a track; keeps the most confident text.
    pub fn attach_reading(&mut self, track_id: u32, text: &str, confidence: f32) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.id == track_id) {
            if t.plate_text.is_none() || confidence >= t.plate_conf {
                t.plate_text = Some(text.to_string());
                t.plate_conf = confidence;
            }
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[cfg(test)]
    pub fn get(&self, track_id: u32) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == track_id)
    }
}
