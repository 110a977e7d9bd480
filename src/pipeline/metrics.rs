// src/pipeline/metrics.rs
//
// Pipeline counters. Cheap to clone; every task holds its own handle.
// Exported through the status snapshot and a periodic summary log line.

use crate::gate::events::EventStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames_read: Arc<AtomicU64>,
    pub detector_runs: Arc<AtomicU64>,
    pub detections: Arc<AtomicU64>,
    pub detector_errors: Arc<AtomicU64>,
    pub roi_filtered: Arc<AtomicU64>,
    pub tracks_created: Arc<AtomicU64>,
    pub stable_candidates: Arc<AtomicU64>,
    pub sanity_rejects: Arc<AtomicU64>,
    pub candidates_forwarded: Arc<AtomicU64>,
    pub queue_dropped: Arc<AtomicU64>,
    pub queue_stale: Arc<AtomicU64>,
    pub resend_skipped: Arc<AtomicU64>,
    pub ocr_requests: Arc<AtomicU64>,
    pub ocr_failures: Arc<AtomicU64>,
    pub events_sent: Arc<AtomicU64>,
    pub events_denied: Arc<AtomicU64>,
    pub events_invalid: Arc<AtomicU64>,
    pub events_cooldown: Arc<AtomicU64>,
    pub detector_time_us: Arc<AtomicU64>,
    pub ocr_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_read: Arc::new(AtomicU64::new(0)),
            detector_runs: Arc::new(AtomicU64::new(0)),
            detections: Arc::new(AtomicU64::new(0)),
            detector_errors: Arc::new(AtomicU64::new(0)),
            roi_filtered: Arc::new(AtomicU64::new(0)),
            tracks_created: Arc::new(AtomicU64::new(0)),
            stable_candidates: Arc::new(AtomicU64::new(0)),
            sanity_rejects: Arc::new(AtomicU64::new(0)),
            candidates_forwarded: Arc::new(AtomicU64::new(0)),
            queue_dropped: Arc::new(AtomicU64::new(0)),
            queue_stale: Arc::new(AtomicU64::new(0)),
            resend_skipped: Arc::new(AtomicU64::new(0)),
            ocr_requests: Arc::new(AtomicU64::new(0)),
            ocr_failures: Arc::new(AtomicU64::new(0)),
            events_sent: Arc::new(AtomicU64::new(0)),
            events_denied: Arc::new(AtomicU64::new(0)),
            events_invalid: Arc::new(AtomicU64::new(0)),
            events_cooldown: Arc::new(AtomicU64::new(0)),
            detector_time_us: Arc::new(AtomicU64::new(0)),
            ocr_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Last observed duration, not an average.
    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn record_event(&self, status: EventStatus) {
        let counter = match status {
            EventStatus::Sent => &self.events_sent,
            EventStatus::Denied => &self.events_denied,
            EventStatus::Invalid => &self.events_invalid,
            EventStatus::Cooldown => &self.events_cooldown,
        };
        self.inc(counter);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.frames_read.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            fps: self.fps(),
            detector_runs: self.detector_runs.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            detector_errors: self.detector_errors.load(Ordering::Relaxed),
            roi_filtered: self.roi_filtered.load(Ordering::Relaxed),
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            stable_candidates: self.stable_candidates.load(Ordering::Relaxed),
            sanity_rejects: self.sanity_rejects.load(Ordering::Relaxed),
            candidates_forwarded: self.candidates_forwarded.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            queue_stale: self.queue_stale.load(Ordering::Relaxed),
            resend_skipped: self.resend_skipped.load(Ordering::Relaxed),
            ocr_requests: self.ocr_requests.load(Ordering::Relaxed),
            ocr_failures: self.ocr_failures.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_denied: self.events_denied.load(Ordering::Relaxed),
            events_invalid: self.events_invalid.load(Ordering::Relaxed),
            events_cooldown: self.events_cooldown.load(Ordering::Relaxed),
            last_detector_us: self.detector_time_us.load(Ordering::Relaxed),
            last_ocr_us: self.ocr_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_read: u64,
    pub fps: f64,
    pub detector_runs: u64,
    pub detections: u64,
    pub detector_errors: u64,
    pub roi_filtered: u64,
    pub tracks_created: u64,
    pub stable_candidates: u64,
    pub sanity_rejects: u64,
    pub candidates_forwarded: u64,
    pub queue_dropped: u64,
    pub queue_stale: u64,
    pub resend_skipped: u64,
    pub ocr_requests: u64,
    pub ocr_failures: u64,
    pub events_sent: u64,
    pub events_denied: u64,
    pub events_invalid: u64,
    pub events_cooldown: u64,
    pub last_detector_us: u64,
    pub last_ocr_us: u64,
    pub elapsed_secs: f64,
}

impl MetricsSummary {
    pub fn log_line(&self) -> String {
        format!(
            "frames={} ({:.1} fps) det_runs={} det_err={} stable={} sanity_rej={} fwd={} dropped={} stale={} resend_skip={} ocr={} ocr_fail={} sent={} denied={} invalid={} cooldown={}",
            self.frames_read,
            self.fps,
            self.detector_runs,
            self.detector_errors,
            self.stable_candidates,
            self.sanity_rejects,
            self.candidates_forwarded,
            self.queue_dropped,
            self.queue_stale,
            self.resend_skipped,
            self.ocr_requests,
            self.ocr_failures,
            self.events_sent,
            self.events_denied,
            self.events_invalid,
            self.events_cooldown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let m = PipelineMetrics::new();
        let other = m.clone();
        other.inc(&other.detector_errors);
        m.add(&m.detections, 3);
        m.record_event(EventStatus::Cooldown);

        let s = m.summary();
        assert_eq!(s.detector_errors, 1);
        assert_eq!(s.detections, 3);
        assert_eq!(s.events_cooldown, 1);
        assert_eq!(s.events_sent, 0);
        assert!(s.log_line().contains("cooldown=1"));
    }
}
