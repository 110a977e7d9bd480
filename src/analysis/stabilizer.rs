// src/analysis/stabilizer.rs
//
// Decides when a tracked plate has been seen often enough to be worth
// an OCR call. Evidence is counted per track id, per normalized plate
// text, or both, depending on the configured mode.

use crate::types::{StabMode, StabilizationConfig};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use tracing::debug;

// ============================================================================
// HIT WINDOWS
// ============================================================================

/// Hit times for one key inside the sliding window.
#[derive(Debug, Clone, Default)]
pub struct HitRecord {
    hits: VecDeque<f64>,
}

impl HitRecord {
    fn push(&mut self, now: f64, window_sec: f64) {
        self.hits.push_back(now);
        self.trim(now, window_sec);
    }

    fn trim(&mut self, now: f64, window_sec: f64) {
        while let Some(&t) = self.hits.front() {
            if now - t > window_sec {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&self) -> usize {
        self.hits.len()
    }

    pub fn last_hit(&self) -> Option<f64> {
        self.hits.back().copied()
    }
}

/// Absolute-count and duty-cycle thresholds shared by all modes.
#[derive(Debug, Clone, Copy)]
pub struct StabilityRule {
    pub window_sec: f64,
    pub min_hits: u32,
    pub min_hit_ratio: f32,
    /// Detector sampling rate; converts a time span into expected samples
    pub det_fps: f64,
}

impl StabilityRule {
    pub fn from_config(cfg: &StabilizationConfig, det_fps: f64) -> Self {
        Self {
            window_sec: cfg.window_sec,
            min_hits: cfg.min_hits,
            min_hit_ratio: cfg.min_hit_ratio,
            det_fps,
        }
    }

    /// Hits in window divided by the samples the detector took over the same span.
    pub fn hit_ratio(&self, record: &HitRecord, now: f64) -> f32 {
        let in_window: Vec<f64> = record
            .hits
            .iter()
            .copied()
            .filter(|t| now - *t <= self.window_sec)
            .collect();
        let (Some(first), Some(last)) = (in_window.first(), in_window.last()) else {
            return 0.0;
        };
        let span = (last - first).min(self.window_sec);
        let expected = (span * self.det_fps).round() as usize + 1;
        (in_window.len() as f32 / expected as f32).min(1.0)
    }

    pub fn is_met(&self, record: &HitRecord, now: f64) -> bool {
        let hits = record
            .hits
            .iter()
            .filter(|t| now - **t <= self.window_sec)
            .count();
        hits >= self.min_hits as usize && self.hit_ratio(record, now) >= self.min_hit_ratio
    }
}

#[derive(Debug, Default)]
struct HitWindows<K: Eq + Hash> {
    records: HashMap<K, HitRecord>,
}

impl<K: Eq + Hash + Clone> HitWindows<K> {
    fn observe(&mut self, key: &K, now: f64, window_sec: f64) {
        self.records
            .entry(key.clone())
            .or_default()
            .push(now, window_sec);
    }

    fn is_stable(&self, key: &K, rule: &StabilityRule, now: f64) -> bool {
        self.records
            .get(key)
            .map(|r| rule.is_met(r, now))
            .unwrap_or(false)
    }

    fn prune(&mut self, now: f64, window_sec: f64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| r.last_hit().map(|t| now - t <= window_sec).unwrap_or(false));
        before - self.records.len()
    }
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// One observation from the detection loop or OCR feedback.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub track_id: Option<u32>,
    /// Normalized plate text, when known
    pub plate: Option<&'a str>,
}

pub trait StabilityStrategy: Send {
    fn observe(&mut self, obs: Observation<'_>, now: f64);
    fn is_stable(&self, obs: Observation<'_>, now: f64) -> bool;
    fn prune(&mut self, now: f64);
    fn mode(&self) -> StabMode;
}

pub struct TrackStrategy {
    rule: StabilityRule,
    tracks: HitWindows<u32>,
}

impl TrackStrategy {
    pub fn new(rule: StabilityRule) -> Self {
        Self {
            rule,
            tracks: HitWindows::default(),
        }
    }
}

impl StabilityStrategy for TrackStrategy {
    fn observe(&mut self, obs: Observation<'_>, now: f64) {
        if let Some(id) = obs.track_id {
            self.tracks.observe(&id, now, self.rule.window_sec);
        }
    }

    fn is_stable(&self, obs: Observation<'_>, now: f64) -> bool {
        obs.track_id
            .map(|id| self.tracks.is_stable(&id, &self.rule, now))
            .unwrap_or(false)
    }

    fn prune(&mut self, now: f64) {
        let dropped = self.tracks.prune(now, self.rule.window_sec);
        if dropped > 0 {
            debug!("Stabilizer: {} track record(s) expired", dropped);
        }
    }

    fn mode(&self) -> StabMode {
        StabMode::Track
    }
}

/// Counts per plate text. A track whose text is not known yet is judged
/// by its own hits so the first OCR call can still happen.
pub struct PlateStrategy {
    rule: StabilityRule,
    plates: HitWindows<String>,
    fallback: TrackStrategy,
}

impl PlateStrategy {
    pub fn new(rule: StabilityRule) -> Self {
        Self {
            rule,
            plates: HitWindows::default(),
            fallback: TrackStrategy::new(rule),
        }
    }
}

impl StabilityStrategy for PlateStrategy {
    fn observe(&mut self, obs: Observation<'_>, now: f64) {
        if let Some(plate) = obs.plate.filter(|p| !p.is_empty()) {
            self.plates
                .observe(&plate.to_string(), now, self.rule.window_sec);
        }
        self.fallback.observe(obs, now);
    }

    fn is_stable(&self, obs: Observation<'_>, now: f64) -> bool {
        match obs.plate.filter(|p| !p.is_empty()) {
            Some(plate) => self.plates.is_stable(&plate.to_string(), &self.rule, now),
            None => self.fallback.is_stable(obs, now),
        }
    }

    fn prune(&mut self, now: f64) {
        let dropped = self.plates.prune(now, self.rule.window_sec);
        if dropped > 0 {
            debug!("Stabilizer: {} plate record(s) expired", dropped);
        }
        self.fallback.prune(now);
    }

    fn mode(&self) -> StabMode {
        StabMode::Plate
    }
}

pub struct HybridStrategy {
    track: TrackStrategy,
    plate: PlateStrategy,
}

impl HybridStrategy {
    pub fn new(rule: StabilityRule) -> Self {
        Self {
            track: TrackStrategy::new(rule),
            plate: PlateStrategy::new(rule),
        }
    }
}

impl StabilityStrategy for HybridStrategy {
    fn observe(&mut self, obs: Observation<'_>, now: f64) {
        self.track.observe(obs, now);
        self.plate.observe(obs, now);
    }

    fn is_stable(&self, obs: Observation<'_>, now: f64) -> bool {
        self.track.is_stable(obs, now) || self.plate.is_stable(obs, now)
    }

    fn prune(&mut self, now: f64) {
        self.track.prune(now);
        self.plate.prune(now);
    }

    fn mode(&self) -> StabMode {
        StabMode::Hybrid
    }
}

pub fn build_strategy(cfg: &StabilizationConfig, det_fps: f64) -> Box<dyn StabilityStrategy> {
    let rule = StabilityRule::from_config(cfg, det_fps);
    match cfg.mode {
        StabMode::Track => Box::new(TrackStrategy::new(rule)),
        StabMode::Plate => Box::new(PlateStrategy::new(rule)),
        StabMode::Hybrid => Box::new(HybridStrategy::new(rule)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(min_hits: u32, min_ratio: f32) -> StabilityRule {
        StabilityRule {
            window_sec: 1.5,
            min_hits,
            min_hit_ratio: min_ratio,
            det_fps: 2.0,
        }
    }

    fn track(id: u32) -> Observation<'static> {
        Observation {
            track_id: Some(id),
            plate: None,
        }
    }

    fn plate(id: u32, text: &'static str) -> Observation<'static> {
        Observation {
            track_id: Some(id),
            plate: Some(text),
        }
    }

    #[test]
    fn test_exactly_min_hits_is_stable() {
        let mut s = TrackStrategy::new(rule(3, 0.5));
        s.observe(track(1), 0.0);
        s.observe(track(1), 0.5);
        assert!(!s.is_stable(track(1), 0.5));
        s.observe(track(1), 1.0);
        assert!(s.is_stable(track(1), 1.0));
    }

    #[test]
    fn test_hits_outside_window_do_not_count() {
        let mut s = TrackStrategy::new(rule(2, 0.0));
        s.observe(track(1), 0.0);
        s.observe(track(1), 2.0);
        assert!(!s.is_stable(track(1), 2.0));
    }

    #[test]
    fn test_low_duty_cycle_not_stable() {
        let r = rule(2, 0.6);
        let mut s = TrackStrategy::new(r);
        // Two hits 1.5s apart at 2 fps: 2 of 4 expected samples
        s.observe(track(1), 0.0);
        s.observe(track(1), 1.5);
        assert!(!s.is_stable(track(1), 1.5));

        let mut dense = TrackStrategy::new(r);
        dense.observe(track(2), 1.0);
        dense.observe(track(2), 1.5);
        assert!(dense.is_stable(track(2), 1.5));
    }

    #[test]
    fn test_plate_mode_survives_track_churn() {
        let mut s = PlateStrategy::new(rule(2, 0.5));
        s.observe(plate(1, "А123ВС77"), 0.0);
        // Tracker lost the plate and re-created it under a new id
        s.observe(plate(7, "А123ВС77"), 0.5);
        assert!(s.is_stable(plate(7, "А123ВС77"), 0.5));

        let mut t = TrackStrategy::new(rule(2, 0.5));
        t.observe(track(1), 0.0);
        t.observe(track(7), 0.5);
        assert!(!t.is_stable(track(7), 0.5));
    }

    #[test]
    fn test_plate_mode_falls_back_to_track_without_text() {
        let mut s = PlateStrategy::new(rule(2, 0.5));
        s.observe(track(3), 0.0);
        s.observe(track(3), 0.5);
        assert!(s.is_stable(track(3), 0.5));
    }

    #[test]
    fn test_hybrid_is_either() {
        let mut s = HybridStrategy::new(rule(2, 0.5));
        s.observe(plate(1, "В777ОР99"), 0.0);
        s.observe(plate(2, "В777ОР99"), 0.5);
        // Track 2 has one hit, the plate has two
        assert!(s.is_stable(plate(2, "В777ОР99"), 0.5));
        assert!(!s.is_stable(track(2), 0.5));
    }

    #[test]
    fn test_prune_expires_records() {
        let mut s = TrackStrategy::new(rule(1, 0.0));
        s.observe(track(1), 0.0);
        s.prune(1.0);
        assert!(s.is_stable(track(1), 1.0));
        s.prune(2.0);
        assert!(s.tracks.records.get(&1).is_none());
    }

    #[test]
    fn test_build_strategy_mode() {
        let mut cfg = StabilizationConfig::default();
        cfg.mode = StabMode::Plate;
        assert_eq!(build_strategy(&cfg, 2.0).mode(), StabMode::Plate);
        cfg.mode = StabMode::Track;
        assert_eq!(build_strategy(&cfg, 2.0).mode(), StabMode::Track);
    }
}
