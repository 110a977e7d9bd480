// src/capture/watchdog.rs
//
// Stream health helpers: freeze detection on decoded frames and the
// reconnect backoff schedule.

use image::{imageops, GrayImage, RgbImage};
use std::time::Duration;

const THUMB_W: u32 = 160;
const THUMB_H: u32 = 120;

/// Flags a stream whose picture stops changing. Some cameras keep sending
/// the last frame after the sensor pipeline hangs; the connection looks
/// healthy but the content is frozen.
pub struct FreezeWatchdog {
    enabled: bool,
    max_sec: f64,
    diff_threshold: f32,
    check_every: u32,
    counter: u32,
    prev: Option<GrayImage>,
    last_change: Option<f64>,
}

impl FreezeWatchdog {
    pub fn new(enabled: bool, max_sec: f64, diff_threshold: f32, check_every: u32) -> Self {
        Self {
            enabled,
            max_sec,
            diff_threshold,
            check_every: check_every.max(1),
            counter: 0,
            prev: None,
            last_change: None,
        }
    }

    /// Feed a frame; true once nothing visibly changed for `max_sec`.
    pub fn observe(&mut self, frame: &RgbImage, now: f64) -> bool {
        if !self.enabled {
            return false;
        }
        if self.last_change.is_none() {
            self.last_change = Some(now);
        }

        self.counter += 1;
        if self.counter >= self.check_every {
            self.counter = 0;
            let thumb = thumbnail(frame);
            if let Some(prev) = &self.prev {
                if mean_abs_diff(prev, &thumb) > self.diff_threshold {
                    self.last_change = Some(now);
                }
            }
            self.prev = Some(thumb);
        }

        self.is_frozen(now)
    }

    pub fn is_frozen(&self, now: f64) -> bool {
        self.enabled
            && self
                .last_change
                .map(|t| now - t > self.max_sec)
                .unwrap_or(false)
    }

    /// Forget history after a reconnect.
    pub fn reset(&mut self) {
        self.counter = 0;
        self.prev = None;
        self.last_change = None;
    }
}

fn thumbnail(frame: &RgbImage) -> GrayImage {
    let small = imageops::resize(frame, THUMB_W, THUMB_H, imageops::FilterType::Nearest);
    imageops::grayscale(&small)
}

/// Mean absolute difference of two equally sized gray images (0-255).
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f32 {
    let n = a.as_raw().len().min(b.as_raw().len());
    if n == 0 {
        return 0.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    total as f32 / n as f32
}

/// Bounded exponential backoff: initial, 2x, 4x ... capped at max.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: f64,
    max: f64,
    current: f64,
}

impl Backoff {
    pub fn new(initial_sec: f64, max_sec: f64) -> Self {
        Self {
            initial: initial_sec,
            max: max_sec.max(initial_sec),
            current: initial_sec,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2.0).min(self.max);
        Duration::from_secs_f64(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
