// src/config.rs
//
// YAML config with environment overrides. Everything that can be wrong
// about the configuration is rejected here, before any task starts.

use crate::types::Config;
use anyhow::{bail, Context, Result};
use std::fs;

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
        let mut config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Deployment-specific endpoints may come from the environment instead of the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RTSP_URL") {
            self.camera.rtsp_url = url;
        }
        if let Ok(id) = std::env::var("CAMERA_ID") {
            self.camera.camera_id = id;
        }
        if let Ok(url) = std::env::var("RECOGNITION_URL") {
            self.sender.recognition_url = url;
        }
        if let Ok(url) = std::env::var("PUBLISH_URL") {
            self.events.publish_url = Some(url);
        }
        if let Ok(path) = std::env::var("WHITELIST_PATH") {
            self.gate.whitelist_path = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        if cam.rtsp_url.trim().is_empty() {
            bail!("camera.rtsp_url is empty (set it in the config or RTSP_URL)");
        }
        positive("camera.read_fps", cam.read_fps)?;
        positive("camera.read_timeout_sec", cam.read_timeout_sec)?;
        positive("camera.backoff_initial_sec", cam.backoff_initial_sec)?;
        if cam.backoff_max_sec < cam.backoff_initial_sec {
            bail!(
                "camera.backoff_max_sec ({}) is below backoff_initial_sec ({})",
                cam.backoff_max_sec,
                cam.backoff_initial_sec
            );
        }
        if cam.freeze_enable {
            positive("camera.freeze_max_sec", cam.freeze_max_sec)?;
            if cam.freeze_check_every == 0 {
                bail!("camera.freeze_check_every must be at least 1");
            }
        }
        match (cam.width, cam.height) {
            (Some(0), _) | (_, Some(0)) => bail!("camera.width/height must be non-zero"),
            (Some(_), None) | (None, Some(_)) => {
                bail!("camera.width and camera.height must be set together")
            }
            _ => {}
        }

        let det = &self.detection;
        positive("detection.det_fps", det.det_fps)?;
        positive("detection.timeout_sec", det.timeout_sec)?;
        unit("detection.conf_threshold", det.conf_threshold)?;
        unit("detection.nms_iou", det.nms_iou)?;
        if det.input_size < 32 || det.input_size % 32 != 0 {
            bail!(
                "detection.input_size must be a multiple of 32, got {}",
                det.input_size
            );
        }

        if let Some([x1, y1, x2, y2]) = det.roi.rect {
            if !(x1 >= 0.0 && y1 >= 0.0 && x2 > x1 && y2 > y1) {
                bail!("detection.roi.rect must be [x1, y1, x2, y2] with x2 > x1 >= 0 and y2 > y1 >= 0");
            }
        }
        if !det.roi.polygon.is_empty() && det.roi.polygon.len() < 3 {
            bail!(
                "detection.roi.polygon needs at least 3 points, got {}",
                det.roi.polygon.len()
            );
        }

        let trk = &self.tracking;
        unit("tracking.iou_min", trk.iou_min)?;
        if !(trk.alpha > 0.0 && trk.alpha <= 1.0) {
            bail!("tracking.alpha must be in (0, 1], got {}", trk.alpha);
        }
        positive("tracking.hold_sec", trk.hold_sec)?;

        let stab = &self.stabilization;
        positive("stabilization.window_sec", stab.window_sec)?;
        if stab.min_hits == 0 {
            bail!("stabilization.min_hits must be at least 1");
        }
        unit("stabilization.min_hit_ratio", stab.min_hit_ratio)?;

        let san = &self.sanity;
        if san.enable {
            if san.aspect_min_adaptive > san.aspect_min {
                bail!(
                    "sanity.aspect_min_adaptive ({}) must not exceed sanity.aspect_min ({})",
                    san.aspect_min_adaptive,
                    san.aspect_min
                );
            }
            if san.max_aspect <= san.aspect_min {
                bail!("sanity.max_aspect must exceed sanity.aspect_min");
            }
            unit("sanity.adaptive_conf_min", san.adaptive_conf_min)?;
            unit("sanity.adaptive_area_min", san.adaptive_area_min)?;
        }

        let crop = &self.crop;
        for (name, v) in [
            ("crop.pad_base", crop.pad_base),
            ("crop.pad_small", crop.pad_small),
            ("crop.pad_max", crop.pad_max),
            ("crop.pad_right_extra", crop.pad_right_extra),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!("{} must be in [0, 1], got {}", name, v);
            }
        }

        let bc = &self.best_crop;
        if bc.enable {
            if bc.window_sec < 0.3 {
                bail!("best_crop.window_sec must be at least 0.3, got {}", bc.window_sec);
            }
            if bc.max_send == 0 {
                bail!("best_crop.max_send must be at least 1");
            }
            if bc.max_buffered < bc.max_send {
                bail!("best_crop.max_buffered must be >= best_crop.max_send");
            }
        }

        let snd = &self.sender;
        positive("sender.send_fps", snd.send_fps)?;
        positive("sender.timeout_sec", snd.timeout_sec)?;
        if snd.recognition_url.trim().is_empty() {
            bail!("sender.recognition_url is empty");
        }
        if snd.queue_capacity == 0 || snd.max_in_flight == 0 {
            bail!("sender.queue_capacity and sender.max_in_flight must be at least 1");
        }
        if snd.jpeg_quality == 0 || snd.jpeg_quality > 100 {
            bail!("sender.jpeg_quality must be in 1..=100");
        }
        positive("sender.max_candidate_age_sec", snd.max_candidate_age_sec)?;
        if !(snd.plate_resend_sec.is_finite() && snd.plate_resend_sec >= 0.0) {
            bail!("sender.plate_resend_sec must not be negative");
        }

        let gate = &self.gate;
        unit("gate.min_conf", gate.min_conf)?;
        if gate.confirm_n == 0 {
            bail!("gate.confirm_n must be at least 1");
        }
        positive("gate.confirm_window_sec", gate.confirm_window_sec)?;
        if gate.cooldown_sec < 0.0 || gate.denied_cooldown() < 0.0 {
            bail!("gate cooldowns must not be negative");
        }
        if gate.format_check {
            regex::Regex::new(&gate.plate_pattern)
                .with_context(|| format!("gate.plate_pattern is not a valid regex: {}", gate.plate_pattern))?;
        }

        let ev = &self.events;
        if ev.channel_capacity == 0 {
            bail!("events.channel_capacity must be at least 1");
        }
        positive("events.publish_timeout_sec", ev.publish_timeout_sec)?;
        if !(ev.publish_backoff_sec.is_finite() && ev.publish_backoff_sec >= 0.0) {
            bail!("events.publish_backoff_sec must not be negative");
        }
        positive("status.interval_sec", self.status.interval_sec)?;

        Ok(())
    }
}

fn positive(name: &str, v: f64) -> Result<()> {
    if !(v.is_finite() && v > 0.0) {
        bail!("{} must be positive, got {}", name, v);
    }
    Ok(())
}

fn unit(name: &str, v: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&v) {
        bail!("{} must be in [0, 1], got {}", name, v);
    }
    Ok(())
}
