// src/selection/reject_dump.rs
//
// Sanity-reject diagnostics. The numeric log line and the JPEG dump each
// sit behind their own RateGate so a burst of junk boxes cannot flood
// either the log or the disk.

use crate::pipeline::rate_gate::RateGate;
use crate::selection::sanity::SanityVerdict;
use crate::types::SanityConfig;
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What one `report` call actually did.
#[derive(Debug, Default)]
pub struct RejectReport {
    pub logged: bool,
    /// Pending JPEG write, when a dump was due
    pub dump: Option<tokio::task::JoinHandle<()>>,
}

pub struct RejectReporter {
    log_gate: RateGate,
    dump_gate: RateGate,
    dump_enable: bool,
    dump_dir: PathBuf,
}

impl RejectReporter {
    pub fn new(cfg: &SanityConfig) -> Self {
        Self {
            log_gate: RateGate::new(cfg.log_every_sec),
            dump_gate: RateGate::new(cfg.dump_every_sec),
            dump_enable: cfg.dump_enable,
            dump_dir: PathBuf::from(&cfg.dump_dir),
        }
    }

    /// `now` drives the rate gates; `wall` names the dumped files.
    pub fn report(
        &mut self,
        verdict: &SanityVerdict,
        track_id: u32,
        frame: &RgbImage,
        bbox: &[f32; 4],
        crop: &RgbImage,
        now: f64,
        wall: f64,
    ) -> RejectReport {
        let mut report = RejectReport::default();
        if self.log_gate.allow(now) {
            report.logged = true;
            let skipped = self.log_gate.take_suppressed();
            info!(
                "🚫 Sanity reject track={} rule={} aspect={:.2} thr={:.2} area_ratio={:.4} conf={:.2} (+{} suppressed)",
                track_id,
                verdict.rule.as_str(),
                verdict.aspect,
                verdict.threshold,
                verdict.area_ratio,
                verdict.confidence,
                skipped,
            );
        }

        if !self.dump_enable || !self.dump_gate.allow(now) {
            return report;
        }

        let ms = (wall * 1000.0) as u64;
        let dir = self.dump_dir.clone();
        let mut vis = frame.clone();
        draw_box(&mut vis, bbox);
        let crop = crop.clone();

        // Full-frame JPEG encode stays off the detection loop.
        report.dump = Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = write_dump(&dir, ms, &vis, &crop) {
                warn!("Failed to write sanity dump: {:#}", e);
            }
        }));
        report
    }
}

fn draw_box(img: &mut RgbImage, bbox: &[f32; 4]) {
    let x = bbox[0].max(0.0) as i32;
    let y = bbox[1].max(0.0) as i32;
    let w = (bbox[2] - bbox[0]).max(1.0) as u32;
    let h = (bbox[3] - bbox[1]).max(1.0) as u32;
    let red = Rgb([255u8, 0, 0]);
    // 3 px outline
    for inset in 0..3i32 {
        let (iw, ih) = (w.saturating_sub(2 * inset as u32), h.saturating_sub(2 * inset as u32));
        if iw == 0 || ih == 0 {
            break;
        }
        draw_hollow_rect_mut(img, Rect::at(x + inset, y + inset).of_size(iw, ih), red);
    }
}

pub fn write_dump(dir: &Path, ms: u64, vis: &RgbImage, crop: &RgbImage) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let frame_path = dir.join(format!("unsane_frame_vis_{}.jpg", ms));
    vis.save(&frame_path)
        .with_context(|| format!("Failed to save {}", frame_path.display()))?;

    let crop_path = dir.join(format!("unsane_crop_{}.jpg", ms));
    crop.save(&crop_path)
        .with_context(|| format!("Failed to save {}", crop_path.display()))?;

    debug!("Sanity dump written: {}", frame_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::sanity::SanityRule;

    fn verdict() -> SanityVerdict {
        SanityVerdict {
            passed: false,
            rule: SanityRule::Base,
            aspect: 1.2,
            threshold: 1.8,
            area_ratio: 0.004,
            confidence: 0.6,
        }
    }

    #[test]
    fn test_write_dump_creates_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sanity");
        let mut vis = RgbImage::new(64, 48);
        draw_box(&mut vis, &[8.0, 8.0, 40.0, 20.0]);
        assert_eq!(vis.get_pixel(8, 8), &Rgb([255, 0, 0]));

        write_dump(&sub, 1234, &vis, &RgbImage::new(32, 12)).unwrap();
        assert!(sub.join("unsane_frame_vis_1234.jpg").exists());
        assert!(sub.join("unsane_crop_1234.jpg").exists());
    }

    #[tokio::test]
    async fn test_report_rate_limits_log_and_dump() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SanityConfig {
            dump_enable: true,
            dump_dir: dir.path().to_string_lossy().into_owned(),
            dump_every_sec: 3.0,
            log_every_sec: 1.0,
            ..SanityConfig::default()
        };
        let mut reporter = RejectReporter::new(&cfg);
        let frame = RgbImage::new(64, 48);
        let crop = RgbImage::new(32, 12);
        let bbox = [8.0, 8.0, 40.0, 20.0];

        let first = reporter.report(&verdict(), 1, &frame, &bbox, &crop, 10.0, 1000.0);
        let second = reporter.report(&verdict(), 1, &frame, &bbox, &crop, 10.5, 1000.5);
        assert!(first.logged);
        assert!(!second.logged);
        assert!(second.dump.is_none());
        first.dump.unwrap().await.unwrap();

        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 2, "one frame and one crop from a single dump");

        // Log gate reopens before the dump gate does
        let third = reporter.report(&verdict(), 1, &frame, &bbox, &crop, 11.2, 1001.2);
        assert!(third.logged);
        assert!(third.dump.is_none());
    }
}
