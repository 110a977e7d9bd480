// src/detection/roi.rs
//
// Scene restriction applied between the detector and the tracker. A box
// is kept when its centre lies inside the configured rectangle and polygon.

use crate::types::{Detection, RoiConfig};

impl RoiConfig {
    pub fn is_active(&self) -> bool {
        self.rect.is_some() || self.polygon.len() >= 3
    }

    pub fn admits(&self, bbox: &[f32; 4]) -> bool {
        let cx = 0.5 * (bbox[0] + bbox[2]);
        let cy = 0.5 * (bbox[1] + bbox[3]);

        if let Some([x1, y1, x2, y2]) = self.rect {
            if cx < x1 || cx > x2 || cy < y1 || cy > y2 {
                return false;
            }
        }
        self.polygon.len() < 3 || point_in_polygon(cx, cy, &self.polygon)
    }
}

/// Drop detections outside the ROI. Returns how many were dropped.
pub fn retain_in_roi(roi: &RoiConfig, detections: &mut Vec<Detection>) -> usize {
    if !roi.is_active() {
        return 0;
    }
    let before = detections.len();
    detections.retain(|d| roi.admits(&d.bbox));
    before - detections.len()
}

/// Even-odd ray casting.
pub fn point_in_polygon(x: f32, y: f32, poly: &[[f32; 2]]) -> bool {
    if poly.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        let [xi, yi] = poly[i];
        let [xj, yj] = poly[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
