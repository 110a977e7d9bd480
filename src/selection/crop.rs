// src/selection/crop.rs
//
// Padded crop rectangle around a plate box. Small boxes get a larger pad
// so OCR sees the plate border; a little extra goes on the right where
// region digits tend to be clipped.

use crate::types::CropConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn choose_pad(bbox_w: f32, bbox_h: f32, cfg: &CropConfig) -> f32 {
    let pad = if bbox_w < cfg.pad_small_w as f32 || bbox_h < cfg.pad_small_h as f32 {
        cfg.pad_small
    } else {
        cfg.pad_base
    };
    pad.clamp(0.0, cfg.pad_max)
}

/// Clamp the padded box to the frame. None when nothing is left.
pub fn crop_rect(bbox: &[f32; 4], frame_w: u32, frame_h: u32, cfg: &CropConfig) -> Option<CropRect> {
    let w = bbox[2] - bbox[0];
    let h = bbox[3] - bbox[1];
    if !(w > 0.0 && h > 0.0) {
        return None;
    }

    let pad = choose_pad(w, h, cfg);
    let px = w * pad;
    let py = h * pad;
    let extra_right = w * cfg.pad_right_extra;

    let x1 = (bbox[0] - px).floor().clamp(0.0, frame_w as f32) as u32;
    let y1 = (bbox[1] - py).floor().clamp(0.0, frame_h as f32) as u32;
    let x2 = (bbox[2] + px + extra_right).ceil().clamp(0.0, frame_w as f32) as u32;
    let y2 = (bbox[3] + py).ceil().clamp(0.0, frame_h as f32) as u32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(CropRect {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

pub fn crop_image(image: &image::RgbImage, rect: CropRect) -> image::RgbImage {
    image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image()
}
