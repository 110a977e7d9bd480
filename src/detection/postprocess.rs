// src/detection/postprocess.rs
//
// Model-agnostic parts of plate detection: letterbox in, box decoding and
// NMS out. Kept free of the ONNX session so they can be tested directly.

use crate::types::{bbox_area, iou, Detection};
use anyhow::{bail, Result};
use image::{imageops, Rgb, RgbImage};

const PAD_VALUE: u8 = 114;

/// How a frame was fitted into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Model-input coordinates back to frame pixels.
    pub fn unmap(&self, b: [f32; 4]) -> [f32; 4] {
        [
            (b[0] - self.pad_x) / self.scale,
            (b[1] - self.pad_y) / self.scale,
            (b[2] - self.pad_x) / self.scale,
            (b[3] - self.pad_y) / self.scale,
        ]
    }
}

/// Resize keeping aspect ratio, center on a gray square canvas, normalize
/// to [0, 1] and lay out as CHW.
pub fn letterbox(src: &RgbImage, size: usize) -> (Vec<f32>, Letterbox) {
    let (src_w, src_h) = (src.width() as f32, src.height() as f32);
    let scale = (size as f32 / src_w).min(size as f32 / src_h);
    let scaled_w = ((src_w * scale) as u32).clamp(1, size as u32);
    let scaled_h = ((src_h * scale) as u32).clamp(1, size as u32);

    let pad_x = (size as u32 - scaled_w) / 2;
    let pad_y = (size as u32 - scaled_h) / 2;

    let resized = imageops::resize(src, scaled_w, scaled_h, imageops::FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size as u32, size as u32, Rgb([PAD_VALUE; 3]));
    imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let plane = size * size;
    let mut input = vec![0.0f32; 3 * plane];
    for (i, px) in canvas.pixels().enumerate() {
        input[i] = px[0] as f32 / 255.0;
        input[plane + i] = px[1] as f32 / 255.0;
        input[2 * plane + i] = px[2] as f32 / 255.0;
    }

    (
        input,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Decode either output layout:
///   end-to-end  `[1, N, 6]`      rows of x1, y1, x2, y2, score, class
///   raw YOLO    `[1, 4+C, A]`    columns of cx, cy, w, h, class scores...
///
/// Boxes below `min_conf` are dropped; the rest are mapped back to frame
/// pixels and clamped to the frame.
pub fn decode_output(
    dims: &[i64],
    data: &[f32],
    lb: &Letterbox,
    min_conf: f32,
    frame_w: f32,
    frame_h: f32,
) -> Result<Vec<Detection>> {
    if dims.len() != 3 || dims[0] != 1 {
        bail!("Unexpected detector output shape {:?}", dims);
    }
    let (d1, d2) = (dims[1] as usize, dims[2] as usize);
    if data.len() < d1 * d2 {
        bail!("Detector output holds {} values, shape {:?} needs {}", data.len(), dims, d1 * d2);
    }

    let mut out = Vec::new();
    if d2 == 6 && d1 != 6 {
        for row in data.chunks_exact(6).take(d1) {
            let score = row[4];
            if score < min_conf {
                continue;
            }
            let class_id = if row[5] >= 0.0 { Some(row[5] as usize) } else { None };
            out.push(Detection {
                bbox: [row[0], row[1], row[2], row[3]],
                confidence: score,
                class_id,
            });
        }
    } else if d1 >= 5 {
        let anchors = d2;
        let classes = d1 - 4;
        for i in 0..anchors {
            let (mut best, mut best_class) = (0.0f32, 0usize);
            for c in 0..classes {
                let conf = data[anchors * (4 + c) + i];
                if conf > best {
                    best = conf;
                    best_class = c;
                }
            }
            if best < min_conf {
                continue;
            }
            let (cx, cy) = (data[i], data[anchors + i]);
            let (w, h) = (data[anchors * 2 + i], data[anchors * 3 + i]);
            out.push(Detection {
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                confidence: best,
                class_id: Some(best_class),
            });
        }
    } else {
        bail!("Unsupported detector output shape {:?}", dims);
    }

    for det in out.iter_mut() {
        let b = lb.unmap(det.bbox);
        det.bbox = [
            b[0].clamp(0.0, frame_w),
            b[1].clamp(0.0, frame_h),
            b[2].clamp(0.0, frame_w),
            b[3].clamp(0.0, frame_h),
        ];
    }
    out.retain(|d| bbox_area(&d.bbox) > 0.0);
    Ok(out)
}

/// Greedy non-max suppression, highest confidence first.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(&k.bbox, &det.bbox) < iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

pub fn threshold_and_nms(detections: Vec<Detection>, conf: f32, iou_threshold: f32) -> Vec<Detection> {
    let passed: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.confidence >= conf)
        .collect();
    nms(passed, iou_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], confidence: f32) -> Detection {
        Detection {
            bbox,
            confidence,
            class_id: None,
        }
    }

    #[test]
    fn test_letterbox_wide_frame() {
        let img = RgbImage::from_pixel(1280, 720, Rgb([255, 0, 0]));
        let (input, lb) = letterbox(&img, 640);

        assert_eq!(input.len(), 3 * 640 * 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        // top-left is padding, center is the red frame
        assert!((input[0] - 114.0 / 255.0).abs() < 1e-6);
        let center = 320 * 640 + 320;
        assert!((input[center] - 1.0).abs() < 0.01);
        assert!(input[640 * 640 + center].abs() < 0.01);
    }

    #[test]
    fn test_unmap_inverts_letterbox() {
        let lb = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 140.0,
        };
        assert_eq!(lb.unmap([100.0, 190.0, 200.0, 240.0]), [200.0, 100.0, 400.0, 200.0]);
    }

    #[test]
    fn test_decode_end_to_end_layout() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let data = vec![
            10.0, 10.0, 110.0, 40.0, 0.9, 0.0, //
            0.0, 0.0, 5.0, 5.0, 0.1, 0.0, //
        ];
        let dets = decode_output(&[1, 2, 6], &data, &lb, 0.3, 640.0, 480.0).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, [10.0, 10.0, 110.0, 40.0]);
        assert_eq!(dets[0].class_id, Some(0));
    }

    #[test]
    fn test_decode_raw_layout_single_class() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        // [1, 5, 3]: cx row, cy row, w row, h row, score row
        let data = vec![
            100.0, 50.0, 300.0, //
            100.0, 50.0, 300.0, //
            40.0, 10.0, 80.0, //
            20.0, 10.0, 20.0, //
            0.8, 0.2, 0.6, //
        ];
        let dets = decode_output(&[1, 5, 3], &data, &lb, 0.5, 640.0, 480.0).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].bbox, [80.0, 90.0, 120.0, 110.0]);
        assert_eq!(dets[1].confidence, 0.6);
    }

    #[test]
    fn test_decode_clamps_and_rejects_bad_shape() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let data = vec![-20.0, 10.0, 50.0, 40.0, 0.9, 0.0];
        let dets = decode_output(&[1, 1, 6], &data, &lb, 0.3, 640.0, 480.0).unwrap();
        assert_eq!(dets[0].bbox[0], 0.0);

        assert!(decode_output(&[1, 6], &data, &lb, 0.3, 640.0, 480.0).is_err());
        assert!(decode_output(&[1, 4, 6], &data, &lb, 0.3, 640.0, 480.0).is_err());
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let dets = vec![
            det([0.0, 0.0, 100.0, 30.0], 0.7),
            det([2.0, 1.0, 102.0, 31.0], 0.9),
            det([300.0, 0.0, 400.0, 30.0], 0.5),
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.5);
    }

    #[test]
    fn test_threshold_then_nms() {
        let dets = vec![
            det([0.0, 0.0, 100.0, 30.0], 0.3),
            det([300.0, 0.0, 400.0, 30.0], 0.5),
        ];
        let kept = threshold_and_nms(dets, 0.35, 0.45);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.5);
    }
}
