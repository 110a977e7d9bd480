// src/remote_recognition.rs
//
// OCR boundary. A selected plate crop is upscaled when small, JPEG-encoded,
// and posted as base64 JSON to the recognition service, which answers with
// the plate text and a confidence.

use crate::gate::PlateReading;
use crate::selection::best_crop::Candidate;
use crate::types::SenderConfig;
use anyhow::{bail, Context, Result};
use base64::Engine;
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, error};

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RecognitionRequest {
    /// Unique id for correlation; echoed into the event's media reference
    pub request_id: String,
    pub camera_id: String,
    pub track_id: u32,
    /// Monotonic capture time of the source frame (seconds)
    pub captured_at: f64,
    pub detector_confidence: f32,
    pub width: u32,
    pub height: u32,
    /// Base64-encoded JPEG
    pub image_base64: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecognitionResponse {
    #[serde(default, alias = "raw", alias = "plate")]
    pub text: String,
    #[serde(default, alias = "conf")]
    pub confidence: f32,
    #[serde(default)]
    pub region: Option<String>,
    /// `false` when the service reports a soft OCR failure
    #[serde(default)]
    pub infer_ok: Option<bool>,
    #[serde(default)]
    pub ocr_error: Option<String>,
}

impl RecognitionResponse {
    pub fn into_reading(self, track_id: u32, media_ref: String) -> PlateReading {
        PlateReading {
            text: self.text,
            confidence: self.confidence,
            region: self.region,
            track_id: Some(track_id),
            media_ref: Some(media_ref),
        }
    }
}

// ============================================================================
// CLIENT
// ============================================================================

pub trait RecognitionClient: Send + Sync + 'static {
    fn recognize(
        &self,
        request: &RecognitionRequest,
    ) -> impl Future<Output = Result<RecognitionResponse>> + Send;
}

pub struct HttpRecognitionClient {
    http_client: reqwest::Client,
    url: String,
}

impl HttpRecognitionClient {
    pub fn new(url: String, timeout_secs: f64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs_f64(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http_client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RecognitionClient for HttpRecognitionClient {
    async fn recognize(&self, request: &RecognitionRequest) -> Result<RecognitionResponse> {
        debug!(
            "🌐 Recognition request {} (track {}, {}x{}) to {}",
            request.request_id, request.track_id, request.width, request.height, self.url
        );

        let response = self
            .http_client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .context("Recognition request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            error!("🌐 Recognition server returned {}: {}", status, body);
            bail!("recognition server returned {}", status);
        }

        let parsed: RecognitionResponse = response
            .json()
            .await
            .context("Failed to parse recognition response")?;

        if parsed.infer_ok == Some(false) {
            bail!(
                "recognition service reported failure: {}",
                parsed.ocr_error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(parsed)
    }
}

/// Prepare the request for one candidate: upscale, encode, wrap.
pub fn build_request(
    candidate: &Candidate,
    camera_id: &str,
    cfg: &SenderConfig,
) -> Result<RecognitionRequest> {
    let image = if cfg.upscale_enable {
        upscale_for_ocr(&candidate.crop, cfg.upscale_min_w, cfg.upscale_min_h)
    } else {
        candidate.crop.clone()
    };
    let jpeg = encode_rgb_to_jpeg(&image, cfg.jpeg_quality)?;

    Ok(RecognitionRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        camera_id: camera_id.to_string(),
        track_id: candidate.track_id,
        captured_at: candidate.frame_ts,
        detector_confidence: candidate.confidence,
        width: image.width(),
        height: image.height(),
        image_base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
    })
}

// ============================================================================
// IMAGE HELPERS
// ============================================================================

/// Scale up (never down) so the crop reaches at least `min_w` x `min_h`,
/// keeping the aspect ratio.
pub fn upscale_for_ocr(img: &RgbImage, min_w: u32, min_h: u32) -> RgbImage {
    let (w, h) = (img.width().max(1), img.height().max(1));
    let factor = (min_w as f32 / w as f32).max(min_h as f32 / h as f32);
    if factor <= 1.0 {
        return img.clone();
    }
    let new_w = (w as f32 * factor).round() as u32;
    let new_h = (h as f32 * factor).round() as u32;
    imageops::resize(img, new_w, new_h, imageops::FilterType::CatmullRom)
}

pub fn encode_rgb_to_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    img.write_with_encoder(encoder)
        .context("Failed to encode crop as JPEG")?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn candidate(w: u32, h: u32) -> Candidate {
        Candidate {
            track_id: 4,
            crop: RgbImage::from_pixel(w, h, Rgb([200, 200, 200])),
            bbox: [0.0, 0.0, w as f32, h as f32],
            confidence: 0.8,
            area_ratio: 0.01,
            sharpness: 1.0,
            score: 0.008,
            frame_ts: 12.5,
            plate_hint: None,
        }
    }

    #[test]
    fn test_upscale_only_when_small() {
        let small = RgbImage::new(160, 40);
        let up = upscale_for_ocr(&small, 320, 96);
        // height needs 2.4x, width 2x: the larger factor wins
        assert_eq!((up.width(), up.height()), (384, 96));

        let big = RgbImage::new(400, 120);
        let same = upscale_for_ocr(&big, 320, 96);
        assert_eq!((same.width(), same.height()), (400, 120));
    }

    #[test]
    fn test_build_request_encodes_jpeg() {
        let cfg = SenderConfig::default();
        let req = build_request(&candidate(200, 60), "gate-north", &cfg).unwrap();

        assert_eq!(req.camera_id, "gate-north");
        assert_eq!(req.track_id, 4);
        assert_eq!(req.captured_at, 12.5);
        assert!(req.width >= 320 && req.height >= 96);
        let jpeg = base64::engine::general_purpose::STANDARD
            .decode(&req.image_base64)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert!(uuid::Uuid::parse_str(&req.request_id).is_ok());
    }

    #[test]
    fn test_response_aliases() {
        let a: RecognitionResponse =
            serde_json::from_str(r#"{"plate": "A123BC77", "conf": 0.91}"#).unwrap();
        assert_eq!(a.text, "A123BC77");
        assert!((a.confidence - 0.91).abs() < 1e-6);

        let b: RecognitionResponse =
            serde_json::from_str(r#"{"text": "В777ОР99", "confidence": 0.5, "region": "99"}"#)
                .unwrap();
        let reading = b.into_reading(7, "req-1".into());
        assert_eq!(reading.region.as_deref(), Some("99"));
        assert_eq!(reading.track_id, Some(7));
        assert_eq!(reading.media_ref.as_deref(), Some("req-1"));
    }
}
