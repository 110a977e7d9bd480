// src/types.rs

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub detection: DetectionConfig,
    pub tracking: TrackingConfig,
    pub stabilization: StabilizationConfig,
    pub sanity: SanityConfig,
    pub crop: CropConfig,
    pub best_crop: BestCropConfig,
    pub sender: SenderConfig,
    pub gate: GateConfig,
    pub events: EventsConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub camera_id: String,
    pub rtsp_url: String,
    pub transport: Transport,
    /// Frames per second decoded from the stream (ffmpeg fps filter)
    pub read_fps: f64,
    /// Source size; probed with ffprobe when unset
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub probe_timeout_sec: f64,
    /// A single frame read longer than this counts as a disconnect
    pub read_timeout_sec: f64,
    pub backoff_initial_sec: f64,
    pub backoff_max_sec: f64,
    /// Liveness reports `alive=false` once the last frame is older than this
    pub stale_after_sec: f64,
    pub freeze_enable: bool,
    pub freeze_max_sec: f64,
    /// Mean absolute gray difference (0-255) at or below which two frames count as identical
    pub freeze_diff_threshold: f32,
    pub freeze_check_every: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: "cam1".to_string(),
            rtsp_url: String::new(),
            transport: Transport::Tcp,
            read_fps: 6.0,
            width: None,
            height: None,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            probe_timeout_sec: 8.0,
            read_timeout_sec: 2.0,
            backoff_initial_sec: 0.5,
            backoff_max_sec: 10.0,
            stale_after_sec: 2.0,
            freeze_enable: true,
            freeze_max_sec: 3.0,
            freeze_diff_threshold: 0.35,
            freeze_check_every: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model_path: String,
    /// Detector invocations per second
    pub det_fps: f64,
    pub conf_threshold: f32,
    pub nms_iou: f32,
    pub input_size: usize,
    pub input_name: String,
    pub intra_threads: usize,
    pub timeout_sec: f64,
    pub roi: RoiConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model_path: "models/plate_detector.onnx".to_string(),
            det_fps: 2.0,
            conf_threshold: 0.35,
            nms_iou: 0.45,
            input_size: 640,
            input_name: "images".to_string(),
            intra_threads: 2,
            timeout_sec: 2.0,
            roi: RoiConfig::default(),
        }
    }
}

/// Scene restriction in frame pixels. Both parts are optional; when both
/// are set a detection must satisfy both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    /// [x1, y1, x2, y2]
    pub rect: Option<[f32; 4]>,
    /// Closed polygon, at least 3 points
    pub polygon: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Minimum IoU to match a detection to an existing track
    pub iou_min: f32,
    /// Weight of the raw observation in the EMA (1.0 = no smoothing)
    pub alpha: f32,
    /// Seconds a track survives unmatched
    pub hold_sec: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            iou_min: 0.18,
            alpha: 0.75,
            hold_sec: 1.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StabMode {
    Track,
    Plate,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    pub mode: StabMode,
    pub window_sec: f64,
    pub min_hits: u32,
    pub min_hit_ratio: f32,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            mode: StabMode::Hybrid,
            window_sec: 1.5,
            min_hits: 2,
            min_hit_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanityConfig {
    pub enable: bool,
    pub aspect_min: f32,
    pub aspect_min_adaptive: f32,
    pub adaptive_conf_min: f32,
    pub adaptive_area_min: f32,
    pub min_width: u32,
    pub min_height: u32,
    pub max_aspect: f32,
    /// Persist rejected frame/crop JPEGs
    pub dump_enable: bool,
    pub dump_dir: String,
    pub dump_every_sec: f64,
    pub log_every_sec: f64,
}

impl Default for SanityConfig {
    fn default() -> Self {
        Self {
            enable: true,
            aspect_min: 1.80,
            aspect_min_adaptive: 1.60,
            adaptive_conf_min: 0.75,
            adaptive_area_min: 0.0065,
            min_width: 140,
            min_height: 60,
            max_aspect: 8.0,
            dump_enable: false,
            dump_dir: "debug/sanity".to_string(),
            dump_every_sec: 3.0,
            log_every_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub pad_base: f32,
    pub pad_small: f32,
    pub pad_small_w: u32,
    pub pad_small_h: u32,
    pub pad_max: f32,
    pub pad_right_extra: f32,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            pad_base: 0.08,
            pad_small: 0.12,
            pad_small_w: 260,
            pad_small_h: 85,
            pad_max: 0.16,
            pad_right_extra: 0.04,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BestCropConfig {
    pub enable: bool,
    pub window_sec: f64,
    pub max_send: usize,
    /// Buffer capacity; reaching it closes the window early
    pub max_buffered: usize,
}

impl Default for BestCropConfig {
    fn default() -> Self {
        Self {
            enable: true,
            window_sec: 1.5,
            max_send: 1,
            max_buffered: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub recognition_url: String,
    pub send_fps: f64,
    pub timeout_sec: f64,
    pub jpeg_quality: u8,
    pub upscale_enable: bool,
    pub upscale_min_w: u32,
    pub upscale_min_h: u32,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub warn_every_sec: f64,
    pub decision_log_every_sec: f64,
    /// Queued crops whose frame is older than this are discarded unsent
    pub max_candidate_age_sec: f64,
    /// Minimum gap between OCR requests for a track already read as a
    /// plate that was sent recently; 0 disables
    pub plate_resend_sec: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            recognition_url: "http://127.0.0.1:8080/recognize".to_string(),
            send_fps: 2.0,
            timeout_sec: 3.0,
            jpeg_quality: 90,
            upscale_enable: true,
            upscale_min_w: 320,
            upscale_min_h: 96,
            queue_capacity: 4,
            max_in_flight: 1,
            warn_every_sec: 5.0,
            decision_log_every_sec: 2.0,
            max_candidate_age_sec: 3.0,
            plate_resend_sec: 15.0,
        }
    }
}

pub const RU_PLATE_PATTERN: &str = r"^[АВЕКМНОРСТУХ]\d{3}[АВЕКМНОРСТУХ]{2}\d{2,3}$";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub min_conf: f32,
    pub confirm_n: u32,
    pub confirm_window_sec: f64,
    pub cooldown_sec: f64,
    /// Cooldown after a confirmed non-whitelisted plate; falls back to `cooldown_sec`
    pub denied_cooldown_sec: Option<f64>,
    pub format_check: bool,
    pub plate_pattern: String,
    /// Allowed trailing region codes; empty accepts any
    pub allowed_regions: Vec<String>,
    pub cyrillic_repair: bool,
    pub whitelist_path: String,
    pub whitelist_reload_sec: f64,
    /// Confirmation entries untouched for this many cooldowns are dropped
    pub gc_after_cooldowns: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_conf: 0.80,
            confirm_n: 2,
            confirm_window_sec: 2.0,
            cooldown_sec: 15.0,
            denied_cooldown_sec: None,
            format_check: true,
            plate_pattern: RU_PLATE_PATTERN.to_string(),
            allowed_regions: Vec::new(),
            cyrillic_repair: true,
            whitelist_path: "whitelist.json".to_string(),
            whitelist_reload_sec: 5.0,
            gc_after_cooldowns: 4.0,
        }
    }
}

impl GateConfig {
    pub fn denied_cooldown(&self) -> f64 {
        self.denied_cooldown_sec.unwrap_or(self.cooldown_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
    /// Relay webhook; receives only `sent` events
    pub publish_url: Option<String>,
    pub publish_timeout_sec: f64,
    pub publish_retries: u32,
    pub publish_backoff_sec: f64,
    pub jsonl_path: Option<String>,
    pub store_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            publish_url: None,
            publish_timeout_sec: 2.0,
            publish_retries: 3,
            publish_backoff_sec: 0.5,
            jsonl_path: Some("events.jsonl".to_string()),
            store_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub path: Option<String>,
    pub interval_sec: f64,
    pub recent_events: usize,
    pub summary_every_sec: f64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: Some("status.json".to_string()),
            interval_sec: 1.0,
            recent_events: 20,
            summary_every_sec: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "plate_gate=info,ort=warn".to_string(),
        }
    }
}

// ============================================================================
// FRAMES & DETECTIONS
// ============================================================================

/// Decoded RGB frame. `timestamp` is monotonic seconds from `Clock`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: image::RgbImage,
    pub timestamp: f64,
    pub seq: u64,
}

impl Frame {
    pub fn width(&self) -> usize {
        self.image.width() as usize
    }

    pub fn height(&self) -> usize {
        self.image.height() as usize
    }

    pub fn area(&self) -> f32 {
        (self.width() * self.height()) as f32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] in frame pixels
    pub confidence: f32,
    pub class_id: Option<usize>,
}

pub fn bbox_area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = bbox_area(a) + bbox_area(b) - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Monotonic pipeline clock. Decision logic runs on `now()` seconds; events
/// carry `wall(now)` so that replays with injected times stay deterministic.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: tokio::time::Instant,
    wall_start: f64,
}

impl Clock {
    pub fn new() -> Self {
        let wall_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            start: tokio::time::Instant::now(),
            wall_start,
        }
    }

    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn wall(&self, mono: f64) -> f64 {
        self.wall_start + mono
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
