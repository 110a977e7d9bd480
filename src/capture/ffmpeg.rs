// src/capture/ffmpeg.rs
//
// Production frame source: an ffmpeg child decoding the camera stream to
// raw RGB24 on stdout, rate-capped with the `fps` filter.

use super::FrameSource;
use crate::types::CameraConfig;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

pub struct FfmpegSource {
    cfg: CameraConfig,
    size: Option<(u32, u32)>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buf: Vec<u8>,
}

impl FfmpegSource {
    pub fn new(cfg: CameraConfig) -> Self {
        let size = match (cfg.width, cfg.height) {
            (Some(w), Some(h)) => Some((w as u32, h as u32)),
            _ => None,
        };
        Self {
            cfg,
            size,
            child: None,
            stdout: None,
            buf: Vec::new(),
        }
    }

    async fn probe_size(&self) -> Result<(u32, u32)> {
        let mut cmd = Command::new(&self.cfg.ffprobe_path);
        cmd.args(["-v", "error"]);
        if is_rtsp(&self.cfg.rtsp_url) {
            cmd.args(["-rtsp_transport", self.cfg.transport.as_str()]);
        }
        cmd.args([
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "json",
        ])
        .arg(&self.cfg.rtsp_url)
        .stdin(Stdio::null())
        .kill_on_drop(true);

        let output = tokio::time::timeout(
            Duration::from_secs_f64(self.cfg.probe_timeout_sec),
            cmd.output(),
        )
        .await
        .context("ffprobe timed out")?
        .context("Failed to run ffprobe")?;

        if !output.status.success() {
            bail!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_probe_output(&output.stdout)
    }
}

impl FrameSource for FfmpegSource {
    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let (w, h) = match self.size {
            Some(size) => size,
            None => {
                let size = self.probe_size().await?;
                info!("✓ Probed stream size {}x{}", size.0, size.1);
                self.size = Some(size);
                size
            }
        };

        let mut child = Command::new(&self.cfg.ffmpeg_path)
            .args(ffmpeg_args(&self.cfg))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.cfg.ffmpeg_path))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg: {}", line);
                }
            });
        }
        self.stdout = child.stdout.take();
        self.child = Some(child);
        self.buf = vec![0u8; (w * h * 3) as usize];
        debug!("ffmpeg started for {}x{} @ {} fps", w, h, self.cfg.read_fps);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<RgbImage>> {
        let (w, h) = match self.size {
            Some(size) => size,
            None => bail!("source not opened"),
        };
        let stdout = match self.stdout.as_mut() {
            Some(s) => s,
            None => bail!("source not opened"),
        };

        match stdout.read_exact(&mut self.buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read frame from ffmpeg"),
        }
        let image = RgbImage::from_raw(w, h, self.buf.clone())
            .context("Frame buffer does not match the stream size")?;
        Ok(Some(image))
    }

    async fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            child.kill().await.ok();
        }
    }
}

fn is_rtsp(url: &str) -> bool {
    url.starts_with("rtsp://") || url.starts_with("rtsps://")
}

/// Command line for the decoder child. Output size is forced with `scale`
/// when the size is configured, so frames always match the read buffer.
pub fn ffmpeg_args(cfg: &CameraConfig) -> Vec<String> {
    let mut args: Vec<String> = ["-nostdin", "-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if is_rtsp(&cfg.rtsp_url) {
        args.extend(["-rtsp_transport".to_string(), cfg.transport.as_str().to_string()]);
    }
    args.extend(
        ["-fflags", "nobuffer", "-flags", "low_delay", "-an", "-i"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(cfg.rtsp_url.clone());

    let mut filter = format!("fps={}", cfg.read_fps);
    if let (Some(w), Some(h)) = (cfg.width, cfg.height) {
        filter.push_str(&format!(",scale={}:{}", w, h));
    }
    args.extend(["-vf".to_string(), filter]);
    args.extend(
        ["-pix_fmt", "rgb24", "-f", "rawvideo", "pipe:1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

pub fn parse_probe_output(stdout: &[u8]) -> Result<(u32, u32)> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).context("Failed to parse ffprobe output")?;
    match probe.streams.first() {
        Some(ProbeStream {
            width: Some(w),
            height: Some(h),
        }) if *w > 0 && *h > 0 => Ok((*w, *h)),
        _ => bail!("ffprobe reported no video stream size"),
    }
}
