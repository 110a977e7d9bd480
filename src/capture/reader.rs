// src/capture/reader.rs

use super::watchdog::{Backoff, FreezeWatchdog};
use super::FrameSource;
use crate::pipeline::metrics::PipelineMetrics;
use crate::types::{CameraConfig, Clock, Frame};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection-level state shared between the reader task and the status surface.
#[derive(Debug, Default, Clone)]
pub struct ReaderStatus {
    pub connected: bool,
    pub last_frame_at: Option<f64>,
    pub fps: f64,
    pub frozen: bool,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl ReaderStatus {
    fn on_frame(&mut self, now: f64, frozen: bool) {
        if let Some(prev) = self.last_frame_at {
            let dt = now - prev;
            if dt > 0.0 {
                let inst = 1.0 / dt;
                self.fps = if self.fps > 0.0 {
                    0.8 * self.fps + 0.2 * inst
                } else {
                    inst
                };
            }
        }
        self.last_frame_at = Some(now);
        self.connected = true;
        self.frozen = frozen;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    pub alive: bool,
    pub age_ms: Option<u64>,
    pub fps: f64,
    pub frozen: bool,
    pub reconnects: u64,
    pub last_error: Option<String>,
}

/// Read side of the latest-frame slot.
#[derive(Clone)]
pub struct FrameHandle {
    rx: watch::Receiver<Option<Arc<Frame>>>,
    status: Arc<Mutex<ReaderStatus>>,
    clock: Clock,
    stale_after: f64,
}

impl FrameHandle {
    /// Freshest frame and whether it is older than `stale_after_sec`.
    pub fn latest(&self) -> Option<(Arc<Frame>, bool)> {
        let frame = self.rx.borrow().clone()?;
        let stale = self.clock.now() - frame.timestamp > self.stale_after;
        Some((frame, stale))
    }

    pub fn liveness(&self) -> Liveness {
        let st = match self.status.lock() {
            Ok(s) => s.clone(),
            Err(p) => p.into_inner().clone(),
        };
        let now = self.clock.now();
        let age = st.last_frame_at.map(|t| (now - t).max(0.0));
        Liveness {
            alive: st.connected && age.map(|a| a <= self.stale_after).unwrap_or(false),
            age_ms: age.map(|a| (a * 1000.0) as u64),
            fps: st.fps,
            frozen: st.frozen,
            reconnects: st.reconnects,
            last_error: st.last_error,
        }
    }
}

#[cfg(test)]
impl FrameHandle {
    /// Handle fed directly by a test instead of a reader task.
    pub fn manual(clock: Clock, stale_after: f64) -> (watch::Sender<Option<Arc<Frame>>>, Self) {
        let (tx, rx) = watch::channel(None);
        let status = ReaderStatus {
            connected: true,
            ..ReaderStatus::default()
        };
        let handle = Self {
            rx,
            status: Arc::new(Mutex::new(status)),
            clock,
            stale_after,
        };
        (tx, handle)
    }
}

pub struct StreamReader<S: FrameSource> {
    source: S,
    cfg: CameraConfig,
    clock: Clock,
    tx: watch::Sender<Option<Arc<Frame>>>,
    status: Arc<Mutex<ReaderStatus>>,
    metrics: PipelineMetrics,
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

impl<S: FrameSource> StreamReader<S> {
    pub fn new(source: S, cfg: CameraConfig, clock: Clock, metrics: PipelineMetrics) -> (Self, FrameHandle) {
        let (tx, rx) = watch::channel(None);
        let status = Arc::new(Mutex::new(ReaderStatus::default()));
        let handle = FrameHandle {
            rx,
            status: Arc::clone(&status),
            clock,
            stale_after: cfg.stale_after_sec,
        };
        (
            Self {
                source,
                cfg,
                clock,
                tx,
                status,
                metrics,
            },
            handle,
        )
    }

    fn update_status(&self, f: impl FnOnce(&mut ReaderStatus)) {
        match self.status.lock() {
            Ok(mut s) => f(&mut s),
            Err(p) => f(&mut p.into_inner()),
        }
    }

    /// Runs until `shutdown` flips (or its sender is dropped). Connection
    /// failures are retried forever with bounded backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.cfg.backoff_initial_sec, self.cfg.backoff_max_sec);
        let mut watchdog = FreezeWatchdog::new(
            self.cfg.freeze_enable,
            self.cfg.freeze_max_sec,
            self.cfg.freeze_diff_threshold,
            self.cfg.freeze_check_every,
        );
        let mut seq: u64 = 0;
        let mut first_connect = true;

        while !*shutdown.borrow() {
            let opened = tokio::select! {
                r = self.source.open() => r,
                _ = shutdown.changed() => break,
            };

            if let Err(e) = opened {
                let delay = backoff.next_delay();
                warn!("Camera connect failed: {:#} (retry in {:.1}s)", e, delay.as_secs_f64());
                self.update_status(|s| {
                    s.connected = false;
                    s.last_error = Some(format!("{:#}", e));
                });
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }

            if first_connect {
                info!("✓ Camera connected: {}", self.cfg.camera_id);
                first_connect = false;
            } else {
                info!("🔄 Camera reconnected: {}", self.cfg.camera_id);
            }
            watchdog.reset();

            match self.session(&mut watchdog, &mut backoff, &mut seq, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {}
            }

            self.source.close().await;
            self.update_status(|s| {
                s.connected = false;
                s.reconnects += 1;
            });
            if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                break;
            }
        }

        self.source.close().await;
        self.update_status(|s| s.connected = false);
        info!("Stream reader stopped after {} frame(s)", seq);
    }

    async fn session(
        &mut self,
        watchdog: &mut FreezeWatchdog,
        backoff: &mut Backoff,
        seq: &mut u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let read_timeout = Duration::from_secs_f64(self.cfg.read_timeout_sec);
        // ffmpeg needs time to connect before the first frame
        let first_timeout = Duration::from_secs_f64(self.cfg.read_timeout_sec.max(self.cfg.probe_timeout_sec));
        let mut got_frame = false;

        loop {
            let limit = if got_frame { read_timeout } else { first_timeout };
            let read = tokio::select! {
                r = tokio::time::timeout(limit, self.source.read()) => r,
                _ = shutdown.changed() => return SessionEnd::Shutdown,
            };

            let reason = match read {
                Ok(Ok(Some(image))) => {
                    got_frame = true;
                    backoff.reset();
                    *seq += 1;
                    let now = self.clock.now();
                    let frozen = watchdog.observe(&image, now);
                    self.update_status(|s| s.on_frame(now, frozen));
                    self.metrics.inc(&self.metrics.frames_read);
                    self.tx.send_replace(Some(Arc::new(Frame {
                        image,
                        timestamp: now,
                        seq: *seq,
                    })));
                    if !frozen {
                        continue;
                    }
                    format!("picture frozen for more than {:.1}s", self.cfg.freeze_max_sec)
                }
                Ok(Ok(None)) => "stream ended".to_string(),
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => format!("no frame within {:.1}s", limit.as_secs_f64()),
            };

            warn!("Camera {}: {}, reconnecting", self.cfg.camera_id, reason);
            debug!("Last frame seq before reconnect: {}", seq);
            self.update_status(|s| s.last_error = Some(reason));
            return SessionEnd::Reconnect;
        }
    }
}

/// True if shutdown was requested while waiting.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
