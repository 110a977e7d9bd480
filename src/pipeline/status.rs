// src/pipeline/status.rs
//
// Periodic status snapshot for dashboards: camera liveness, current
// tracks, counters and the latest user-visible events. Written to disk
// via temp file + rename so readers never see a partial file.

use super::detection_loop::OverlayBox;
use super::metrics::{MetricsSummary, PipelineMetrics};
use crate::capture::{FrameHandle, Liveness};
use crate::gate::{EventStatus, GateEngine, SharedEventStore};
use crate::types::{Clock, StatusConfig};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RecentEvent {
    pub timestamp: f64,
    pub plate: String,
    pub status: EventStatus,
    pub message: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub camera_id: String,
    /// Wall-clock seconds
    pub updated_at: f64,
    pub camera: Liveness,
    pub tracks: Vec<OverlayBox>,
    pub tracked_plates: usize,
    pub metrics: MetricsSummary,
    pub recent_events: Vec<RecentEvent>,
}

pub struct StatusReporter {
    cfg: StatusConfig,
    camera_id: String,
    frames: FrameHandle,
    overlay: watch::Receiver<Vec<OverlayBox>>,
    store: SharedEventStore,
    engine: Arc<GateEngine>,
    clock: Clock,
    metrics: PipelineMetrics,
}

impl StatusReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: StatusConfig,
        camera_id: String,
        frames: FrameHandle,
        overlay: watch::Receiver<Vec<OverlayBox>>,
        store: SharedEventStore,
        engine: Arc<GateEngine>,
        clock: Clock,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            cfg,
            camera_id,
            frames,
            overlay,
            store,
            engine,
            clock,
            metrics,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let recent_events = {
            let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
            store
                .latest(self.cfg.recent_events, false)
                .into_iter()
                .map(|e| RecentEvent {
                    timestamp: e.timestamp,
                    message: e.message(),
                    plate: e.plate_normalized,
                    status: e.status,
                    confidence: e.confidence,
                })
                .collect()
        };

        StatusSnapshot {
            camera_id: self.camera_id.clone(),
            updated_at: self.clock.wall(self.clock.now()),
            camera: self.frames.liveness(),
            tracks: self.overlay.borrow().clone(),
            tracked_plates: self.engine.tracked_plates(),
            metrics: self.metrics.summary(),
            recent_events,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let path = self.cfg.path.as_ref().map(PathBuf::from);
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(self.cfg.interval_sec.max(0.1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_summary = self.clock.now();

        if let Some(p) = &path {
            info!("✓ Status snapshot: {}", p.display());
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let snapshot = self.snapshot();
            if let Some(p) = &path {
                if let Err(e) = write_snapshot(p, &snapshot).await {
                    warn!("Failed to write status: {:#}", e);
                }
            }

            let now = self.clock.now();
            if self.cfg.summary_every_sec > 0.0 && now - last_summary >= self.cfg.summary_every_sec {
                last_summary = now;
                info!("📊 {}", snapshot.metrics.log_line());
            }
        }

        let snapshot = self.snapshot();
        if let Some(p) = &path {
            if let Err(e) = write_snapshot(p, &snapshot).await {
                warn!("Failed to write final status: {:#}", e);
            }
        }
        info!("📊 Final: {}", snapshot.metrics.log_line());
    }
}

pub async fn write_snapshot(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize status")?;
    write_atomic(path, &json).await
}

/// Write to `<path>.tmp`, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    debug!("Status written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::plate::PlateRules;
    use crate::gate::whitelist::Whitelist;
    use crate::gate::{Event, EventLevel, EventStore};
    use crate::types::GateConfig;
    use std::sync::Mutex;

    fn event(seq: u64, plate: &str, status: EventStatus, level: EventLevel) -> Event {
        Event {
            seq,
            timestamp: 1_700_000_000.0 + seq as f64,
            camera_id: "cam1".into(),
            plate_raw: plate.into(),
            plate_normalized: plate.into(),
            confidence: 0.9,
            status,
            reason: "ok".into(),
            level,
            track_id: Some(1),
            media_ref: None,
        }
    }

    fn reporter(dir: &Path) -> (StatusReporter, watch::Sender<Vec<OverlayBox>>) {
        let clock = Clock::new();
        let (_frames_tx, frames) = FrameHandle::manual(clock, 2.0);
        let (overlay_tx, overlay_rx) = watch::channel(Vec::new());

        let mut store = EventStore::new(10);
        store.push(event(1, "А123ВС77", EventStatus::Sent, EventLevel::Info));
        store.push(event(2, "А123ВС77", EventStatus::Invalid, EventLevel::Debug));
        store.push(event(3, "В777ОР99", EventStatus::Denied, EventLevel::Info));

        let gate_cfg = GateConfig::default();
        let rules = PlateRules::from_config(&gate_cfg).unwrap();
        let engine = GateEngine::new(gate_cfg, "cam1".into(), rules.clone(), Whitelist::from_entries(Vec::<String>::new(), &rules), None);

        let cfg = StatusConfig {
            path: Some(dir.join("status.json").to_string_lossy().into_owned()),
            interval_sec: 0.5,
            recent_events: 5,
            summary_every_sec: 30.0,
        };
        let r = StatusReporter::new(
            cfg,
            "cam1".into(),
            frames,
            overlay_rx,
            Arc::new(Mutex::new(store)),
            Arc::new(engine),
            clock,
            PipelineMetrics::new(),
        );
        (r, overlay_tx)
    }

    #[tokio::test]
    async fn test_snapshot_hides_debug_events() {
        let dir = tempfile::tempdir().unwrap();
        let (r, overlay_tx) = reporter(dir.path());
        overlay_tx.send_replace(vec![OverlayBox {
            track_id: 3,
            bbox: [1.0, 2.0, 3.0, 4.0],
            confidence: 0.8,
            hits: 2,
            stable: true,
            plate: None,
        }]);

        let snap = r.snapshot();
        assert_eq!(snap.recent_events.len(), 2);
        assert_eq!(snap.recent_events[0].plate, "В777ОР99"); // newest first
        assert_eq!(snap.recent_events[1].message, "gate opened for А123ВС77");
        assert_eq!(snap.tracks.len(), 1);
        assert!(!snap.camera.alive);
    }

    #[tokio::test]
    async fn test_run_writes_file_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (r, _overlay_tx) = reporter(dir.path());
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(r.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let path = dir.path().join("status.json");
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["camera_id"], "cam1");
        assert_eq!(json["recent_events"][0]["status"], "denied");
        assert!(json["metrics"]["frames_read"].is_u64());
        assert!(!dir.path().join("status.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("s.json");
        write_atomic(&path, b"{}").await.unwrap();
        write_atomic(&path, b"{\"a\":1}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }
}
