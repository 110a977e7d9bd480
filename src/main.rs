// src/main.rs

mod analysis;
mod capture;
mod config;
mod detection;
mod gate;
mod pipeline;
mod remote_recognition;
mod selection;
mod types;

use anyhow::{Context, Result};
use capture::{FfmpegSource, StreamReader};
use detection::{DetectorClient, OnnxPlateDetector};
use gate::events::{run_jsonl_subscriber, run_publisher, run_store_subscriber, HttpPublisher};
use gate::whitelist::WhitelistWatcher;
use gate::{EventStore, GateEngine, SharedEventStore};
use pipeline::{CandidateQueue, DetectionLoop, PipelineMetrics, PlateSender, StatusReporter};
use remote_recognition::HttpRecognitionClient;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Clock;

const FEEDBACK_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GATE_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string());

    // Log level comes from the config unless RUST_LOG is set
    let config = types::Config::load(&config_path)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚧 Plate gate starting (camera {})", config.camera.camera_id);
    info!("✓ Configuration loaded from {}", config_path);

    let clock = Clock::new();
    let metrics = PipelineMetrics::new();
    let camera_id = config.camera.camera_id.clone();

    // ========================================================================
    // EVENTS
    // ========================================================================

    let (events_tx, _) = broadcast::channel(config.events.channel_capacity.max(1));
    let store: SharedEventStore = Arc::new(Mutex::new(EventStore::new(config.events.store_size)));
    let mut subscribers = JoinSet::new();

    subscribers.spawn(run_store_subscriber(events_tx.subscribe(), Arc::clone(&store)));
    if let Some(path) = config.events.jsonl_path.clone() {
        let rx = events_tx.subscribe();
        subscribers.spawn(async move {
            if let Err(e) = run_jsonl_subscriber(rx, path).await {
                error!("Event log disabled: {:#}", e);
            }
        });
    }
    if let Some(url) = config.events.publish_url.clone() {
        let publisher = HttpPublisher::new(url.clone(), config.events.publish_timeout_sec)?;
        subscribers.spawn(run_publisher(
            events_tx.subscribe(),
            publisher,
            config.events.publish_retries,
            config.events.publish_backoff_sec,
        ));
        info!("✓ Relay webhook: {}", url);
    }

    let engine = Arc::new(GateEngine::from_config(&config.gate, &camera_id, Some(events_tx))?);
    info!(
        "✓ Gate engine ready ({} whitelisted plate(s), confirm {} in {:.1}s, cooldown {:.0}s)",
        engine.whitelist_len(),
        config.gate.confirm_n,
        config.gate.confirm_window_sec,
        config.gate.cooldown_sec
    );

    // ========================================================================
    // PIPELINE
    // ========================================================================

    let detector = OnnxPlateDetector::new(&config.detection)?;
    info!("✓ Plate detector ready ({})", config.detection.model_path);
    let detector = DetectorClient::new(detector, &config.detection, metrics.clone());

    let source = FfmpegSource::new(config.camera.clone());
    let (reader, frames) = StreamReader::new(source, config.camera.clone(), clock, metrics.clone());

    let queue = Arc::new(CandidateQueue::new(config.sender.queue_capacity, metrics.clone()));
    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CAPACITY);

    let (detection, overlay) = DetectionLoop::new(
        &config,
        frames.clone(),
        detector,
        Arc::clone(&queue),
        feedback_rx,
        clock,
        metrics.clone(),
    );

    let client = Arc::new(HttpRecognitionClient::new(
        config.sender.recognition_url.clone(),
        config.sender.timeout_sec,
    )?);
    info!("✓ Recognition endpoint: {}", client.url());
    let sender = PlateSender::new(
        client,
        Arc::clone(&engine),
        Arc::clone(&queue),
        feedback_tx,
        config.sender.clone(),
        camera_id.clone(),
        clock,
        metrics.clone(),
    );

    let status = StatusReporter::new(
        config.status.clone(),
        camera_id,
        frames,
        overlay,
        Arc::clone(&store),
        Arc::clone(&engine),
        clock,
        metrics.clone(),
    );

    // One stop signal per stage so shutdown runs front to back
    let (capture_stop, capture_rx) = watch::channel(false);
    let (detect_stop, detect_rx) = watch::channel(false);
    let (aux_stop, aux_rx) = watch::channel(false);

    let reader_task = tokio::spawn(reader.run(capture_rx));
    let detection_task = tokio::spawn(detection.run(detect_rx));
    let sender_task = tokio::spawn(sender.run());
    let status_task = tokio::spawn(status.run(aux_rx.clone()));
    let whitelist_task = tokio::spawn(reload_whitelist(
        Arc::clone(&engine),
        config.gate.whitelist_path.clone(),
        config.gate.whitelist_reload_sec,
        aux_rx,
    ));

    info!("✓ Pipeline running, Ctrl+C to stop");
    shutdown_signal().await?;
    info!("🛑 Shutdown requested");

    capture_stop.send_replace(true);
    join("stream reader", reader_task).await;

    detect_stop.send_replace(true);
    join("detection loop", detection_task).await;

    queue.close();
    join("sender", sender_task).await;

    aux_stop.send_replace(true);
    join("status", status_task).await;
    join("whitelist reload", whitelist_task).await;

    // Last engine handle: closing the event channel lets subscribers flush and exit
    drop(engine);
    while subscribers.join_next().await.is_some() {}

    info!("✓ Shutdown complete");
    Ok(())
}

/// Swap in the whitelist whenever the file changes on disk.
async fn reload_whitelist(
    engine: Arc<GateEngine>,
    path: String,
    every_sec: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    if every_sec <= 0.0 {
        return;
    }
    let mut watcher = WhitelistWatcher::new(&path);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(every_sec));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(whitelist) = watcher.poll(engine.rules()).await {
                    engine.replace_whitelist(whitelist);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("{} task ended abnormally: {}", name, e);
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r.context("Failed to listen for Ctrl+C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
