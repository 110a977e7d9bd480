// src/gate/events.rs
//
// Decision events and their consumers. The engine emits each Event once
// onto a broadcast channel; the store, the JSONL log and the relay
// publisher each subscribe independently.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Sent,
    Denied,
    Invalid,
    Cooldown,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Denied => "denied",
            Self::Invalid => "invalid",
            Self::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-engine sequence number
    pub seq: u64,
    /// Wall-clock seconds
    pub timestamp: f64,
    pub camera_id: String,
    pub plate_raw: String,
    pub plate_normalized: String,
    pub confidence: f32,
    pub status: EventStatus,
    pub reason: String,
    pub level: EventLevel,
    pub track_id: Option<u32>,
    pub media_ref: Option<String>,
}

impl Event {
    /// Human-readable line for dashboards and chat notifications.
    pub fn message(&self) -> String {
        match (self.status, self.reason.as_str()) {
            (EventStatus::Sent, _) => format!("gate opened for {}", self.plate_normalized),
            (EventStatus::Denied, "not_in_whitelist") => {
                format!("{} is not in the whitelist", self.plate_normalized)
            }
            (EventStatus::Denied, "low_conf") => {
                format!("low confidence {:.2}", self.confidence)
            }
            (EventStatus::Cooldown, _) => format!("{} in cooldown", self.plate_normalized),
            (_, reason) => reason.to_string(),
        }
    }
}

// ============================================================================
// EVENT STORE
// ============================================================================

/// Bounded ring of recent events for the status surface.
#[derive(Debug)]
pub struct EventStore {
    events: VecDeque<Event>,
    max_events: usize,
}

impl EventStore {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events: max_events.max(1),
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Newest first. Debug-level events (noise, pending confirmations) are hidden unless asked for.
    pub fn latest(&self, limit: usize, include_debug: bool) -> Vec<Event> {
        self.events
            .iter()
            .rev()
            .filter(|e| include_debug || e.level != EventLevel::Debug)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

pub type SharedEventStore = Arc<Mutex<EventStore>>;

// ============================================================================
// SUBSCRIBERS
// ============================================================================

/// Receive until the channel closes. Lag is logged and skipped.
async fn next_event(rx: &mut broadcast::Receiver<Event>, who: &str) -> Option<Event> {
    loop {
        match rx.recv().await {
            Ok(ev) => return Some(ev),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("{} subscriber lagged, skipped {} event(s)", who, n);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

pub async fn run_store_subscriber(mut rx: broadcast::Receiver<Event>, store: SharedEventStore) {
    while let Some(ev) = next_event(&mut rx, "store").await {
        if let Ok(mut s) = store.lock() {
            s.push(ev);
        }
    }
    debug!("Event store subscriber stopped");
}

pub async fn run_jsonl_subscriber(mut rx: broadcast::Receiver<Event>, path: String) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open event log {}", path))?;
    info!("✓ Event log: {}", path);

    while let Some(ev) = next_event(&mut rx, "jsonl").await {
        let mut line = match serde_json::to_string(&ev) {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to serialize event {}: {}", ev.seq, e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!("Failed to append event log: {}", e);
        }
    }
    file.flush().await.ok();
    debug!("Event log subscriber stopped");
    Ok(())
}

/// Outbound "open gate" boundary. Called only for `sent` events.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, event: &Event) -> impl std::future::Future<Output = Result<()>> + Send;
}

pub struct HttpPublisher {
    http_client: reqwest::Client,
    url: String,
}

#[derive(Debug, Serialize)]
struct PublishPayload<'a> {
    kind: &'static str,
    #[serde(flatten)]
    event: &'a Event,
    message: String,
}

impl HttpPublisher {
    pub fn new(url: String, timeout_secs: f64) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs_f64(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http_client, url })
    }
}

impl Publisher for HttpPublisher {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = PublishPayload {
            kind: "gate_open",
            event,
            message: event.message(),
        };
        let response = self
            .http_client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("Publish request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Publish endpoint returned {}", response.status());
        }
        Ok(())
    }
}

/// Relay subscriber: forwards `sent` events, retrying with exponential backoff.
pub async fn run_publisher<P: Publisher>(
    mut rx: broadcast::Receiver<Event>,
    publisher: P,
    retries: u32,
    backoff_sec: f64,
) {
    while let Some(ev) = next_event(&mut rx, "publisher").await {
        if ev.status != EventStatus::Sent {
            continue;
        }
        let mut delay = backoff_sec;
        for attempt in 0..=retries {
            match publisher.publish(&ev).await {
                Ok(()) => {
                    info!("📣 Published gate open for {} (event {})", ev.plate_normalized, ev.seq);
                    break;
                }
                Err(e) if attempt < retries => {
                    warn!(
                        "Publish attempt {}/{} for {} failed: {:#}",
                        attempt + 1,
                        retries + 1,
                        ev.plate_normalized,
                        e
                    );
                    tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                    delay *= 2.0;
                }
                Err(e) => {
                    warn!("Giving up publishing {}: {:#}", ev.plate_normalized, e);
                }
            }
        }
    }
    debug!("Publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(seq: u64, status: EventStatus, level: EventLevel) -> Event {
        Event {
            seq,
            timestamp: 1_700_000_000.0 + seq as f64,
            camera_id: "cam1".into(),
            plate_raw: "A123BC77".into(),
            plate_normalized: "А123ВС77".into(),
            confidence: 0.9,
            status,
            reason: "ok".into(),
            level,
            track_id: Some(1),
            media_ref: None,
        }
    }

    #[test]
    fn test_store_ring_and_debug_filter() {
        let mut store = EventStore::new(3);
        store.push(event(1, EventStatus::Sent, EventLevel::Info));
        store.push(event(2, EventStatus::Invalid, EventLevel::Debug));
        store.push(event(3, EventStatus::Cooldown, EventLevel::Info));
        store.push(event(4, EventStatus::Cooldown, EventLevel::Info));

        assert_eq!(store.len(), 3);
        let visible: Vec<u64> = store.latest(10, false).iter().map(|e| e.seq).collect();
        assert_eq!(visible, vec![4, 3]);
        let all: Vec<u64> = store.latest(10, true).iter().map(|e| e.seq).collect();
        assert_eq!(all, vec![4, 3, 2]);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(event(7, EventStatus::Denied, EventLevel::Info)).unwrap();
        assert_eq!(json["status"], "denied");
        assert_eq!(json["level"], "info");
        assert_eq!(json["plate_normalized"], "А123ВС77");
    }

    struct Flaky {
        fail_first: u32,
        calls: Arc<AtomicU32>,
    }

    impl Publisher for Flaky {
        async fn publish(&self, _event: &Event) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("relay offline");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_only_sent_and_retries() {
        let (tx, rx) = broadcast::channel(16);
        let calls = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(run_publisher(
            rx,
            Flaky {
                fail_first: 2,
                calls: calls.clone(),
            },
            3,
            0.1,
        ));

        tx.send(event(1, EventStatus::Cooldown, EventLevel::Info)).unwrap();
        tx.send(event(2, EventStatus::Sent, EventLevel::Info)).unwrap();
        drop(tx);
        task.await.unwrap();

        // two failures, then success; the cooldown event never reached the relay
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_jsonl_subscriber_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let (tx, rx) = broadcast::channel(16);
        let task = tokio::spawn(run_jsonl_subscriber(rx, path.to_string_lossy().to_string()));

        tx.send(event(1, EventStatus::Sent, EventLevel::Info)).unwrap();
        tx.send(event(2, EventStatus::Invalid, EventLevel::Debug)).unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Event> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].status, EventStatus::Invalid);
    }
}
