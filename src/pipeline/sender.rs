// src/pipeline/sender.rs
//
// Drains the candidate queue into the recognition service at no more than
// `send_fps` requests per second, with at most `max_in_flight` requests
// outstanding. Each reading goes to the gate engine and, when it looks
// like a plate, back to the detection loop.
//
// A candidate is only taken once a rate slot and an in-flight permit are
// free, and it is always the newest one queued. Tracks already read as a
// plate that is cooling down or was sent within `plate_resend_sec` are
// skipped without an OCR call.
//
// Failed requests are counted and dropped, never retried.

use super::candidate_queue::CandidateQueue;
use super::detection_loop::Feedback;
use super::metrics::PipelineMetrics;
use super::rate_gate::RateGate;
use crate::gate::{Event, EventStatus, GateEngine};
use crate::remote_recognition::{build_request, RecognitionClient};
use crate::selection::Candidate;
use crate::types::{Clock, SenderConfig};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct PlateSender<C: RecognitionClient> {
    queue: Arc<CandidateQueue>,
    dispatcher: Arc<Dispatcher<C>>,
    send_interval: Duration,
    max_in_flight: usize,
    max_age: f64,
}

struct Dispatcher<C: RecognitionClient> {
    client: Arc<C>,
    engine: Arc<GateEngine>,
    feedback: mpsc::Sender<Feedback>,
    cfg: SenderConfig,
    camera_id: String,
    clock: Clock,
    metrics: PipelineMetrics,
    warn_gate: Mutex<RateGate>,
    decision_gate: Mutex<RateGate>,
}

impl<C: RecognitionClient> PlateSender<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<C>,
        engine: Arc<GateEngine>,
        queue: Arc<CandidateQueue>,
        feedback: mpsc::Sender<Feedback>,
        cfg: SenderConfig,
        camera_id: String,
        clock: Clock,
        metrics: PipelineMetrics,
    ) -> Self {
        let send_interval = Duration::from_secs_f64(1.0 / cfg.send_fps.max(0.01));
        let max_in_flight = cfg.max_in_flight.max(1);
        let max_age = cfg.max_candidate_age_sec;
        let dispatcher = Dispatcher {
            client,
            engine,
            feedback,
            warn_gate: Mutex::new(RateGate::new(cfg.warn_every_sec)),
            decision_gate: Mutex::new(RateGate::new(cfg.decision_log_every_sec)),
            cfg,
            camera_id,
            clock,
            metrics,
        };
        Self {
            queue,
            dispatcher: Arc::new(dispatcher),
            send_interval,
            max_in_flight,
            max_age,
        }
    }

    /// Runs until the queue is closed, then waits for in-flight requests.
    pub async fn run(self) {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();
        let mut next_allowed = Instant::now();

        info!(
            "✓ Sender running ({:.1} req/s, {} in flight)",
            1.0 / self.send_interval.as_secs_f64(),
            self.max_in_flight
        );

        loop {
            tokio::time::sleep_until(next_allowed).await;
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let Some(candidate) = self
                .queue
                .pop_newest(&self.dispatcher.clock, self.max_age)
                .await
            else {
                break;
            };
            if self.dispatcher.resend_blocked(&candidate) {
                continue;
            }
            next_allowed = Instant::now() + self.send_interval;

            // Reap finished dispatches so the set does not grow
            while in_flight.try_join_next().is_some() {}

            let dispatcher = Arc::clone(&self.dispatcher);
            in_flight.spawn(async move {
                dispatcher.dispatch(candidate).await;
                drop(permit);
            });
        }

        if !in_flight.is_empty() {
            info!("Waiting for {} in-flight recognition request(s)", in_flight.len());
        }
        while in_flight.join_next().await.is_some() {}
        info!("Sender stopped");
    }
}

impl<C: RecognitionClient> Dispatcher<C> {
    fn resend_blocked(&self, candidate: &Candidate) -> bool {
        let Some(plate) = candidate.plate_hint.as_deref() else {
            return false;
        };
        let now = self.clock.now();
        let why = if self.engine.in_cooldown(plate, now) {
            "in cooldown"
        } else if self.cfg.plate_resend_sec > 0.0
            && self
                .engine
                .last_sent(plate)
                .is_some_and(|t| now - t < self.cfg.plate_resend_sec)
        {
            "sent recently"
        } else {
            return false;
        };
        self.metrics.inc(&self.metrics.resend_skipped);
        debug!("Skipping track {} ({} {})", candidate.track_id, plate, why);
        true
    }

    async fn dispatch(&self, candidate: Candidate) {
        let track_id = candidate.track_id;
        let reading = match self.recognize(&candidate).await {
            Ok(r) => r,
            Err(e) => {
                self.metrics.inc(&self.metrics.ocr_failures);
                let now = self.clock.now();
                let mut gate = self.warn_gate.lock().unwrap_or_else(|p| p.into_inner());
                if gate.allow(now) {
                    let suppressed = gate.take_suppressed();
                    warn!(
                        "Recognition failed for track {}: {:#} ({} similar suppressed)",
                        track_id, e, suppressed
                    );
                }
                return;
            }
        };

        let now = self.clock.now();
        let event = self.engine.process(&reading, now, self.clock.wall(now));
        self.metrics.record_event(event.status);

        if is_plate_like(&event) {
            let fb = Feedback {
                track_id,
                plate: event.plate_normalized.clone(),
                confidence: event.confidence,
            };
            if self.feedback.try_send(fb).is_err() {
                debug!("Feedback channel full, dropped reading for track {}", track_id);
            }
        }

        let mut gate = self.decision_gate.lock().unwrap_or_else(|p| p.into_inner());
        if gate.allow(now) {
            info!(
                "Decision track={} plate={} status={} reason={} conf={:.2}",
                track_id,
                if event.plate_normalized.is_empty() { "-" } else { event.plate_normalized.as_str() },
                event.status.as_str(),
                event.reason,
                event.confidence
            );
        }
    }

    async fn recognize(&self, candidate: &Candidate) -> Result<crate::gate::PlateReading> {
        let request = build_request(candidate, &self.camera_id, &self.cfg)?;
        self.metrics.inc(&self.metrics.ocr_requests);

        let started = std::time::Instant::now();
        let timeout = Duration::from_secs_f64(self.cfg.timeout_sec);
        let response = tokio::time::timeout(timeout, self.client.recognize(&request))
            .await
            .map_err(|_| anyhow!("no answer within {:.1}s", timeout.as_secs_f64()))??;
        self.metrics
            .set_timing(&self.metrics.ocr_time_us, started.elapsed().as_micros() as u64);

        debug!(
            "Recognition {} → {:?} ({:.2})",
            request.request_id, response.text, response.confidence
        );
        Ok(response.into_reading(candidate.track_id, request.request_id))
    }
}

/// Readings worth feeding back: anything that passed validation, plus
/// readings still waiting for confirmation.
fn is_plate_like(event: &Event) -> bool {
    !event.plate_normalized.is_empty()
        && (event.status != EventStatus::Invalid || event.reason == "not_enough_hits")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::plate::PlateRules;
    use crate::gate::whitelist::Whitelist;
    use crate::remote_recognition::{RecognitionRequest, RecognitionResponse};
    use crate::types::GateConfig;
    use anyhow::bail;
    use image::RgbImage;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PLATE: &str = "А123ВС77";

    #[derive(Clone)]
    enum Reply {
        Text(&'static str, f32),
        Fail,
    }

    struct FakeOcr {
        reply: Reply,
        delay: Duration,
        calls: AtomicU32,
        finished: AtomicU32,
        /// Track ids in the order requests arrived
        order: Mutex<Vec<u32>>,
    }

    impl FakeOcr {
        fn new(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply,
                delay,
                calls: AtomicU32::new(0),
                finished: AtomicU32::new(0),
                order: Mutex::new(Vec::new()),
            })
        }

        fn order(&self) -> Vec<u32> {
            self.order.lock().unwrap().clone()
        }
    }

    impl RecognitionClient for FakeOcr {
        async fn recognize(&self, request: &RecognitionRequest) -> Result<RecognitionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(request.track_id);
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Reply::Text(text, conf) => Ok(RecognitionResponse {
                    text: text.to_string(),
                    confidence: *conf,
                    ..RecognitionResponse::default()
                }),
                Reply::Fail => bail!("ocr service down"),
            }
        }
    }

    struct Harness {
        queue: Arc<CandidateQueue>,
        feedback: mpsc::Receiver<Feedback>,
        metrics: PipelineMetrics,
        clock: Clock,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(ocr: Arc<FakeOcr>, cfg: SenderConfig) -> Harness {
        let gate_cfg = GateConfig::default();
        let rules = PlateRules::from_config(&gate_cfg).unwrap();
        let whitelist = Whitelist::from_entries([PLATE], &rules);
        let engine = Arc::new(GateEngine::new(gate_cfg, "cam1".into(), rules, whitelist, None));
        let metrics = PipelineMetrics::new();
        let queue = Arc::new(CandidateQueue::new(8, metrics.clone()));
        let (fb_tx, fb_rx) = mpsc::channel(8);
        let clock = Clock::new();
        let sender = PlateSender::new(
            ocr,
            engine,
            Arc::clone(&queue),
            fb_tx,
            cfg,
            "cam1".into(),
            clock,
            metrics.clone(),
        );
        let task = tokio::spawn(sender.run());
        Harness {
            queue,
            feedback: fb_rx,
            metrics,
            clock,
            task,
        }
    }

    fn cfg() -> SenderConfig {
        SenderConfig {
            send_fps: 2.0,
            timeout_sec: 1.0,
            max_in_flight: 1,
            ..SenderConfig::default()
        }
    }

    fn cand_at(track_id: u32, frame_ts: f64, plate_hint: Option<&str>) -> Candidate {
        Candidate::new(
            track_id,
            RgbImage::new(256, 76),
            [0.0, 0.0, 200.0, 60.0],
            0.9,
            0.05,
            frame_ts,
            plate_hint.map(str::to_string),
        )
    }

    fn cand(track_id: u32) -> Candidate {
        cand_at(track_id, 0.0, None)
    }

    fn count(c: &std::sync::atomic::AtomicU64) -> u64 {
        c.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_readings_open_the_gate() {
        let ocr = FakeOcr::new(Reply::Text(PLATE, 0.95), Duration::from_millis(50));
        let mut h = start(Arc::clone(&ocr), cfg());

        h.queue.push(cand(1));
        h.queue.push(cand(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.queue.close();
        h.task.await.unwrap();

        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
        assert_eq!(count(&h.metrics.ocr_requests), 2);
        assert_eq!(count(&h.metrics.events_invalid), 1); // not_enough_hits
        assert_eq!(count(&h.metrics.events_sent), 1);

        let fb = h.feedback.try_recv().unwrap();
        assert_eq!(fb.track_id, 1);
        assert_eq!(fb.plate, PLATE);
        assert!(h.feedback.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rate_is_capped() {
        let ocr = FakeOcr::new(Reply::Text(PLATE, 0.95), Duration::ZERO);
        let h = start(Arc::clone(&ocr), cfg());

        for id in 1..=3 {
            h.queue.push(cand(id));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);

        h.queue.close();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_dropped() {
        let ocr = FakeOcr::new(Reply::Fail, Duration::ZERO);
        let mut h = start(Arc::clone(&ocr), cfg());

        h.queue.push(cand(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.queue.close();
        h.task.await.unwrap();

        assert_eq!(count(&h.metrics.ocr_failures), 1);
        assert_eq!(count(&h.metrics.events_invalid), 0);
        assert!(h.feedback.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_service_times_out() {
        let ocr = FakeOcr::new(Reply::Text(PLATE, 0.95), Duration::from_secs(10));
        let h = start(Arc::clone(&ocr), cfg());

        h.queue.push(cand(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(count(&h.metrics.ocr_failures), 1);
        assert_eq!(ocr.finished.load(Ordering::SeqCst), 0);

        h.queue.close();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drains_in_flight_request() {
        let ocr = FakeOcr::new(Reply::Text(PLATE, 0.95), Duration::from_millis(800));
        let h = start(Arc::clone(&ocr), cfg());

        h.queue.push(cand(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.queue.close();
        h.task.await.unwrap();

        assert_eq!(ocr.finished.load(Ordering::SeqCst), 1);
        assert_eq!(count(&h.metrics.events_invalid), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reading_not_fed_back() {
        let ocr = FakeOcr::new(Reply::Text("", 0.2), Duration::ZERO);
        let mut h = start(Arc::clone(&ocr), cfg());

        h.queue.push(cand(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.queue.close();
        h.task.await.unwrap();

        assert_eq!(count(&h.metrics.events_invalid), 1);
        assert!(h.feedback.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_sends_newest_first() {
        let ocr = FakeOcr::new(Reply::Text(PLATE, 0.95), Duration::from_secs(2));
        let cfg = SenderConfig {
            timeout_sec: 3.0,
            ..cfg()
        };
        let h = start(Arc::clone(&ocr), cfg);

        h.queue.push(cand_at(1, h.clock.now(), None));
        tokio::time::sleep(Duration::from_millis(100)).await;
        for id in 2..=6 {
            h.queue.push(cand_at(id, h.clock.now(), None));
        }

        // 1 is busy until 2.0 s, then 6 runs until 4.0 s; by then 2..=5 are too old
        tokio::time::sleep(Duration::from_secs(5)).await;
        h.queue.close();
        h.task.await.unwrap();

        assert_eq!(ocr.order(), vec![1, 6]);
        assert_eq!(count(&h.metrics.queue_stale), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_plate_not_resent() {
        const OTHER: &str = "В777ОР99";
        let ocr = FakeOcr::new(Reply::Text(PLATE, 0.95), Duration::from_millis(50));
        let cfg = SenderConfig {
            plate_resend_sec: 20.0,
            ..cfg()
        };
        let h = start(Arc::clone(&ocr), cfg);

        // Two readings confirm the plate at ~0.55 s; cooldown runs to ~15.55 s
        h.queue.push(cand(1));
        h.queue.push(cand(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count(&h.metrics.events_sent), 1);

        h.queue.push(cand_at(1, h.clock.now(), Some(PLATE)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
        assert_eq!(count(&h.metrics.resend_skipped), 1);

        // Another plate on a different track is unaffected
        h.queue.push(cand_at(2, h.clock.now(), Some(OTHER)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);

        // Cooldown is over at 17 s, the resend interval is not
        tokio::time::sleep(Duration::from_secs(13)).await;
        h.queue.push(cand_at(1, h.clock.now(), Some(PLATE)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);
        assert_eq!(count(&h.metrics.resend_skipped), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        h.queue.push(cand_at(1, h.clock.now(), Some(PLATE)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 4);

        h.queue.close();
        h.task.await.unwrap();
    }
}
