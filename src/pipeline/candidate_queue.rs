// src/pipeline/candidate_queue.rs
//
// Hand-off from the detection loop to the sender. Bounded and lossy:
// pushing never waits, a full queue drops its oldest candidate, and the
// sender always takes the newest one. Crops whose frame has aged past the
// cutoff are discarded instead of sent.

use super::metrics::PipelineMetrics;
use crate::selection::Candidate;
use crate::types::Clock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

pub struct CandidateQueue {
    items: Mutex<VecDeque<Candidate>>,
    max_pending: usize,
    notify: Notify,
    closed: AtomicBool,
    metrics: PipelineMetrics,
}

impl CandidateQueue {
    pub fn new(max_pending: usize, metrics: PipelineMetrics) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(max_pending)),
            max_pending,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn push(&self, candidate: Candidate) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            if items.len() >= self.max_pending {
                warn!(
                    "Candidate queue full ({} pending), dropping oldest",
                    self.max_pending
                );
                items.pop_front();
                self.metrics.inc(&self.metrics.queue_dropped);
            }
            items.push_back(candidate);
        }
        // Single consumer: a stored permit covers a push that lands before it waits
        self.notify.notify_one();
    }

    /// Newest candidate younger than `max_age` seconds, waiting if there is
    /// none. `None` once closed; anything still queued then is discarded.
    pub async fn pop_newest(&self, clock: &Clock, max_age: f64) -> Option<Candidate> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(candidate) = self.take_newest(clock.now() - max_age) {
                return Some(candidate);
            }
            self.notify.notified().await;
        }
    }

    /// Newest candidate whose frame is not older than `stale_before`.
    /// Older entries are dropped on the way.
    pub fn take_newest(&self, stale_before: f64) -> Option<Candidate> {
        let (next, stale) = {
            let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            let before = items.len();
            items.retain(|c| c.frame_ts >= stale_before);
            let stale = before - items.len();
            (items.pop_back(), stale)
        };
        if stale > 0 {
            debug!("Discarded {} stale candidate(s)", stale);
            self.metrics.add(&self.metrics.queue_stale, stale as u64);
        }
        next
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dropped = {
            let mut items = self.items.lock().unwrap_or_else(|p| p.into_inner());
            let n = items.len();
            items.clear();
            n
        };
        if dropped > 0 {
            debug!("Candidate queue closed with {} unsent candidate(s)", dropped);
        }
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
