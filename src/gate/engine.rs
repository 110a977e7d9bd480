// src/gate/engine.rs
//
// Gate decision engine: turns one OCR reading into one Event.
//
// Per plate:  idle → counting → { sent | denied } → cooldown → idle
//
//   - `counting` decays back to idle when the confirm window lapses
//   - readings inside cooldown are reported and otherwise ignored
//   - a confirmed plate outside the whitelist is denied and still cooled
//     down, so a parked car does not produce a denial every second
//
// The confirmation map is the only state shared between concurrent
// recognition responses. Check-and-increment runs under one mutex with no
// I/O inside; whitelist lookup is an Arc snapshot taken before locking.

use crate::gate::events::{Event, EventLevel, EventStatus};
use crate::gate::plate::{is_noise, PlateRules};
use crate::gate::whitelist::Whitelist;
use crate::types::GateConfig;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// What the OCR boundary returns for one crop.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateReading {
    pub text: String,
    pub confidence: f32,
    pub region: Option<String>,
    pub track_id: Option<u32>,
    pub media_ref: Option<String>,
}

#[derive(Debug, Clone)]
struct ConfirmationState {
    count: u32,
    window_start: Option<f64>,
    last_sent: Option<f64>,
    cooldown_until: f64,
    last_touched: f64,
}

impl ConfirmationState {
    fn new(now: f64) -> Self {
        Self {
            count: 0,
            window_start: None,
            last_sent: None,
            cooldown_until: f64::NEG_INFINITY,
            last_touched: now,
        }
    }
}

#[derive(Debug, Default)]
struct ConfirmationMap {
    plates: HashMap<String, ConfirmationState>,
    last_gc: f64,
}

struct Outcome {
    status: EventStatus,
    reason: &'static str,
    level: EventLevel,
}

impl Outcome {
    fn info(status: EventStatus, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            level: EventLevel::Info,
        }
    }

    fn debug(status: EventStatus, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            level: EventLevel::Debug,
        }
    }
}

pub struct GateEngine {
    cfg: GateConfig,
    camera_id: String,
    rules: PlateRules,
    whitelist: RwLock<Arc<Whitelist>>,
    states: Mutex<ConfirmationMap>,
    seq: AtomicU64,
    events: Option<broadcast::Sender<Event>>,
}

impl GateEngine {
    pub fn new(
        cfg: GateConfig,
        camera_id: String,
        rules: PlateRules,
        whitelist: Whitelist,
        events: Option<broadcast::Sender<Event>>,
    ) -> Self {
        Self {
            cfg,
            camera_id,
            rules,
            whitelist: RwLock::new(Arc::new(whitelist)),
            states: Mutex::new(ConfirmationMap::default()),
            seq: AtomicU64::new(0),
            events,
        }
    }

    pub fn from_config(
        cfg: &GateConfig,
        camera_id: &str,
        events: Option<broadcast::Sender<Event>>,
    ) -> Result<Self> {
        let rules = PlateRules::from_config(cfg)?;
        let whitelist = Whitelist::load(std::path::Path::new(&cfg.whitelist_path), &rules)?;
        Ok(Self::new(cfg.clone(), camera_id.to_string(), rules, whitelist, events))
    }

    pub fn rules(&self) -> &PlateRules {
        &self.rules
    }

    pub fn replace_whitelist(&self, whitelist: Whitelist) {
        if let Ok(mut wl) = self.whitelist.write() {
            *wl = Arc::new(whitelist);
        }
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist_snapshot().len()
    }

    fn whitelist_snapshot(&self) -> Arc<Whitelist> {
        match self.whitelist.read() {
            Ok(wl) => Arc::clone(&wl),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Current confirmation count for a plate, if it is mid-window.
    #[cfg(test)]
    pub fn pending_count(&self, plate: &str) -> Option<u32> {
        let map = self.states.lock().unwrap_or_else(|p| p.into_inner());
        map.plates
            .get(plate)
            .filter(|s| s.count > 0)
            .map(|s| s.count)
    }

    pub fn tracked_plates(&self) -> usize {
        self.states
            .lock()
            .map(|m| m.plates.len())
            .unwrap_or_else(|p| p.into_inner().plates.len())
    }

    /// Decide on one reading. `now` is monotonic seconds, `wall` the matching
    /// wall-clock time stamped on the event.
    pub fn process(&self, reading: &PlateReading, now: f64, wall: f64) -> Event {
        let plate = self.rules.normalize(&reading.text);
        let outcome = self.decide(&plate, reading, now);

        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: wall,
            camera_id: self.camera_id.clone(),
            plate_raw: reading.text.clone(),
            plate_normalized: plate,
            confidence: reading.confidence,
            status: outcome.status,
            reason: outcome.reason.to_string(),
            level: outcome.level,
            track_id: reading.track_id,
            media_ref: reading.media_ref.clone(),
        };

        match (event.status, event.level) {
            (EventStatus::Sent | EventStatus::Denied, EventLevel::Info) => info!(
                "🚧 {} {} ({}) conf={:.2}",
                event.status.as_str().to_uppercase(),
                event.plate_normalized,
                event.reason,
                event.confidence
            ),
            _ => debug!(
                "Gate {} {} ({}) conf={:.2}",
                event.status.as_str(),
                event.plate_normalized,
                event.reason,
                event.confidence
            ),
        }

        if let Some(tx) = &self.events {
            // No subscribers is not an error
            let _ = tx.send(event.clone());
        }
        event
    }

    fn decide(&self, plate: &str, reading: &PlateReading, now: f64) -> Outcome {
        if plate.is_empty() {
            return Outcome::debug(EventStatus::Invalid, "empty");
        }
        if is_noise(plate) {
            return Outcome::debug(EventStatus::Invalid, "noise_ocr");
        }
        if let Err(rejection) = self.rules.validate(plate, reading.region.as_deref()) {
            return Outcome::info(EventStatus::Invalid, rejection.reason());
        }
        if reading.confidence < self.cfg.min_conf {
            return Outcome::info(EventStatus::Denied, "low_conf");
        }

        let whitelist = self.whitelist_snapshot();
        let mut map = self.states.lock().unwrap_or_else(|p| p.into_inner());
        self.collect_garbage(&mut map, now);

        let st = map
            .plates
            .entry(plate.to_string())
            .or_insert_with(|| ConfirmationState::new(now));
        st.last_touched = now;

        if now < st.cooldown_until {
            return Outcome::info(EventStatus::Cooldown, "cooldown");
        }

        if let Some(start) = st.window_start {
            if now - start > self.cfg.confirm_window_sec {
                debug!(
                    "Confirm window lapsed for {} at {} hit(s)",
                    plate, st.count
                );
                st.count = 0;
                st.window_start = None;
            }
        }
        if st.count == 0 {
            st.window_start = Some(now);
        }
        st.count += 1;

        if st.count < self.cfg.confirm_n {
            return Outcome::debug(EventStatus::Invalid, "not_enough_hits");
        }

        st.count = 0;
        st.window_start = None;
        if whitelist.contains(plate) {
            st.last_sent = Some(now);
            st.cooldown_until = now + self.cfg.cooldown_sec;
            Outcome::info(EventStatus::Sent, "ok")
        } else {
            st.cooldown_until = now + self.cfg.denied_cooldown();
            Outcome::info(EventStatus::Denied, "not_in_whitelist")
        }
    }

    /// Drop entries untouched for several cooldown periods. Runs at most once per cooldown.
    fn collect_garbage(&self, map: &mut ConfirmationMap, now: f64) {
        let period = self
            .cfg
            .cooldown_sec
            .max(self.cfg.denied_cooldown())
            .max(self.cfg.confirm_window_sec);
        if now - map.last_gc < period {
            return;
        }
        map.last_gc = now;

        let horizon = period * self.cfg.gc_after_cooldowns.max(1.0);
        let before = map.plates.len();
        map.plates
            .retain(|_, s| now < s.cooldown_until || now - s.last_touched <= horizon);
        let dropped = before - map.plates.len();
        if dropped > 0 {
            debug!("Gate GC: dropped {} idle plate state(s)", dropped);
        }
    }

    /// When the plate last opened the gate.
    pub fn last_sent(&self, plate: &str) -> Option<f64> {
        let map = self.states.lock().unwrap_or_else(|p| p.into_inner());
        map.plates.get(plate).and_then(|s| s.last_sent)
    }

    pub fn in_cooldown(&self, plate: &str, now: f64) -> bool {
        let map = self.states.lock().unwrap_or_else(|p| p.into_inner());
        map.plates
            .get(plate)
            .is_some_and(|s| now < s.cooldown_until)
    }
}
