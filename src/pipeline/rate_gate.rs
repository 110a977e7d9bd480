// src/pipeline/rate_gate.rs
//
// "At most once per N seconds" guard for diagnostics: sanity dumps,
// reject log lines, candidate debug, decision logs, send warnings.

#[derive(Debug, Clone)]
pub struct RateGate {
    every_sec: f64,
    last: Option<f64>,
    suppressed: u64,
}

impl RateGate {
    pub fn new(every_sec: f64) -> Self {
        Self {
            every_sec: every_sec.max(0.0),
            last: None,
            suppressed: 0,
        }
    }

    /// True when the guarded side effect may run at `now` (seconds).
    pub fn allow(&mut self, now: f64) -> bool {
        match self.last {
            Some(last) if now - last < self.every_sec => {
                self.suppressed += 1;
                false
            }
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Number of calls swallowed since the last one that got through.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_allowed_then_throttled() {
        let mut gate = RateGate::new(2.0);
        assert!(gate.allow(10.0));
        assert!(!gate.allow(10.5));
        assert!(!gate.allow(11.9));
        assert!(gate.allow(12.0));
    }

    #[test]
    fn test_counts_suppressed() {
        let mut gate = RateGate::new(1.0);
        gate.allow(0.0);
        gate.allow(0.1);
        gate.allow(0.2);
        assert_eq!(gate.take_suppressed(), 2);
        assert_eq!(gate.take_suppressed(), 0);
    }

    #[test]
    fn test_zero_interval_never_throttles() {
        let mut gate = RateGate::new(0.0);
        assert!(gate.allow(1.0));
        assert!(gate.allow(1.0));
    }
}
