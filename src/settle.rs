/* Overlay settling.
 *
 * The sensor bitmask flickers while an overlay is being slid in or out, so a
 * candidate is only committed after it has held still for the whole window. */

use std::time::{Duration, Instant};

use tracing::{debug, info};

pub const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_millis(1000);

/* Sensor bitmask meaning "nothing installed". */
pub const NO_OVERLAY: u8 = 7;

#[derive(Debug, Clone)]
pub struct OverlaySettler {
    window: Duration,
    candidate: Option<u8>,
    changed_at: Option<Instant>,
    committed: Option<u8>,
}

impl Default for OverlaySettler {
    fn default() -> Self {
        Self::new(DEFAULT_SETTLE_WINDOW)
    }
}

impl OverlaySettler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            candidate: None,
            changed_at: None,
            committed: None,
        }
    }

    /* Record the latest candidate; the clock restarts only when it differs. */
    pub fn observe(&mut self, candidate: u8, now: Instant) {
        if self.candidate != Some(candidate) {
            debug!("Overlay candidate {:?} -> {}", self.candidate, candidate);
            self.candidate = Some(candidate);
            self.changed_at = Some(now);
        }
    }

    /* Commit a candidate that has been stable for the window. Returns the
     * new committed value exactly once per change. */
    pub fn settle(&mut self, now: Instant) -> Option<u8> {
        let candidate = self.candidate?;
        let changed_at = self.changed_at?;
        if self.committed == Some(candidate) {
            return None;
        }
        if now.saturating_duration_since(changed_at) < self.window {
            return None;
        }
        info!("Overlay committed: {:?} -> {}", self.committed, candidate);
        self.committed = Some(candidate);
        Some(candidate)
    }

    /* Raw committed sensor value, if any. */
    pub fn committed(&self) -> Option<u8> {
        self.committed
    }

    /* Committed overlay slot, `None` when nothing is installed. */
    pub fn current_overlay(&self) -> Option<u8> {
        self.committed.filter(|v| *v != NO_OVERLAY)
    }

    pub fn candidate(&self) -> Option<u8> {
        self.candidate
    }

    pub fn reset(&mut self) {
        self.candidate = None;
        self.changed_at = None;
        self.committed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn brief_flip_never_commits() {
        let t0 = Instant::now();
        let mut settler = OverlaySettler::default();
        settler.observe(2, t0);
        assert_eq!(settler.settle(at(t0, 1000)), Some(2));

        settler.observe(5, at(t0, 1000));
        for ms in (1000..1500).step_by(5) {
            assert_eq!(settler.settle(at(t0, ms)), None);
        }
        settler.observe(2, at(t0, 1500));
        for ms in (1500..5000).step_by(5) {
            assert_eq!(settler.settle(at(t0, ms)), None);
        }
        assert_eq!(settler.committed(), Some(2));
    }

    #[test]
    fn stable_candidate_commits_once() {
        let t0 = Instant::now();
        let mut settler = OverlaySettler::default();
        settler.observe(5, t0);
        assert_eq!(settler.settle(at(t0, 999)), None);

        let commits: Vec<u8> = (1000..3000)
            .step_by(5)
            .filter_map(|ms| {
                settler.observe(5, at(t0, ms));
                settler.settle(at(t0, ms))
            })
            .collect();
        assert_eq!(commits, vec![5]);
    }

    #[test]
    fn unchanged_candidate_fires_nothing() {
        let t0 = Instant::now();
        let mut settler = OverlaySettler::default();
        settler.observe(3, t0);
        assert_eq!(settler.settle(at(t0, 1200)), Some(3));

        for ms in (1200..10_000).step_by(100) {
            settler.observe(3, at(t0, ms));
            assert_eq!(settler.settle(at(t0, ms)), None);
        }
    }

    #[test]
    fn no_overlay_value() {
        let t0 = Instant::now();
        let mut settler = OverlaySettler::default();
        settler.observe(NO_OVERLAY, t0);
        assert_eq!(settler.settle(at(t0, 1000)), Some(NO_OVERLAY));
        assert_eq!(settler.current_overlay(), None);

        settler.observe(0, at(t0, 2000));
        assert_eq!(settler.settle(at(t0, 3000)), Some(0));
        assert_eq!(settler.current_overlay(), Some(0));
    }

    #[test]
    fn nothing_before_first_reading() {
        let mut settler = OverlaySettler::default();
        assert_eq!(settler.settle(Instant::now()), None);
    }
}
