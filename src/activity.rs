//! Activity detection by hashing terminal screen snapshots.
//!
//! The contract is change-of-snapshot implies activity. Snapshots are
//! plain visible text (escape sequences already stripped by the capture
//! path), hashed with sha256 so color-only idle animations cannot alias
//! into busy state.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Seconds without a snapshot change before busy clears.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityTransition {
    /// Snapshot changed while the agent was considered idle.
    BecameBusy,
    /// Quiet window elapsed with no change.
    BecameIdle,
    /// No state change.
    None,
}

#[derive(Debug)]
pub struct ActivityHasher {
    quiet_window: Duration,
    last_hash: Option<[u8; 32]>,
    last_change: Option<Instant>,
    busy: bool,
}

impl ActivityHasher {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            quiet_window,
            last_hash: None,
            last_change: None,
            busy: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    /// Feed one snapshot and report the resulting transition.
    pub fn observe(&mut self, snapshot: &[u8]) -> ActivityTransition {
        self.observe_at(snapshot, Instant::now())
    }

    pub fn observe_at(&mut self, snapshot: &[u8], now: Instant) -> ActivityTransition {
        let hash: [u8; 32] = Sha256::digest(snapshot).into();
        let changed = match self.last_hash {
            // The first snapshot establishes the baseline; drawing the
            // initial screen is not activity.
            None => false,
            Some(previous) => previous != hash,
        };
        self.last_hash = Some(hash);

        if changed {
            self.last_change = Some(now);
            if !self.busy {
                self.busy = true;
                return ActivityTransition::BecameBusy;
            }
            return ActivityTransition::None;
        }

        if self.busy {
            let quiet_for = self
                .last_change
                .map(|at| now.duration_since(at))
                .unwrap_or(Duration::ZERO);
            if quiet_for >= self.quiet_window {
                self.busy = false;
                return ActivityTransition::BecameIdle;
            }
        }
        ActivityTransition::None
    }

    /// How long the screen has been static, as seen from `now`.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_change.map(|at| now.duration_since(at))
    }
}

impl Default for ActivityHasher {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_snapshot_is_baseline_not_activity() {
        let mut hasher = ActivityHasher::default();
        assert_eq!(hasher.observe(b"prompt>"), ActivityTransition::None);
        assert!(!hasher.is_busy());
    }

    #[test]
    fn change_sets_busy_once() {
        let mut hasher = ActivityHasher::default();
        let t0 = Instant::now();
        hasher.observe_at(b"prompt>", t0);
        assert_eq!(
            hasher.observe_at(b"prompt> working", t0 + Duration::from_secs(1)),
            ActivityTransition::BecameBusy
        );
        // Further changes keep busy without re-reporting.
        assert_eq!(
            hasher.observe_at(b"prompt> working..", t0 + Duration::from_secs(2)),
            ActivityTransition::None
        );
        assert!(hasher.is_busy());
    }

    #[test]
    fn quiet_window_clears_busy() {
        let mut hasher = ActivityHasher::new(Duration::from_secs(10));
        let t0 = Instant::now();
        hasher.observe_at(b"a", t0);
        hasher.observe_at(b"b", t0 + Duration::from_secs(1));
        assert!(hasher.is_busy());
        // Static screen, but inside the quiet window.
        assert_eq!(
            hasher.observe_at(b"b", t0 + Duration::from_secs(5)),
            ActivityTransition::None
        );
        assert_eq!(
            hasher.observe_at(b"b", t0 + Duration::from_secs(12)),
            ActivityTransition::BecameIdle
        );
        assert!(!hasher.is_busy());
    }

    #[test]
    fn identical_snapshots_never_wake() {
        let mut hasher = ActivityHasher::default();
        for _ in 0..5 {
            assert_eq!(hasher.observe(b"same"), ActivityTransition::None);
        }
        assert!(!hasher.is_busy());
    }

    #[test]
    fn idle_for_tracks_last_change() {
        let mut hasher = ActivityHasher::default();
        let t0 = Instant::now();
        hasher.observe_at(b"a", t0);
        hasher.observe_at(b"b", t0 + Duration::from_secs(2));
        let idle = hasher.idle_for(t0 + Duration::from_secs(30)).unwrap();
        assert_eq!(idle, Duration::from_secs(28));
    }
}
