//! Decision cores for the wrapper's health and server-restart watchers.
//!
//! The async loops in the wrapper feed observations in; these structs hold
//! the counters and windows so the escalation rules stay testable without
//! a network or a clock.

use std::time::{Duration, Instant};

/// Why a health watcher decided to kill the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReason {
    HttpUnreachable { failures: u32 },
    SseUnreachable { failures: u32 },
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillReason::HttpUnreachable { failures } => {
                write!(f, "MCP HTTP probe failed {failures} times in a row")
            }
            KillReason::SseUnreachable { failures } => {
                write!(f, "MCP SSE probe failed {failures} times in a row")
            }
        }
    }
}

/// Two independent consecutive-failure counters. A success on one
/// transport never resets the other.
#[derive(Debug)]
pub struct HealthCounters {
    http_failures: u32,
    sse_failures: u32,
    http_threshold: u32,
    sse_threshold: u32,
}

impl HealthCounters {
    pub fn new(http_threshold: u32, sse_threshold: u32) -> Self {
        Self {
            http_failures: 0,
            sse_failures: 0,
            http_threshold,
            sse_threshold,
        }
    }

    pub fn record_http(&mut self, ok: bool) -> Option<KillReason> {
        if ok {
            self.http_failures = 0;
            return None;
        }
        self.http_failures += 1;
        if self.http_failures >= self.http_threshold {
            let failures = self.http_failures;
            self.http_failures = 0;
            return Some(KillReason::HttpUnreachable { failures });
        }
        None
    }

    pub fn record_sse(&mut self, ok: bool) -> Option<KillReason> {
        if ok {
            self.sse_failures = 0;
            return None;
        }
        self.sse_failures += 1;
        if self.sse_failures >= self.sse_threshold {
            let failures = self.sse_failures;
            self.sse_failures = 0;
            return Some(KillReason::SseUnreachable { failures });
        }
        None
    }

    pub fn http_failures(&self) -> u32 {
        self.http_failures
    }

    pub fn sse_failures(&self) -> u32 {
        self.sse_failures
    }
}

/// Watches the `server_started_at` stamp. One change could be anything;
/// two confirmed changes inside the window mean the hub really restarted
/// and cached MCP session ids are stale. The remedy is a controlled
/// interrupt so the agent reconnects, never a kill.
#[derive(Debug)]
pub struct RestartWatcher {
    window: Duration,
    last_value: Option<String>,
    changes: Vec<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartSignal {
    None,
    /// Send C-c to the session so the agent reconnects.
    Interrupt,
}

impl RestartWatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_value: None,
            changes: Vec::new(),
        }
    }

    pub fn observe(&mut self, value: Option<&str>) -> RestartSignal {
        self.observe_at(value, Instant::now())
    }

    pub fn observe_at(&mut self, value: Option<&str>, now: Instant) -> RestartSignal {
        self.changes.retain(|at| now.duration_since(*at) < self.window);

        let Some(value) = value else {
            // Stamp file missing: nothing to compare against.
            return RestartSignal::None;
        };

        let changed = match self.last_value.as_deref() {
            None => false, // first read is the baseline
            Some(previous) => previous != value,
        };
        self.last_value = Some(value.to_string());

        if !changed {
            return RestartSignal::None;
        }

        self.changes.push(now);
        if self.changes.len() >= 2 {
            self.changes.clear();
            return RestartSignal::Interrupt;
        }
        RestartSignal::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_kill_fires_at_threshold() {
        let mut counters = HealthCounters::new(10, 5);
        for _ in 0..9 {
            assert_eq!(counters.record_http(false), None);
        }
        assert_eq!(
            counters.record_http(false),
            Some(KillReason::HttpUnreachable { failures: 10 })
        );
        // Counter reset after the kill decision.
        assert_eq!(counters.http_failures(), 0);
    }

    #[test]
    fn success_resets_the_streak() {
        let mut counters = HealthCounters::new(10, 5);
        for _ in 0..4 {
            assert_eq!(counters.record_sse(false), None);
        }
        assert_eq!(counters.record_sse(true), None);
        assert_eq!(counters.sse_failures(), 0);
        // Starting over needs the full run again.
        for _ in 0..4 {
            assert_eq!(counters.record_sse(false), None);
        }
        assert_eq!(
            counters.record_sse(false),
            Some(KillReason::SseUnreachable { failures: 5 })
        );
    }

    #[test]
    fn transports_count_independently() {
        let mut counters = HealthCounters::new(10, 5);
        for _ in 0..4 {
            counters.record_http(false);
            counters.record_sse(false);
        }
        // HTTP success must not rescue the SSE streak.
        counters.record_http(true);
        assert_eq!(
            counters.record_sse(false),
            Some(KillReason::SseUnreachable { failures: 5 })
        );
    }

    #[test]
    fn restart_single_change_is_noise() {
        let mut watcher = RestartWatcher::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(watcher.observe_at(Some("100"), t0), RestartSignal::None);
        assert_eq!(
            watcher.observe_at(Some("200"), t0 + Duration::from_secs(10)),
            RestartSignal::None
        );
        // The stamp settles: still nothing.
        assert_eq!(
            watcher.observe_at(Some("200"), t0 + Duration::from_secs(20)),
            RestartSignal::None
        );
    }

    #[test]
    fn restart_two_changes_in_window_interrupts_once() {
        let mut watcher = RestartWatcher::new(Duration::from_secs(60));
        let t0 = Instant::now();
        watcher.observe_at(Some("100"), t0);
        assert_eq!(
            watcher.observe_at(Some("200"), t0 + Duration::from_secs(10)),
            RestartSignal::None
        );
        assert_eq!(
            watcher.observe_at(Some("300"), t0 + Duration::from_secs(20)),
            RestartSignal::Interrupt
        );
        // No further signal without new changes.
        assert_eq!(
            watcher.observe_at(Some("300"), t0 + Duration::from_secs(30)),
            RestartSignal::None
        );
    }

    #[test]
    fn restart_changes_outside_window_do_not_accumulate() {
        let mut watcher = RestartWatcher::new(Duration::from_secs(60));
        let t0 = Instant::now();
        watcher.observe_at(Some("100"), t0);
        watcher.observe_at(Some("200"), t0 + Duration::from_secs(10));
        // Second change arrives long after the first aged out.
        assert_eq!(
            watcher.observe_at(Some("300"), t0 + Duration::from_secs(120)),
            RestartSignal::None
        );
    }

    #[test]
    fn restart_missing_stamp_is_ignored() {
        let mut watcher = RestartWatcher::new(Duration::from_secs(60));
        let t0 = Instant::now();
        assert_eq!(watcher.observe_at(None, t0), RestartSignal::None);
        assert_eq!(watcher.observe_at(Some("100"), t0), RestartSignal::None);
    }
}
