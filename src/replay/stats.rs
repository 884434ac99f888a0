//! Stats windows: rcode histogram + latency histogram over requests/answers,
//! kept in a rotatable `current` window and a cumulative `sum` window.
//!
//! Grounded in `common.c`'s `_request_answered`, which increments
//! `dnssim->stats_current` and `dnssim->stats_sum` together on every
//! completion. `maybe_rotate_stats` implements the periodic rollover
//! `internal.h`'s `stats_timer` field drives in the original main loop.

use crate::replay::packet::ResponseCode;

#[derive(Debug, Clone)]
pub struct RcodeHistogram {
    counts: [u64; 20],
}

impl RcodeHistogram {
    fn new() -> Self {
        RcodeHistogram { counts: [0; 20] }
    }

    pub fn record(&mut self, code: ResponseCode) {
        self.counts[code.index()] += 1;
    }

    pub fn get(&self, code: ResponseCode) -> u64 {
        self.counts[code.index()]
    }
}

/// Latency histogram indexed by integer millisecond, clamped to
/// `[0, timeout_ms]`.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
}

impl LatencyHistogram {
    fn new(timeout_ms: u64) -> Self {
        LatencyHistogram { buckets: vec![0; timeout_ms as usize + 1] }
    }

    pub fn record(&mut self, latency_ms: u64) {
        let idx = (latency_ms as usize).min(self.buckets.len() - 1);
        self.buckets[idx] += 1;
    }

    pub fn get(&self, latency_ms: u64) -> u64 {
        let idx = (latency_ms as usize).min(self.buckets.len().saturating_sub(1));
        self.buckets.get(idx).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[derive(Debug, Clone)]
pub struct StatsWindow {
    pub requests: u64,
    pub ongoing: u64,
    pub answers: u64,
    pub timeouts: u64,
    pub dropped: u64,
    pub rcodes: RcodeHistogram,
    pub latency: LatencyHistogram,
}

impl StatsWindow {
    fn new(timeout_ms: u64) -> Self {
        StatsWindow {
            requests: 0,
            ongoing: 0,
            answers: 0,
            timeouts: 0,
            dropped: 0,
            rcodes: RcodeHistogram::new(),
            latency: LatencyHistogram::new(timeout_ms),
        }
    }
}

/// The two windows `Engine` exposes as read-only snapshots: `current`
/// (reset on each rollover) and `sum` (cumulative for the whole run).
#[derive(Debug, Clone)]
pub struct StatsWindows {
    pub current: StatsWindow,
    pub sum: StatsWindow,
    timeout_ms: u64,
}

impl StatsWindows {
    pub fn new(timeout_ms: u64) -> Self {
        StatsWindows {
            current: StatsWindow::new(timeout_ms),
            sum: StatsWindow::new(timeout_ms),
            timeout_ms,
        }
    }

    pub fn record_request(&mut self) {
        self.current.requests += 1;
        self.current.ongoing += 1;
        self.sum.requests += 1;
        self.sum.ongoing += 1;
    }

    pub fn record_ongoing_done(&mut self) {
        self.current.ongoing = self.current.ongoing.saturating_sub(1);
        self.sum.ongoing = self.sum.ongoing.saturating_sub(1);
    }

    pub fn record_answer(&mut self, code: ResponseCode, latency_ms: u64) {
        self.current.answers += 1;
        self.current.rcodes.record(code);
        self.current.latency.record(latency_ms);
        self.sum.answers += 1;
        self.sum.rcodes.record(code);
        self.sum.latency.record(latency_ms);
    }

    pub fn record_timeout(&mut self) {
        self.current.timeouts += 1;
        self.sum.timeouts += 1;
        self.current.latency.record(self.timeout_ms);
        self.sum.latency.record(self.timeout_ms);
    }

    pub fn record_dropped(&mut self) {
        self.current.dropped += 1;
        self.sum.dropped += 1;
    }

    /// Snapshot and zero the `current` window, folding the snapshot into
    /// `sum` (which already tracks the cumulative total independently, so
    /// this only resets `current`). Returns the pre-rotation snapshot.
    pub fn rotate(&mut self) -> StatsWindow {
        let ongoing = self.current.ongoing;
        let snapshot = std::mem::replace(&mut self.current, StatsWindow::new(self.timeout_ms));
        self.current.ongoing = ongoing;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_and_timeouts_are_mutually_exclusive_per_request() {
        let mut stats = StatsWindows::new(100);
        stats.record_request();
        stats.record_answer(ResponseCode::NoError, 10);
        assert_eq!(stats.current.answers, 1);
        assert_eq!(stats.current.timeouts, 0);
    }

    #[test]
    fn sum_keeps_accruing_across_rotation() {
        let mut stats = StatsWindows::new(1000);
        stats.record_request();
        stats.record_answer(ResponseCode::NoError, 5);
        stats.rotate();
        stats.record_request();
        stats.record_answer(ResponseCode::ServFail, 7);
        assert_eq!(stats.sum.answers, 2);
        assert_eq!(stats.current.answers, 1);
    }

    #[test]
    fn latency_clamped_to_timeout() {
        let mut hist = LatencyHistogram::new(50);
        hist.record(999);
        assert_eq!(hist.get(50), 1);
    }

    #[test]
    fn ongoing_survives_rotation() {
        let mut stats = StatsWindows::new(100);
        stats.record_request();
        stats.rotate();
        assert_eq!(stats.current.ongoing, 1);
    }
}
