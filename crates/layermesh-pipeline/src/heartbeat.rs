//! Worker liveness.
//!
//! Default: 5-second heartbeat interval, 3× timeout (15 seconds).
//! A worker that misses three consecutive heartbeats is reported by
//! [`HeartbeatMonitor::check_timeouts`] and marked unhealthy by the
//! coordinator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks the last heartbeat of every registered worker.
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    /// `node_id → last heartbeat time`
    last_seen: HashMap<String, Instant>,
}

impl HeartbeatMonitor {
    pub fn new(interval_secs: u64, timeout_factor: u32) -> Self {
        Self::with_interval(Duration::from_secs(interval_secs), timeout_factor)
    }

    pub fn with_interval(interval: Duration, timeout_factor: u32) -> Self {
        Self {
            interval,
            timeout: interval * timeout_factor,
            last_seen: HashMap::new(),
        }
    }

    /// Record a heartbeat for a node. Resets its timeout clock.
    pub fn record_heartbeat(&mut self, node_id: &str) {
        self.last_seen.insert(node_id.to_string(), Instant::now());
    }

    /// Nodes whose last heartbeat is older than the timeout. They stay
    /// tracked until [`Self::remove`] is called.
    pub fn check_timeouts(&self) -> Vec<String> {
        let now = Instant::now();
        let mut timed_out: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > self.timeout)
            .map(|(id, _)| id.clone())
            .collect();
        timed_out.sort();
        timed_out
    }

    pub fn is_alive(&self, node_id: &str) -> bool {
        match self.last_seen.get(node_id) {
            Some(last) => Instant::now().duration_since(*last) <= self.timeout,
            None => false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }

    /// Stop tracking a node.
    pub fn remove(&mut self, node_id: &str) {
        self.last_seen.remove(node_id);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_node_is_alive() {
        let mut hb = HeartbeatMonitor::new(5, 3);
        hb.record_heartbeat("worker-1");
        assert!(hb.is_alive("worker-1"));
        assert!(!hb.is_alive("worker-2"));
        assert!(hb.check_timeouts().is_empty());
    }

    #[test]
    fn silent_node_times_out() {
        let mut hb = HeartbeatMonitor::with_interval(Duration::from_millis(5), 2);
        hb.record_heartbeat("quiet");
        std::thread::sleep(Duration::from_millis(20));
        hb.record_heartbeat("chatty");
        assert_eq!(hb.check_timeouts(), vec!["quiet".to_string()]);
        assert!(!hb.is_alive("quiet"));
        assert!(hb.is_alive("chatty"));
    }

    #[test]
    fn remove_stops_tracking() {
        let mut hb = HeartbeatMonitor::new(5, 3);
        hb.record_heartbeat("w");
        hb.remove("w");
        assert_eq!(hb.tracked(), 0);
        assert!(!hb.is_alive("w"));
    }

    #[test]
    fn durations() {
        let hb = HeartbeatMonitor::new(5, 3);
        assert_eq!(hb.interval(), Duration::from_secs(5));
        assert_eq!(hb.timeout(), Duration::from_secs(15));
    }
}
