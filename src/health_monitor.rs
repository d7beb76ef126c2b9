//! Reply tracking and stall/loss detection for workers.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::types::RobotId;

/// Tracks outstanding requests per worker and reports workers whose reply is
/// overdue (stalled) or whose channel closed (lost).
///
/// A stalled worker keeps its handle; the next reply clears the mark. A lost
/// worker never comes back.
#[derive(Default)]
pub struct HealthMonitor {
    awaiting: HashMap<RobotId, Instant>,
    last_seen: HashMap<RobotId, Instant>,
    stalled: BTreeSet<RobotId>,
    lost: BTreeSet<RobotId>,
}

impl HealthMonitor {
    fn overdue_robots(&self, now: Instant, timeout: Duration) -> Vec<RobotId> {
        self.awaiting
            .iter()
            .filter_map(|(&robot, &since)| {
                if now.duration_since(since) >= timeout {
                    Some(robot)
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a robot is tracked; no-op if already registered.
    pub fn register_robot(&mut self, robot: RobotId) {
        self.last_seen.entry(robot).or_insert_with(Instant::now);
    }

    /// A request went out; the clock for its reply starts now. An earlier
    /// outstanding request keeps its older start.
    pub fn request_sent(&mut self, robot: RobotId) {
        self.awaiting.entry(robot).or_insert_with(Instant::now);
    }

    /// Record a reply; clears the outstanding request and any stall mark.
    pub fn heartbeat(&mut self, robot: RobotId) {
        self.last_seen.insert(robot, Instant::now());
        self.awaiting.remove(&robot);
        self.stalled.remove(&robot);
    }

    /// Mark every robot whose outstanding request exceeds the timeout as
    /// stalled, and return the newly stalled ones.
    pub fn detect_stalled(&mut self, timeout: Duration) -> BTreeSet<RobotId> {
        let now = Instant::now();
        // Collect overdue robots first to avoid mutating while iterating.
        let overdue = self.overdue_robots(now, timeout);
        let mut newly = BTreeSet::new();
        for robot in overdue {
            self.awaiting.remove(&robot);
            if self.stalled.insert(robot) {
                newly.insert(robot);
            }
        }
        newly
    }

    /// The robot's channel closed; it is excluded from now on.
    pub fn mark_lost(&mut self, robot: RobotId) -> bool {
        self.awaiting.remove(&robot);
        self.stalled.remove(&robot);
        self.lost.insert(robot)
    }

    pub fn is_lost(&self, robot: RobotId) -> bool {
        self.lost.contains(&robot)
    }

    pub fn stalled_robots(&self) -> &BTreeSet<RobotId> {
        &self.stalled
    }

    pub fn last_seen(&self, robot: RobotId) -> Option<Instant> {
        self.last_seen.get(&robot).copied()
    }

    /// Test-only hook to set deterministic timestamps without sleeping.
    #[cfg(test)]
    fn set_request_time_for_test(&mut self, robot: RobotId, instant: Instant) {
        self.awaiting.insert(robot, instant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_stall_after_timeout() {
        let mut monitor = HealthMonitor::new();
        let robot = 7;
        monitor.register_robot(robot);
        let past = Instant::now() - Duration::from_millis(50);
        monitor.set_request_time_for_test(robot, past);
        // Timeout shorter than elapsed time should mark stalled.
        let stalled = monitor.detect_stalled(Duration::from_millis(10));
        assert!(stalled.contains(&robot));
        assert!(monitor.stalled_robots().contains(&robot));
    }

    #[test]
    fn idle_robot_is_never_stalled() {
        let mut monitor = HealthMonitor::new();
        monitor.register_robot(11);
        assert!(monitor.detect_stalled(Duration::ZERO).is_empty());
    }

    #[test]
    fn heartbeat_clears_stall() {
        let mut monitor = HealthMonitor::new();
        let robot = 21;
        let past = Instant::now() - Duration::from_millis(30);
        monitor.set_request_time_for_test(robot, past);
        monitor.detect_stalled(Duration::from_millis(5));
        assert!(monitor.stalled_robots().contains(&robot));
        // A late reply should clear the stall.
        monitor.heartbeat(robot);
        assert!(!monitor.stalled_robots().contains(&robot));
        assert!(monitor.last_seen(robot).is_some());
    }

    #[test]
    fn stall_is_reported_once() {
        let mut monitor = HealthMonitor::new();
        let robot = 42;
        monitor.set_request_time_for_test(robot, Instant::now() - Duration::from_secs(5));
        assert_eq!(monitor.detect_stalled(Duration::from_secs(1)).len(), 1);
        monitor.set_request_time_for_test(robot, Instant::now() - Duration::from_secs(5));
        assert!(monitor.detect_stalled(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn lost_robot_stays_lost() {
        let mut monitor = HealthMonitor::new();
        monitor.request_sent(3);
        assert!(monitor.mark_lost(3));
        assert!(!monitor.mark_lost(3));
        assert!(monitor.is_lost(3));
        assert!(monitor.detect_stalled(Duration::ZERO).is_empty());
        assert!(!monitor.is_lost(4));
    }
}
