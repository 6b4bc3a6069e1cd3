//! Operation tracker.
//!
//! Tracks in-flight operations for the `ops` family of admin commands and
//! keeps a bounded history of completed operations. The tick scans for
//! in-flight ops older than the complaint threshold and reports them
//! through the cluster log.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::OpTrackerConfig;

/// One in-flight operation.
#[derive(Debug, Clone)]
pub struct TrackedOp {
    pub id: u64,
    pub description: String,
    pub initiated_at: DateTime<Utc>,
    started: Instant,
}

impl TrackedOp {
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A completed operation kept for `dump_historic_ops`.
#[derive(Debug, Clone)]
struct HistoricOp {
    description: String,
    initiated_at: DateTime<Utc>,
    duration: Duration,
    finished: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    ops: BTreeMap<u64, TrackedOp>,
    history: VecDeque<HistoricOp>,
}

/// Lock-cheap op tracker shared by the dispatcher and the admin surface.
pub struct OpTracker {
    inner: Mutex<Inner>,
    settings: Mutex<OpTrackerConfig>,
    tracking_enabled: bool,
    stopped: AtomicBool,
}

impl OpTracker {
    pub fn new(settings: OpTrackerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings: Mutex::new(settings),
            tracking_enabled: true,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    /// Begin tracking an operation; returns its id.
    pub fn start_op(&self, description: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.ops.insert(
            id,
            TrackedOp {
                id,
                description: description.into(),
                initiated_at: Utc::now(),
                started: Instant::now(),
            },
        );
        id
    }

    /// Finish an operation, moving it into history.
    pub fn finish_op(&self, id: u64) {
        let (history_size, history_duration) = {
            let s = self.settings.lock();
            (s.history_size, s.history_duration)
        };
        let mut inner = self.inner.lock();
        if let Some(op) = inner.ops.remove(&id) {
            inner.history.push_back(HistoricOp {
                description: op.description,
                initiated_at: op.initiated_at,
                duration: op.started.elapsed(),
                finished: Instant::now(),
            });
            while inner.history.len() > history_size {
                inner.history.pop_front();
            }
            while inner
                .history
                .front()
                .map(|h| h.finished.elapsed() > history_duration)
                .unwrap_or(false)
            {
                inner.history.pop_front();
            }
        }
    }

    pub fn ops_in_flight(&self) -> usize {
        self.inner.lock().ops.len()
    }

    pub fn dump_ops_in_flight(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let ops: Vec<serde_json::Value> = inner
            .ops
            .values()
            .map(|op| {
                json!({
                    "id": op.id,
                    "description": op.description,
                    "initiated_at": op.initiated_at.to_rfc3339(),
                    "age_ms": op.age().as_millis() as u64,
                })
            })
            .collect();
        json!({ "num_ops": ops.len(), "ops": ops })
    }

    pub fn dump_historic_ops(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let ops: Vec<serde_json::Value> = inner
            .history
            .iter()
            .map(|op| {
                json!({
                    "description": op.description,
                    "initiated_at": op.initiated_at.to_rfc3339(),
                    "duration_ms": op.duration.as_millis() as u64,
                })
            })
            .collect();
        json!({ "num_ops": ops.len(), "ops": ops })
    }

    /// Scan for slow in-flight ops; returns at most `log_threshold` warnings.
    pub fn check_ops_in_flight(&self) -> Vec<String> {
        let (complaint_time, log_threshold) = {
            let s = self.settings.lock();
            (s.complaint_time, s.log_threshold)
        };
        let inner = self.inner.lock();
        inner
            .ops
            .values()
            .filter(|op| op.age() > complaint_time)
            .take(log_threshold)
            .map(|op| {
                format!(
                    "slow request {:.3?} seconds old, currently {}",
                    op.age(),
                    op.description
                )
            })
            .collect()
    }

    pub fn set_complaint_and_threshold(&self, complaint_time: Duration, log_threshold: usize) {
        let mut s = self.settings.lock();
        s.complaint_time = complaint_time;
        s.log_threshold = log_threshold;
    }

    pub fn set_history_size_and_duration(&self, size: usize, duration: Duration) {
        let mut s = self.settings.lock();
        s.history_size = size;
        s.history_duration = duration;
    }

    pub fn on_shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> OpTracker {
        OpTracker::new(OpTrackerConfig::default())
    }

    #[test]
    fn test_start_finish_moves_to_history() {
        let t = tracker();
        let id = t.start_op("client_request(getattr)");
        assert_eq!(t.ops_in_flight(), 1);
        t.finish_op(id);
        assert_eq!(t.ops_in_flight(), 0);
        let dump = t.dump_historic_ops();
        assert_eq!(dump["num_ops"], 1);
    }

    #[test]
    fn test_history_bounded_by_size() {
        let t = tracker();
        t.set_history_size_and_duration(3, Duration::from_secs(600));
        for i in 0..10 {
            let id = t.start_op(format!("op{}", i));
            t.finish_op(id);
        }
        assert_eq!(t.dump_historic_ops()["num_ops"], 3);
    }

    #[test]
    fn test_slow_op_warnings_respect_threshold() {
        let t = tracker();
        t.set_complaint_and_threshold(Duration::from_millis(0), 2);
        for i in 0..5 {
            t.start_op(format!("op{}", i));
        }
        std::thread::sleep(Duration::from_millis(5));
        let warnings = t.check_ops_in_flight();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("slow request"));
    }

    #[test]
    fn test_shutdown_clears_ops() {
        let t = tracker();
        t.start_op("x");
        t.on_shutdown();
        assert_eq!(t.ops_in_flight(), 0);
    }
}
