//! Cluster log channel.
//!
//! Operational messages that should reach the operator are written here in
//! addition to the local `tracing` output. Entries are buffered and pushed
//! to the monitor when routed there; syslog routing reuses the process
//! tracing sink with the configured level.

use crate::config::ClogConfig;
use crate::mon::MonClient;
use crate::msg::{ClogEntry, ClogLevel};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Cap on buffered entries awaiting a monitor flush.
const MAX_BUFFERED: usize = 1024;

/// Routed operational log channel.
pub struct ClusterLog {
    monc: Arc<MonClient>,
    routing: RwLock<ClogConfig>,
    buffer: Mutex<VecDeque<ClogEntry>>,
}

impl ClusterLog {
    pub fn new(monc: Arc<MonClient>, routing: ClogConfig) -> Arc<Self> {
        Arc::new(Self {
            monc,
            routing: RwLock::new(routing),
            buffer: Mutex::new(VecDeque::new()),
        })
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(ClogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(ClogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(ClogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(ClogLevel::Error, message.into());
    }

    fn log(&self, level: ClogLevel, message: String) {
        let routing = self.routing.read();
        if routing.to_syslog {
            match level {
                ClogLevel::Error => error!(target: "clog", "{}", message),
                ClogLevel::Warn => warn!(target: "clog", "{}", message),
                _ => info!(target: "clog", "{}", message),
            }
        } else {
            info!(target: "clog", level = level.name(), "{}", message);
        }
        if routing.to_monitors {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= MAX_BUFFERED {
                buffer.pop_front();
            }
            buffer.push_back(ClogEntry {
                level,
                stamp: Utc::now(),
                message,
            });
        }
    }

    /// Apply new `clog_to_*` routing keys.
    pub fn update_config(&self, routing: ClogConfig) {
        info!(
            to_monitors = routing.to_monitors,
            to_syslog = routing.to_syslog,
            "cluster log routing updated"
        );
        *self.routing.write() = routing;
    }

    /// Push buffered entries to the monitor.
    pub async fn flush(&self) {
        let entries: Vec<ClogEntry> = self.buffer.lock().drain(..).collect();
        if let Err(e) = self.monc.submit_log(entries).await {
            warn!("failed to flush cluster log to monitor: {}", e);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mon::LocalMonitor;

    #[tokio::test]
    async fn test_buffer_and_flush() {
        let mon = LocalMonitor::new();
        let monc = MonClient::new(mon.clone());
        let clog = ClusterLog::new(monc, ClogConfig::default());

        clog.warn("slow request 31.2 seconds old");
        clog.info("cluster recovered");
        assert_eq!(clog.buffered(), 2);

        clog.flush().await;
        assert_eq!(clog.buffered(), 0);
        let entries = mon.log_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, ClogLevel::Warn);
    }

    #[tokio::test]
    async fn test_monitor_routing_disabled() {
        let mon = LocalMonitor::new();
        let monc = MonClient::new(mon.clone());
        let clog = ClusterLog::new(
            monc,
            ClogConfig { to_monitors: false, ..ClogConfig::default() },
        );
        clog.error("not routed");
        assert_eq!(clog.buffered(), 0);
    }

    #[tokio::test]
    async fn test_update_config_switches_routing() {
        let mon = LocalMonitor::new();
        let monc = MonClient::new(mon);
        let clog = ClusterLog::new(
            monc,
            ClogConfig { to_monitors: false, ..ClogConfig::default() },
        );
        clog.update_config(ClogConfig::default());
        clog.info("now buffered");
        assert_eq!(clog.buffered(), 1);
    }
}
