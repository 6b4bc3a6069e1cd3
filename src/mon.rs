//! Monitor client.
//!
//! The monitor authenticates daemons, publishes cluster maps, receives
//! beacons, and sinks the cluster log. The transport is abstracted behind
//! [`MonitorBackend`]; [`LocalMonitor`] is the in-process implementation
//! used by the development harness and tests.

use crate::auth::RotatingSecrets;
use crate::error::{LatticeError, Result};
use crate::msg::{BeaconPayload, ClogEntry};
use crate::types::{Epoch, GlobalId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Authentication result handed back by the monitor.
#[derive(Debug, Clone)]
pub struct AuthReply {
    pub global_id: GlobalId,
    pub fsid: Uuid,
    pub rotating: RotatingSecrets,
}

/// Transport to the monitor quorum.
#[async_trait]
pub trait MonitorBackend: Send + Sync {
    async fn authenticate(&self, name: &str) -> Result<AuthReply>;
    async fn rotating_ready(&self) -> bool;
    async fn subscribe(&self, what: &str, start: Epoch);
    async fn deliver_beacon(&self, beacon: BeaconPayload) -> Result<()>;
    async fn submit_log(&self, entries: Vec<ClogEntry>) -> Result<()>;
}

/// The daemon-side monitor client.
pub struct MonClient {
    backend: Arc<dyn MonitorBackend>,
    global_id: AtomicU64,
    fsid: Mutex<Uuid>,
    rotating: Mutex<RotatingSecrets>,
    subs: Mutex<HashMap<String, SubState>>,
    stopped: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SubState {
    want: Epoch,
    got: Epoch,
}

impl MonClient {
    pub fn new(backend: Arc<dyn MonitorBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            global_id: AtomicU64::new(0),
            fsid: Mutex::new(Uuid::nil()),
            rotating: Mutex::new(RotatingSecrets::default()),
            subs: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Authenticate with the monitor, obtaining the global id, the fsid,
    /// and the first generation of rotating secrets.
    pub async fn authenticate(&self, name: &str) -> Result<GlobalId> {
        let reply = self.backend.authenticate(name).await?;
        self.global_id.store(reply.global_id.0, Ordering::SeqCst);
        *self.fsid.lock() = reply.fsid;
        *self.rotating.lock() = reply.rotating;
        info!(gid = %reply.global_id, fsid = %reply.fsid, "authenticated with monitor");
        Ok(reply.global_id)
    }

    /// Wait for usable rotating service keys, up to `timeout`.
    pub async fn wait_auth_rotating(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.rotating.lock().is_valid() && self.backend.rotating_ready().await {
                return Ok(());
            }
            if self.stopped.load(Ordering::SeqCst) {
                return Err(LatticeError::ShuttingDown);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LatticeError::KeysUnavailable(format!(
                    "not ready after {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn global_id(&self) -> GlobalId {
        GlobalId(self.global_id.load(Ordering::SeqCst))
    }

    pub fn fsid(&self) -> Uuid {
        *self.fsid.lock()
    }

    pub fn rotating_secrets(&self) -> RotatingSecrets {
        *self.rotating.lock()
    }

    /// Record interest in a subscription channel.
    pub fn sub_want(&self, what: &str, start: Epoch) {
        self.subs
            .lock()
            .entry(what.to_string())
            .or_default()
            .want = start;
    }

    /// (Re)issue all wanted subscriptions to the monitor.
    pub async fn renew_subs(&self) {
        let wanted: Vec<(String, Epoch)> = self
            .subs
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.want))
            .collect();
        for (what, start) in wanted {
            self.backend.subscribe(&what, start).await;
        }
    }

    /// Advance a subscription watermark after consuming an epoch.
    pub fn sub_got(&self, what: &str, epoch: Epoch) {
        let mut subs = self.subs.lock();
        let entry = subs.entry(what.to_string()).or_default();
        if epoch > entry.got {
            entry.got = epoch;
            debug!(what, epoch, "subscription watermark advanced");
        }
    }

    pub async fn send_beacon(&self, beacon: BeaconPayload) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LatticeError::ShuttingDown);
        }
        self.backend.deliver_beacon(beacon).await
    }

    pub async fn submit_log(&self, entries: Vec<ClogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.backend.submit_log(entries).await
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// In-process monitor used by the development harness and tests.
pub struct LocalMonitor {
    state: Mutex<LocalMonitorState>,
}

struct LocalMonitorState {
    next_gid: u64,
    fsid: Uuid,
    key: u64,
    rotating_ready: bool,
    fail_auth: bool,
    beacons: Vec<BeaconPayload>,
    log: Vec<ClogEntry>,
    subscriptions: Vec<(String, Epoch)>,
}

impl LocalMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LocalMonitorState {
                next_gid: 4100,
                fsid: Uuid::new_v4(),
                key: 0xfeed_face,
                rotating_ready: true,
                fail_auth: false,
                beacons: Vec::new(),
                log: Vec::new(),
                subscriptions: Vec::new(),
            }),
        })
    }

    pub fn fsid(&self) -> Uuid {
        self.state.lock().fsid
    }

    pub fn secrets(&self) -> RotatingSecrets {
        let state = self.state.lock();
        RotatingSecrets { generation: 1, key: state.key }
    }

    /// Make the next authentication attempt fail.
    pub fn set_fail_auth(&self, fail: bool) {
        self.state.lock().fail_auth = fail;
    }

    pub fn set_rotating_ready(&self, ready: bool) {
        self.state.lock().rotating_ready = ready;
    }

    /// Pin the gid that the next authentication will mint.
    pub fn set_next_gid(&self, gid: u64) {
        self.state.lock().next_gid = gid;
    }

    pub fn beacons(&self) -> Vec<BeaconPayload> {
        self.state.lock().beacons.clone()
    }

    pub fn last_beacon(&self) -> Option<BeaconPayload> {
        self.state.lock().beacons.last().cloned()
    }

    pub fn log_entries(&self) -> Vec<ClogEntry> {
        self.state.lock().log.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, Epoch)> {
        self.state.lock().subscriptions.clone()
    }
}

#[async_trait]
impl MonitorBackend for LocalMonitor {
    async fn authenticate(&self, name: &str) -> Result<AuthReply> {
        let mut state = self.state.lock();
        if state.fail_auth {
            return Err(LatticeError::AuthFailed(format!(
                "monitor rejected {}",
                name
            )));
        }
        let gid = state.next_gid;
        state.next_gid += 1;
        Ok(AuthReply {
            global_id: GlobalId(gid),
            fsid: state.fsid,
            rotating: RotatingSecrets { generation: 1, key: state.key },
        })
    }

    async fn rotating_ready(&self) -> bool {
        self.state.lock().rotating_ready
    }

    async fn subscribe(&self, what: &str, start: Epoch) {
        self.state.lock().subscriptions.push((what.to_string(), start));
    }

    async fn deliver_beacon(&self, beacon: BeaconPayload) -> Result<()> {
        self.state.lock().beacons.push(beacon);
        Ok(())
    }

    async fn submit_log(&self, entries: Vec<ClogEntry>) -> Result<()> {
        self.state.lock().log.extend(entries);
        Ok(())
    }
}
