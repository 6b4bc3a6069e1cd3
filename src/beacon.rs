//! Monitor beacon.
//!
//! Advertises `(wanted state, current state, standby hints, health)` to the
//! monitor on a periodic schedule and whenever the wanted state changes.
//! The monitor acks each delivery; an ack older than the grace period
//! makes the daemon consider itself laggy and back off background work.

use crate::error::Result;
use crate::mon::MonClient;
use crate::msg::{BeaconPayload, MdsHealth};
use crate::types::{DaemonState, Epoch, StandbyHint};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct BeaconState {
    want_state: DaemonState,
    current_state: DaemonState,
    standby_for_rank: StandbyHint,
    standby_for_name: String,
    map_epoch: Epoch,
    seq: u64,
    last_acked: Option<Instant>,
}

/// The beacon sender for one daemon.
pub struct Beacon {
    name: String,
    monc: Arc<MonClient>,
    interval: Duration,
    grace: Duration,
    state: Mutex<BeaconState>,
    health: Mutex<MdsHealth>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Beacon {
    pub fn new(
        name: impl Into<String>,
        monc: Arc<MonClient>,
        interval: Duration,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            monc,
            interval,
            grace,
            state: Mutex::new(BeaconState {
                want_state: DaemonState::Boot,
                current_state: DaemonState::Boot,
                standby_for_rank: StandbyHint::Unset,
                standby_for_name: String::new(),
                map_epoch: 0,
                seq: 0,
                last_acked: None,
            }),
            health: Mutex::new(MdsHealth::default()),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Seed beacon state and start the periodic sender.
    pub fn init(
        self: &Arc<Self>,
        map_epoch: Epoch,
        want_state: DaemonState,
        standby_for_rank: StandbyHint,
        standby_for_name: String,
    ) {
        {
            let mut state = self.state.lock();
            state.map_epoch = map_epoch;
            state.want_state = want_state;
            state.standby_for_rank = standby_for_rank;
            state.standby_for_name = standby_for_name;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let beacon = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(beacon.interval).await;
                if !beacon.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = beacon.send_now().await {
                    warn!("beacon send failed: {}", e);
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    fn build_payload(&self) -> BeaconPayload {
        let mut state = self.state.lock();
        state.seq += 1;
        BeaconPayload {
            name: self.name.clone(),
            global_id: self.monc.global_id(),
            want_state: state.want_state,
            current_state: state.current_state,
            seq: state.seq,
            map_epoch: state.map_epoch,
            standby_for_rank: state.standby_for_rank,
            standby_for_name: state.standby_for_name.clone(),
            health: self.health.lock().clone(),
        }
    }

    /// Send one beacon immediately.
    pub async fn send_now(&self) -> Result<()> {
        let payload = self.build_payload();
        debug!(seq = payload.seq, want = %payload.want_state, "sending beacon");
        self.monc.send_beacon(payload).await?;
        self.state.lock().last_acked = Some(Instant::now());
        Ok(())
    }

    /// Terminal send with a bounded wait; a timeout is tolerated because
    /// the successor daemon will report the same condition.
    pub async fn send_and_wait(&self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.send_now()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("terminal beacon failed: {}", e),
            Err(_) => warn!("terminal beacon timed out after {:?}", timeout),
        }
    }

    /// Fire an asynchronous send, e.g. right after a state change.
    pub fn kick(self: &Arc<Self>) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let beacon = self.clone();
            handle.spawn(async move {
                let _ = beacon.send_now().await;
            });
        }
    }

    pub fn set_want_state(&self, want: DaemonState) {
        self.state.lock().want_state = want;
    }

    pub fn want_state(&self) -> DaemonState {
        self.state.lock().want_state
    }

    pub fn set_current_state(&self, current: DaemonState) {
        self.state.lock().current_state = current;
    }

    /// A new cluster map was installed; future beacons carry its epoch.
    pub fn notify_mdsmap(&self, epoch: Epoch) {
        self.state.lock().map_epoch = epoch;
    }

    pub fn map_epoch(&self) -> Epoch {
        self.state.lock().map_epoch
    }

    /// Refresh the health payload carried in subsequent beacons.
    pub fn notify_health(&self, health: MdsHealth) {
        *self.health.lock() = health;
    }

    pub fn health(&self) -> MdsHealth {
        self.health.lock().clone()
    }

    /// Laggy: the monitor hasn't acked a beacon within the grace period.
    pub fn is_laggy(&self) -> bool {
        self.state
            .lock()
            .last_acked
            .map(|t| t.elapsed() > self.grace)
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
