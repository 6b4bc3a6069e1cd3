//! Object-store client.
//!
//! Maintains the daemon's view of the object-store map (epoch, up nodes,
//! advertised features) and parks waiters until a target epoch has been
//! observed. The actual data path lives in the store client library; the
//! controller only needs the map view and epoch barriers.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

use crate::types::Epoch;

/// The controller's view of the object-store map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OsdMapView {
    pub epoch: Epoch,
    pub up_nodes: u32,
    pub features: u64,
}

/// Client handle to the object store.
pub struct ObjectClient {
    map: Mutex<OsdMapView>,
    waiters: Mutex<BTreeMap<Epoch, Vec<oneshot::Sender<()>>>>,
    client_incarnation: AtomicU32,
    map_requests: AtomicU64,
    initialized: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ObjectClient {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(OsdMapView::default()),
            waiters: Mutex::new(BTreeMap::new()),
            client_incarnation: AtomicU32::new(0),
            map_requests: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn init(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn osdmap(&self) -> OsdMapView {
        *self.map.lock()
    }

    pub fn epoch(&self) -> Epoch {
        self.map.lock().epoch
    }

    /// Install a newer map view and wake waiters whose epoch is satisfied.
    pub fn install_map(&self, view: OsdMapView) {
        {
            let mut map = self.map.lock();
            if view.epoch <= map.epoch {
                return;
            }
            *map = view;
        }
        debug!(epoch = view.epoch, up = view.up_nodes, "object-store map installed");

        let mut waiters = self.waiters.lock();
        let satisfied: Vec<Epoch> = waiters
            .range(..=view.epoch)
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in satisfied {
            if let Some(list) = waiters.remove(&epoch) {
                for tx in list {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Wait until a map with epoch >= `target` has been installed.
    ///
    /// Returns immediately if the target epoch has already been observed.
    pub async fn wait_for_map(&self, target: Epoch) {
        let rx = {
            let map = self.map.lock();
            if map.epoch >= target {
                return;
            }
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().entry(target).or_default().push(tx);
            rx
        };
        // A shutdown drops the waiter list; treat that as satisfied.
        let _ = rx.await;
    }

    /// Hint that the client wants the next map proactively.
    pub fn maybe_request_map(&self) {
        self.map_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn map_requests(&self) -> u64 {
        self.map_requests.load(Ordering::Relaxed)
    }

    pub fn set_client_incarnation(&self, incarnation: u32) {
        self.client_incarnation.store(incarnation, Ordering::SeqCst);
    }

    pub fn client_incarnation(&self) -> u32 {
        self.client_incarnation.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.waiters.lock().clear();
    }
}

impl Default for ObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::FEATURE_OMAP;

    #[test]
    fn test_install_ignores_stale_epochs() {
        let client = ObjectClient::new();
        client.install_map(OsdMapView { epoch: 5, up_nodes: 3, features: FEATURE_OMAP });
        client.install_map(OsdMapView { epoch: 4, up_nodes: 9, features: 0 });
        assert_eq!(client.osdmap().epoch, 5);
        assert_eq!(client.osdmap().up_nodes, 3);
    }

    #[tokio::test]
    async fn test_wait_for_map_already_satisfied() {
        let client = ObjectClient::new();
        client.install_map(OsdMapView { epoch: 10, up_nodes: 1, features: FEATURE_OMAP });
        // Must not block.
        client.wait_for_map(7).await;
    }

    #[tokio::test]
    async fn test_wait_for_map_wakes_on_install() {
        let client = std::sync::Arc::new(ObjectClient::new());
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.wait_for_map(3).await })
        };
        tokio::task::yield_now().await;
        client.install_map(OsdMapView { epoch: 3, up_nodes: 1, features: FEATURE_OMAP });
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
