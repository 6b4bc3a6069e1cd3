//! Snapshot table server and client glue.
//!
//! The rank holding the table-server role runs [`SnapServer`]; every rank
//! runs a [`SnapClient`]. The controller forwards peer recovery/failure
//! events and keeps the server's object-store map view fresh.

use crate::types::{Epoch, MdsRank};
use tracing::debug;

/// Snapshot table server (table-server rank only).
pub struct SnapServer {
    last_osdmap_epoch: Epoch,
    forced_checks: u64,
    checks: u64,
    recovered_peers: Vec<MdsRank>,
}

impl SnapServer {
    pub fn new() -> Self {
        Self {
            last_osdmap_epoch: 0,
            forced_checks: 0,
            checks: 0,
            recovered_peers: Vec::new(),
        }
    }

    /// Refresh the server's object-store map view; `force` when a new map
    /// arrived rather than from the periodic tick.
    pub fn check_osd_map(&mut self, epoch: Epoch, force: bool) {
        if force {
            self.forced_checks += 1;
        }
        self.checks += 1;
        if epoch > self.last_osdmap_epoch {
            debug!(epoch, "snap server observed new object-store map");
            self.last_osdmap_epoch = epoch;
        }
    }

    pub fn last_osdmap_epoch(&self) -> Epoch {
        self.last_osdmap_epoch
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }

    pub fn forced_checks(&self) -> u64 {
        self.forced_checks
    }

    pub fn handle_mds_recovery(&mut self, peer: MdsRank) {
        self.recovered_peers.push(peer);
    }

    pub fn recovered_peers(&self) -> &[MdsRank] {
        &self.recovered_peers
    }
}

impl Default for SnapServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot table client (every rank).
pub struct SnapClient {
    failed_peers: Vec<MdsRank>,
}

impl SnapClient {
    pub fn new() -> Self {
        Self { failed_peers: Vec::new() }
    }

    /// Resend pending table requests when a peer fails over.
    pub fn handle_mds_failure(&mut self, peer: MdsRank) {
        self.failed_peers.push(peer);
    }

    pub fn failed_peers(&self) -> &[MdsRank] {
        &self.failed_peers
    }
}

impl Default for SnapClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_osdmap_view_advances() {
        let mut server = SnapServer::new();
        server.check_osd_map(5, true);
        server.check_osd_map(3, false);
        assert_eq!(server.last_osdmap_epoch(), 5);
        assert_eq!(server.forced_checks(), 1);
        assert_eq!(server.checks(), 2);
    }

    #[test]
    fn test_client_records_failures() {
        let mut client = SnapClient::new();
        client.handle_mds_failure(MdsRank(2));
        assert_eq!(client.failed_peers(), &[MdsRank(2)]);
    }
}
