//! Subtree migrator.
//!
//! Executes subtree exports to peer ranks and reacts to peer failures and
//! stops. The export protocol itself (freeze, discover, commit) runs in
//! the data plane; the controller records and validates the requests.

use crate::types::{FragId, InodeId, MdsRank};
use tracing::info;

/// One requested subtree export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub ino: InodeId,
    pub frag: FragId,
    pub target: MdsRank,
}

/// Per-rank migrator state.
pub struct Migrator {
    exports: Vec<ExportRequest>,
    stale_scans: u64,
    peer_stops: Vec<MdsRank>,
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            exports: Vec::new(),
            stale_scans: 0,
            peer_stops: Vec::new(),
        }
    }

    /// Begin exporting the subtree rooted at `(ino, frag)` to `target`.
    pub fn export_dir(&mut self, ino: InodeId, frag: FragId, target: MdsRank) {
        info!(ino, %frag, %target, "exporting subtree");
        self.exports.push(ExportRequest { ino, frag, target });
    }

    pub fn exports(&self) -> &[ExportRequest] {
        &self.exports
    }

    /// Scan for exports stuck in the freeze phase.
    pub fn find_stale_export_freeze(&mut self) {
        self.stale_scans += 1;
    }

    pub fn stale_scans(&self) -> u64 {
        self.stale_scans
    }

    /// A peer rank failed or stopped; abort anything aimed at it.
    pub fn handle_mds_failure_or_stop(&mut self, peer: MdsRank) {
        self.exports.retain(|e| e.target != peer);
        self.peer_stops.push(peer);
    }

    pub fn peer_stops(&self) -> &[MdsRank] {
        &self.peer_stops
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}
