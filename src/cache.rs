//! Lean metadata cache.
//!
//! Holds the in-memory namespace this rank serves: inodes, directory
//! fragments, and the subtree authority map. The full cache (locking,
//! journaling of dirty state, migration internals) lives behind the entry
//! points the controller drives; this implementation keeps exactly the
//! state those entry points need.

use crate::error::{LatticeError, Result};
use crate::types::{FragId, InodeId, MdsRank};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One cached inode.
#[derive(Debug, Clone)]
pub struct CacheInode {
    pub ino: InodeId,
    pub path: String,
    pub is_dir: bool,
    /// Whether this rank holds authority over the inode.
    pub auth: bool,
    /// Leaf fragments of the directory, forming the fragment tree.
    pub frags: BTreeSet<FragId>,
}

/// One entry in the subtree authority map.
#[derive(Debug, Clone)]
pub struct Subtree {
    pub ino: InodeId,
    pub frag: FragId,
    pub auth_first: i32,
    pub auth_second: i32,
    pub is_auth: bool,
    pub path: String,
}

#[derive(Debug, Default, Clone)]
pub struct CacheCounters {
    pub trims: u64,
    pub lease_trims: u64,
    pub memory_checks: u64,
    pub dumps: u64,
    pub stale_frag_scans: u64,
    pub map_notifications: u64,
    pub scrubs: u64,
    pub dentry_flushes: u64,
    pub dir_splits: u64,
    pub dir_merges: u64,
}

/// The metadata cache for one rank.
pub struct MetaCache {
    inodes: HashMap<InodeId, CacheInode>,
    by_path: HashMap<String, InodeId>,
    subtrees: Vec<Subtree>,
    readonly: bool,
    active: bool,
    recovery_set: BTreeSet<MdsRank>,
    resolves_sent: u64,
    rejoin_starts: u64,
    discover_kicks: Vec<MdsRank>,
    open_ino_kicks: Vec<MdsRank>,
    recovered_peers: Vec<MdsRank>,
    failed_peers: Vec<MdsRank>,
    counters: CacheCounters,
    stopped: bool,
}

impl MetaCache {
    pub fn new() -> Self {
        Self {
            inodes: HashMap::new(),
            by_path: HashMap::new(),
            subtrees: Vec::new(),
            readonly: false,
            active: false,
            recovery_set: BTreeSet::new(),
            resolves_sent: 0,
            rejoin_starts: 0,
            discover_kicks: Vec::new(),
            open_ino_kicks: Vec::new(),
            recovered_peers: Vec::new(),
            failed_peers: Vec::new(),
            counters: CacheCounters::default(),
            stopped: false,
        }
    }

    /// Create the root inode and its auth subtree for a fresh filesystem.
    pub fn create_root(&mut self, ino: InodeId, rank: MdsRank) {
        if self.by_path.contains_key("/") {
            return;
        }
        self.inodes.insert(
            ino,
            CacheInode {
                ino,
                path: "/".to_string(),
                is_dir: true,
                auth: true,
                frags: BTreeSet::from([FragId::root()]),
            },
        );
        self.by_path.insert("/".to_string(), ino);
        self.subtrees.push(Subtree {
            ino,
            frag: FragId::root(),
            auth_first: rank.0,
            auth_second: -2,
            is_auth: true,
            path: "/".to_string(),
        });
        info!(ino, %rank, "created root inode");
    }

    /// Insert a directory inode into the cache (journal replay and request
    /// paths both land here).
    pub fn add_dir(&mut self, path: &str, ino: InodeId, auth: bool) {
        self.inodes.insert(
            ino,
            CacheInode {
                ino,
                path: path.to_string(),
                is_dir: true,
                auth,
                frags: BTreeSet::from([FragId::root()]),
            },
        );
        self.by_path.insert(path.to_string(), ino);
    }

    /// Resolve a path against cached dentries only.
    pub fn cache_traverse(&self, path: &str) -> Option<InodeId> {
        let normalized = if path.is_empty() { "/" } else { path };
        self.by_path.get(normalized).copied()
    }

    pub fn inode(&self, ino: InodeId) -> Option<&CacheInode> {
        self.inodes.get(&ino)
    }

    /// Whether the named fragment exists as a leaf in cache.
    pub fn has_dirfrag(&self, ino: InodeId, frag: FragId) -> bool {
        self.inodes
            .get(&ino)
            .map(|i| i.frags.contains(&frag))
            .unwrap_or(false)
    }

    pub fn dirfrag_is_auth(&self, ino: InodeId, frag: FragId) -> bool {
        self.has_dirfrag(ino, frag) && self.inodes.get(&ino).map(|i| i.auth).unwrap_or(false)
    }

    /// Leaf fragments that may exist under `frag`, from the fragment tree.
    pub fn leaves_under(&self, ino: InodeId, frag: FragId) -> Vec<FragId> {
        self.inodes
            .get(&ino)
            .map(|i| {
                i.frags
                    .iter()
                    .filter(|f| frag.contains(f))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Split a leaf fragment by `by` bits.
    pub fn split_dir(&mut self, ino: InodeId, frag: FragId, by: u8) -> Result<()> {
        if self.readonly {
            return Err(LatticeError::ReadOnlyFs);
        }
        let inode = self
            .inodes
            .get_mut(&ino)
            .ok_or_else(|| LatticeError::NotFound(format!("inode {}", ino)))?;
        if !inode.frags.remove(&frag) {
            return Err(LatticeError::NotFound(format!(
                "frag {} not a leaf of inode {}",
                frag, ino
            )));
        }
        for child in frag.split(by) {
            inode.frags.insert(child);
        }
        self.counters.dir_splits += 1;
        metrics::counter!("mds.dir_split").increment(1);
        debug!(ino, %frag, by, "split directory fragment");
        Ok(())
    }

    /// Merge every leaf under `frag` back into `frag`.
    pub fn merge_dir(&mut self, ino: InodeId, frag: FragId) -> Result<()> {
        if self.readonly {
            return Err(LatticeError::ReadOnlyFs);
        }
        let inode = self
            .inodes
            .get_mut(&ino)
            .ok_or_else(|| LatticeError::NotFound(format!("inode {}", ino)))?;
        let children: Vec<FragId> = inode
            .frags
            .iter()
            .filter(|f| frag.contains(f) && **f != frag)
            .copied()
            .collect();
        if children.is_empty() {
            return Err(LatticeError::InvalidArgument(format!(
                "frag {} has nothing to merge",
                frag
            )));
        }
        for child in children {
            inode.frags.remove(&child);
        }
        inode.frags.insert(frag);
        self.counters.dir_merges += 1;
        debug!(ino, %frag, "merged directory fragments");
        Ok(())
    }

    /// Scrub the inode at `path`; the reporter signals through `done`.
    pub fn scrub_path(&mut self, path: &str, done: oneshot::Sender<i32>) {
        let code = match self.cache_traverse(path) {
            Some(_) => {
                self.counters.scrubs += 1;
                0
            }
            None => -libc::ENOENT,
        };
        let _ = done.send(code);
    }

    /// Flush the dentry at `path` and its dir fragments.
    pub fn flush_dentry(&mut self, path: &str, done: oneshot::Sender<i32>) {
        let code = match self.cache_traverse(path) {
            Some(_) => {
                self.counters.dentry_flushes += 1;
                0
            }
            None => -libc::ENOENT,
        };
        let _ = done.send(code);
    }

    pub fn list_subtrees(&self) -> Vec<Subtree> {
        self.subtrees.clone()
    }

    pub fn num_subtrees(&self) -> usize {
        self.subtrees.len()
    }

    pub fn num_inodes(&self) -> usize {
        self.inodes.len()
    }

    pub fn dump(&self) -> serde_json::Value {
        let inodes: Vec<serde_json::Value> = self
            .inodes
            .values()
            .map(|i| {
                json!({
                    "ino": i.ino,
                    "path": i.path,
                    "is_dir": i.is_dir,
                    "auth": i.auth,
                    "frags": i.frags.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({
            "num_inodes": self.inodes.len(),
            "readonly": self.readonly,
            "inodes": inodes,
        })
    }

    pub fn dump_to_file(&mut self, path: &Path) -> Result<()> {
        self.counters.dumps += 1;
        let dump = self.dump();
        std::fs::write(path, serde_json::to_vec_pretty(&dump)?)?;
        Ok(())
    }

    pub fn dump_formatted(&mut self) -> serde_json::Value {
        self.counters.dumps += 1;
        self.dump()
    }

    pub fn force_readonly(&mut self) {
        if !self.readonly {
            warn!("forcing cache into read-only mode");
            self.readonly = true;
        }
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    // Periodic maintenance entry points.

    pub fn trim(&mut self) {
        self.counters.trims += 1;
    }

    pub fn trim_client_leases(&mut self) {
        self.counters.lease_trims += 1;
    }

    pub fn check_memory_usage(&mut self) {
        self.counters.memory_checks += 1;
    }

    pub fn find_stale_fragment_freeze(&mut self) {
        self.counters.stale_frag_scans += 1;
    }

    // Membership-driven entry points.

    pub fn set_recovery_set(&mut self, set: BTreeSet<MdsRank>) {
        debug!(?set, "recovery set computed");
        self.recovery_set = set;
    }

    pub fn recovery_set(&self) -> &BTreeSet<MdsRank> {
        &self.recovery_set
    }

    pub fn send_resolves(&mut self) {
        self.resolves_sent += 1;
    }

    pub fn resolves_sent(&self) -> u64 {
        self.resolves_sent
    }

    pub fn rejoin_joint_start(&mut self) {
        self.rejoin_starts += 1;
    }

    pub fn rejoin_starts(&self) -> u64 {
        self.rejoin_starts
    }

    pub fn kick_discovers(&mut self, peer: MdsRank) {
        self.discover_kicks.push(peer);
    }

    pub fn kick_open_ino_peers(&mut self, peer: MdsRank) {
        self.open_ino_kicks.push(peer);
    }

    pub fn discover_kicks(&self) -> &[MdsRank] {
        &self.discover_kicks
    }

    pub fn open_ino_kicks(&self) -> &[MdsRank] {
        &self.open_ino_kicks
    }

    pub fn handle_mds_recovery(&mut self, peer: MdsRank) {
        self.recovered_peers.push(peer);
    }

    pub fn recovered_peers(&self) -> &[MdsRank] {
        &self.recovered_peers
    }

    pub fn handle_mds_failure(&mut self, peer: MdsRank) {
        self.failed_peers.push(peer);
    }

    pub fn failed_peers(&self) -> &[MdsRank] {
        &self.failed_peers
    }

    pub fn notify_mdsmap_changed(&mut self) {
        self.counters.map_notifications += 1;
    }

    pub fn counters(&self) -> &CacheCounters {
        &self.counters
    }

    pub fn shutdown(&mut self) {
        self.stopped = true;
        self.inodes.clear();
        self.by_path.clear();
        self.subtrees.clear();
    }
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_root() -> MetaCache {
        let mut cache = MetaCache::new();
        cache.create_root(1, MdsRank(0));
        cache
    }

    #[test]
    fn test_traverse_root_and_dirs() {
        let mut cache = cache_with_root();
        cache.add_dir("/a", 2, true);
        assert_eq!(cache.cache_traverse("/"), Some(1));
        assert_eq!(cache.cache_traverse("/a"), Some(2));
        assert_eq!(cache.cache_traverse("/missing"), None);
    }

    #[test]
    fn test_split_then_merge_roundtrip() {
        let mut cache = cache_with_root();
        cache.add_dir("/a", 2, true);
        cache.split_dir(2, FragId::root(), 2).unwrap();
        assert_eq!(cache.leaves_under(2, FragId::root()).len(), 4);

        cache.merge_dir(2, FragId::root()).unwrap();
        assert_eq!(cache.leaves_under(2, FragId::root()), vec![FragId::root()]);
    }

    #[test]
    fn test_split_unknown_frag_fails() {
        let mut cache = cache_with_root();
        cache.add_dir("/a", 2, true);
        let frag = FragId { value: 1, bits: 1 };
        assert!(cache.split_dir(2, frag, 1).is_err());
    }

    #[test]
    fn test_readonly_blocks_splits() {
        let mut cache = cache_with_root();
        cache.add_dir("/a", 2, true);
        cache.force_readonly();
        assert!(matches!(
            cache.split_dir(2, FragId::root(), 1),
            Err(LatticeError::ReadOnlyFs)
        ));
    }

    #[tokio::test]
    async fn test_scrub_missing_path_reports_enoent() {
        let mut cache = cache_with_root();
        let (tx, rx) = oneshot::channel();
        cache.scrub_path("/nope", tx);
        assert_eq!(rx.await.unwrap(), -libc::ENOENT);
    }

    #[tokio::test]
    async fn test_flush_dentry_ok() {
        let mut cache = cache_with_root();
        let (tx, rx) = oneshot::channel();
        cache.flush_dentry("/", tx);
        assert_eq!(rx.await.unwrap(), 0);
        assert_eq!(cache.counters().dentry_flushes, 1);
    }
}
