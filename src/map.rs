//! The cluster membership map.
//!
//! The monitor is the sole author of [`MdsMap`]s; daemons only decode and
//! query them. Each map snapshot carries the epoch, the feature
//! compatibility set, per-daemon info keyed by global id, and the down and
//! stopped rank sets.

use crate::error::Result;
use crate::types::{DaemonState, Epoch, GlobalId, MdsRank};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use uuid::Uuid;

/// Baseline wire/encoding feature, always required.
pub const FEATURE_BASE: u64 = 1 << 0;
/// Sorted-map object operations; the journal and tables require this from
/// every up store node.
pub const FEATURE_OMAP: u64 = 1 << 1;
/// Inline file data support.
pub const FEATURE_INLINE_DATA: u64 = 1 << 2;

/// Feature compatibility set.
///
/// A daemon can serve a map only if it implements every feature the map
/// requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompatSet {
    pub required: u64,
}

impl CompatSet {
    pub fn new(required: u64) -> Self {
        Self { required }
    }

    /// Everything this daemon build implements.
    pub fn supported() -> Self {
        Self {
            required: FEATURE_BASE | FEATURE_OMAP | FEATURE_INLINE_DATA,
        }
    }

    /// Whether a daemon with feature set `self` may mutate state governed by
    /// a map requiring `map`.
    pub fn writeable(&self, map: &CompatSet) -> bool {
        map.required & !self.required == 0
    }
}

/// Per-daemon record in the membership map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdsInfo {
    pub global_id: GlobalId,
    pub name: String,
    pub rank: Option<MdsRank>,
    pub incarnation: u32,
    pub state: DaemonState,
    pub addr: SocketAddr,
    pub standby_for_rank: Option<MdsRank>,
    pub standby_for_name: String,
}

/// A monitor-authored snapshot of cluster membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdsMap {
    epoch: Epoch,
    fsid: Uuid,
    compat: CompatSet,
    info: BTreeMap<GlobalId, MdsInfo>,
    up: BTreeMap<MdsRank, GlobalId>,
    down: BTreeSet<MdsRank>,
    stopped: BTreeSet<MdsRank>,
    tableserver: MdsRank,
}

impl Default for MdsMap {
    fn default() -> Self {
        Self {
            epoch: 0,
            fsid: Uuid::nil(),
            compat: CompatSet::supported(),
            info: BTreeMap::new(),
            up: BTreeMap::new(),
            down: BTreeSet::new(),
            stopped: BTreeSet::new(),
            tableserver: MdsRank(0),
        }
    }
}

impl MdsMap {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    pub fn compat(&self) -> &CompatSet {
        &self.compat
    }

    pub fn tableserver(&self) -> MdsRank {
        self.tableserver
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("map encoding is infallible")
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }

    pub fn info_gid(&self, gid: GlobalId) -> Option<&MdsInfo> {
        self.info.get(&gid)
    }

    pub fn infos(&self) -> impl Iterator<Item = &MdsInfo> {
        self.info.values()
    }

    /// Whether the map has no record of this gid at all.
    pub fn is_dne_gid(&self, gid: GlobalId) -> bool {
        !self.info.contains_key(&gid)
    }

    pub fn state_gid(&self, gid: GlobalId) -> DaemonState {
        self.info
            .get(&gid)
            .map(|i| i.state)
            .unwrap_or(DaemonState::Dne)
    }

    pub fn rank_gid(&self, gid: GlobalId) -> Option<MdsRank> {
        self.info.get(&gid).and_then(|i| i.rank)
    }

    pub fn inc_gid(&self, gid: GlobalId) -> u32 {
        self.info.get(&gid).map(|i| i.incarnation).unwrap_or(0)
    }

    pub fn is_up(&self, rank: MdsRank) -> bool {
        self.up.contains_key(&rank)
    }

    /// Whether the rank is part of the cluster (serving or down-but-assigned).
    pub fn is_in(&self, rank: MdsRank) -> bool {
        self.up.contains_key(&rank) || self.down.contains(&rank)
    }

    pub fn have_inst(&self, rank: MdsRank) -> bool {
        self.up.contains_key(&rank)
    }

    pub fn addr_of(&self, rank: MdsRank) -> Option<SocketAddr> {
        self.up
            .get(&rank)
            .and_then(|gid| self.info.get(gid))
            .map(|i| i.addr)
    }

    pub fn gid_of(&self, rank: MdsRank) -> Option<GlobalId> {
        self.up.get(&rank).copied()
    }

    /// Ranks currently in the given state.
    pub fn ranks_in_state(&self, state: DaemonState) -> BTreeSet<MdsRank> {
        self.info
            .values()
            .filter(|i| i.state == state)
            .filter_map(|i| i.rank)
            .collect()
    }

    pub fn up_ranks(&self) -> BTreeSet<MdsRank> {
        self.up.keys().copied().collect()
    }

    pub fn down_ranks(&self) -> &BTreeSet<MdsRank> {
        &self.down
    }

    pub fn stopped_ranks(&self) -> &BTreeSet<MdsRank> {
        &self.stopped
    }

    pub fn is_resolving(&self) -> bool {
        !self.ranks_in_state(DaemonState::Resolve).is_empty()
    }

    pub fn is_rejoining(&self) -> bool {
        !self.ranks_in_state(DaemonState::Rejoin).is_empty()
    }

    /// Degraded: some rank is down or still recovering.
    pub fn is_degraded(&self) -> bool {
        if !self.down.is_empty() {
            return true;
        }
        self.info
            .values()
            .any(|i| i.rank.is_some() && i.state < DaemonState::Active)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&MdsInfo> {
        self.info.values().find(|i| i.name == name)
    }
}

/// Monitor-side map construction.
#[derive(Debug, Default)]
pub struct MdsMapBuilder {
    map: MdsMap,
}

impl MdsMapBuilder {
    pub fn new(epoch: Epoch, fsid: Uuid) -> Self {
        Self {
            map: MdsMap {
                epoch,
                fsid,
                ..MdsMap::default()
            },
        }
    }

    pub fn compat(mut self, compat: CompatSet) -> Self {
        self.map.compat = compat;
        self
    }

    pub fn tableserver(mut self, rank: MdsRank) -> Self {
        self.map.tableserver = rank;
        self
    }

    pub fn daemon(mut self, info: MdsInfo) -> Self {
        if let Some(rank) = info.rank {
            if !matches!(
                info.state,
                DaemonState::StandbyReplay | DaemonState::OneshotReplay
            ) {
                self.map.up.insert(rank, info.global_id);
            }
        }
        self.map.info.insert(info.global_id, info);
        self
    }

    pub fn down(mut self, rank: MdsRank) -> Self {
        self.map.up.remove(&rank);
        self.map.down.insert(rank);
        self
    }

    pub fn stopped(mut self, rank: MdsRank) -> Self {
        self.map.stopped.insert(rank);
        self
    }

    pub fn build(self) -> MdsMap {
        self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(gid: u64, name: &str, rank: i32, state: DaemonState) -> MdsInfo {
        MdsInfo {
            global_id: GlobalId(gid),
            name: name.to_string(),
            rank: Some(MdsRank(rank)),
            incarnation: 1,
            state,
            addr: "127.0.0.1:6800".parse().unwrap(),
            standby_for_rank: None,
            standby_for_name: String::new(),
        }
    }

    #[test]
    fn test_compat_writeable() {
        let mine = CompatSet::supported();
        assert!(mine.writeable(&CompatSet::new(FEATURE_BASE | FEATURE_OMAP)));
        assert!(!CompatSet::new(FEATURE_BASE).writeable(&CompatSet::new(FEATURE_OMAP)));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let map = MdsMapBuilder::new(7, Uuid::new_v4())
            .daemon(info(10, "a", 0, DaemonState::Active))
            .down(MdsRank(1))
            .build();
        let decoded = MdsMap::decode(&map.encode()).unwrap();
        assert_eq!(decoded.epoch(), 7);
        assert_eq!(decoded.rank_gid(GlobalId(10)), Some(MdsRank(0)));
        assert!(decoded.down_ranks().contains(&MdsRank(1)));
    }

    #[test]
    fn test_queries() {
        let map = MdsMapBuilder::new(3, Uuid::nil())
            .daemon(info(10, "a", 0, DaemonState::Active))
            .daemon(info(11, "b", 1, DaemonState::Resolve))
            .build();
        assert!(map.is_up(MdsRank(0)));
        assert!(map.is_in(MdsRank(1)));
        assert!(map.is_resolving());
        assert!(map.is_degraded());
        assert_eq!(map.find_by_name("b").unwrap().global_id, GlobalId(11));
        assert_eq!(map.state_gid(GlobalId(99)), DaemonState::Dne);
    }

    #[test]
    fn test_standby_replay_not_in_up_set() {
        let mut i = info(12, "c", 0, DaemonState::StandbyReplay);
        i.standby_for_rank = Some(MdsRank(0));
        let map = MdsMapBuilder::new(2, Uuid::nil())
            .daemon(info(10, "a", 0, DaemonState::Active))
            .daemon(i)
            .build();
        assert_eq!(map.gid_of(MdsRank(0)), Some(GlobalId(10)));
        assert_eq!(map.rank_gid(GlobalId(12)), Some(MdsRank(0)));
    }
}
