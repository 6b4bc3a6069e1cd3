//! Core type definitions for the Lattice MDS.
//!
//! Identifiers, the daemon state enumeration, entity naming, and directory
//! fragment ids. These types are shared by the controller and every
//! data-plane peer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster map / object-store map epoch.
pub type Epoch = u64;

/// Inode number.
pub type InodeId = u64;

/// Global daemon id minted by the monitor at authentication.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GlobalId(pub u64);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid.{}", self.0)
    }
}

/// Logical metadata rank assigned by the monitor.
///
/// The *none* sentinel is expressed as `Option<MdsRank>` wherever a rank may
/// be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MdsRank(pub i32);

impl fmt::Display for MdsRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mds.{}", self.0)
    }
}

/// Daemon lifecycle state, in recovery order.
///
/// The declaration order is load-bearing: the membership machine's
/// "advance by exactly one" rule for the reconnect..active window relies on
/// [`DaemonState::successor`], which follows this ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonState {
    Dne,
    Damaged,
    Stopped,
    Boot,
    Standby,
    StandbyReplay,
    OneshotReplay,
    Creating,
    Starting,
    Replay,
    Resolve,
    Reconnect,
    Rejoin,
    ClientReplay,
    Active,
    Stopping,
}

impl DaemonState {
    /// Human-readable state name as reported by `status` and the beacon.
    pub fn name(&self) -> &'static str {
        match self {
            DaemonState::Dne => "dne",
            DaemonState::Damaged => "damaged",
            DaemonState::Stopped => "stopped",
            DaemonState::Boot => "boot",
            DaemonState::Standby => "standby",
            DaemonState::StandbyReplay => "standby-replay",
            DaemonState::OneshotReplay => "oneshot-replay",
            DaemonState::Creating => "creating",
            DaemonState::Starting => "starting",
            DaemonState::Replay => "replay",
            DaemonState::Resolve => "resolve",
            DaemonState::Reconnect => "reconnect",
            DaemonState::Rejoin => "rejoin",
            DaemonState::ClientReplay => "clientreplay",
            DaemonState::Active => "active",
            DaemonState::Stopping => "stopping",
        }
    }

    /// The next state along the recovery sequence, if any.
    pub fn successor(&self) -> Option<DaemonState> {
        match self {
            DaemonState::Creating => Some(DaemonState::Starting),
            DaemonState::Starting => Some(DaemonState::Replay),
            DaemonState::Replay => Some(DaemonState::Resolve),
            DaemonState::Resolve => Some(DaemonState::Reconnect),
            DaemonState::Reconnect => Some(DaemonState::Rejoin),
            DaemonState::Rejoin => Some(DaemonState::ClientReplay),
            DaemonState::ClientReplay => Some(DaemonState::Active),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, DaemonState::Active)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self, DaemonState::Stopping)
    }

    pub fn is_clientreplay(&self) -> bool {
        matches!(self, DaemonState::ClientReplay)
    }

    pub fn is_reconnect(&self) -> bool {
        matches!(self, DaemonState::Reconnect)
    }

    /// Any of the journal-following replay states.
    pub fn is_any_replay(&self) -> bool {
        matches!(
            self,
            DaemonState::Replay | DaemonState::StandbyReplay | DaemonState::OneshotReplay
        )
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Peer entity classes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Mon,
    Mds,
    Osd,
    Client,
}

impl EntityType {
    pub fn name(&self) -> &'static str {
        match self {
            EntityType::Mon => "mon",
            EntityType::Mds => "mds",
            EntityType::Osd => "osd",
            EntityType::Client => "client",
        }
    }
}

/// A typed entity name, e.g. `client.42` or `mds.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityName {
    pub entity_type: EntityType,
    pub id: u64,
}

impl EntityName {
    pub fn mon(id: u64) -> Self {
        Self { entity_type: EntityType::Mon, id }
    }

    pub fn mds(id: u64) -> Self {
        Self { entity_type: EntityType::Mds, id }
    }

    pub fn osd(id: u64) -> Self {
        Self { entity_type: EntityType::Osd, id }
    }

    pub fn client(id: u64) -> Self {
        Self { entity_type: EntityType::Client, id }
    }

    pub fn is_client(&self) -> bool {
        self.entity_type == EntityType::Client
    }

    pub fn is_mds(&self) -> bool {
        self.entity_type == EntityType::Mds
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_type.name(), self.id)
    }
}

/// Directory fragment id: a bit-prefix of the hash space, `value/bits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragId {
    pub value: u32,
    pub bits: u8,
}

impl FragId {
    /// The root fragment covering the whole hash space.
    pub fn root() -> Self {
        Self { value: 0, bits: 0 }
    }

    /// Parse the `<hex-value>/<bits>` form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        let (value, bits) = s.split_once('/')?;
        let value = u32::from_str_radix(value.trim_start_matches("0x"), 16).ok()?;
        let bits: u8 = bits.parse().ok()?;
        if bits > 24 {
            return None;
        }
        Some(Self { value, bits })
    }

    /// Split this fragment into `2^by` children.
    pub fn split(&self, by: u8) -> Vec<FragId> {
        let bits = self.bits + by;
        (0..(1u32 << by))
            .map(|i| FragId { value: (self.value << by) | i, bits })
            .collect()
    }

    /// Whether `other` falls under this fragment's prefix.
    pub fn contains(&self, other: &FragId) -> bool {
        other.bits >= self.bits && (other.value >> (other.bits - self.bits)) == self.value
    }
}

impl fmt::Display for FragId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}/{}", self.value, self.bits)
    }
}

/// Standby placement hint advertised in beacons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StandbyHint {
    #[default]
    Unset,
    /// Follow a specific rank.
    Rank(MdsRank),
    /// Take over any rank.
    Any,
    /// Follow the daemon named in `standby_for_name`.
    Name,
    /// Follow whichever active daemon matches the name.
    MatchedActive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(DaemonState::Reconnect < DaemonState::Active);
        assert!(DaemonState::Rejoin > DaemonState::Reconnect);
        assert!(DaemonState::ClientReplay >= DaemonState::ClientReplay);
    }

    #[test]
    fn test_state_successor() {
        assert_eq!(
            DaemonState::Reconnect.successor(),
            Some(DaemonState::Rejoin)
        );
        assert_eq!(
            DaemonState::ClientReplay.successor(),
            Some(DaemonState::Active)
        );
        assert_eq!(DaemonState::Active.successor(), None);
    }

    #[test]
    fn test_frag_roundtrip() {
        let frag = FragId { value: 0x2a, bits: 6 };
        let parsed = FragId::parse(&frag.to_string()).unwrap();
        assert_eq!(parsed, frag);
        assert!(FragId::parse("zz/3").is_none());
        assert!(FragId::parse("1").is_none());
    }

    #[test]
    fn test_frag_split_contains() {
        let root = FragId::root();
        let children = root.split(1);
        assert_eq!(children.len(), 2);
        for child in &children {
            assert!(root.contains(child));
        }
        assert!(!children[0].contains(&children[1]));
    }

    #[test]
    fn test_entity_name_display() {
        assert_eq!(EntityName::client(42).to_string(), "client.42");
        assert_eq!(EntityName::mds(0).to_string(), "mds.0");
    }
}
