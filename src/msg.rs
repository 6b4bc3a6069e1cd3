//! Wire message variants and payloads.
//!
//! Inbound traffic reaches the controller as one closed [`Message`]
//! enumeration. *Core* messages mutate controller state and are always
//! handled by the dispatcher itself; *rank* messages belong to the serving
//! data plane. Each core kind carries an allowed-sender set enforced at
//! dispatch.

use crate::types::{DaemonState, Epoch, EntityType, GlobalId, StandbyHint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single message as delivered by the messenger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Monitor map notification; acknowledged and dropped.
    MonMap { epoch: Epoch },
    /// Cluster membership map; `payload` is the encoded [`crate::map::MdsMap`].
    MdsMap { epoch: Epoch, payload: Vec<u8> },
    /// Legacy positional monitor command.
    MonCommand { args: Vec<String> },
    /// Structured command with a JSON cmdmap, replied to with [`Message::CommandReply`].
    Command {
        tid: u64,
        cmdmap: serde_json::Value,
    },
    /// Reply to [`Message::Command`], tagged with the original transaction id.
    CommandReply {
        tid: u64,
        code: i32,
        message: String,
        data: Vec<u8>,
    },
    /// Object-store map notification.
    OsdMap {
        epoch: Epoch,
        up_nodes: u32,
        features: u64,
    },
    /// Client metadata request (rank plane).
    ClientRequest { op: String },
    /// Peer MDS event (rank plane).
    PeerEvent { description: String },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::MonMap { .. } => "mon_map",
            Message::MdsMap { .. } => "mds_map",
            Message::MonCommand { .. } => "mon_command",
            Message::Command { .. } => "command",
            Message::CommandReply { .. } => "command_reply",
            Message::OsdMap { .. } => "osd_map",
            Message::ClientRequest { .. } => "client_request",
            Message::PeerEvent { .. } => "peer_event",
        }
    }

    /// Whether the dispatcher handles this kind itself.
    pub fn is_core(&self) -> bool {
        !matches!(
            self,
            Message::ClientRequest { .. } | Message::PeerEvent { .. }
        )
    }

    /// Allowed sender types for core kinds.
    pub fn allowed_from(&self, sender: EntityType) -> bool {
        match self {
            Message::MonMap { .. } | Message::MonCommand { .. } => sender == EntityType::Mon,
            Message::MdsMap { .. } => matches!(sender, EntityType::Mon | EntityType::Mds),
            Message::OsdMap { .. } => matches!(sender, EntityType::Mon | EntityType::Osd),
            Message::Command { .. } | Message::CommandReply { .. } => true,
            Message::ClientRequest { .. } | Message::PeerEvent { .. } => true,
        }
    }
}

/// One health indicator carried in a beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMetric {
    pub code: String,
    pub message: String,
}

/// Daemon health summary advertised via the beacon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdsHealth {
    pub metrics: Vec<HealthMetric>,
}

/// Periodic heartbeat to the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconPayload {
    pub name: String,
    pub global_id: GlobalId,
    pub want_state: DaemonState,
    pub current_state: DaemonState,
    pub seq: u64,
    pub map_epoch: Epoch,
    pub standby_for_rank: StandbyHint,
    pub standby_for_name: String,
    pub health: MdsHealth,
}

/// Cluster log severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ClogLevel {
    pub fn name(&self) -> &'static str {
        match self {
            ClogLevel::Debug => "debug",
            ClogLevel::Info => "info",
            ClogLevel::Warn => "warn",
            ClogLevel::Error => "error",
        }
    }
}

/// One cluster log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClogEntry {
    pub level: ClogLevel,
    pub stamp: DateTime<Utc>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_classification() {
        assert!(Message::MonMap { epoch: 1 }.is_core());
        assert!(Message::OsdMap { epoch: 1, up_nodes: 1, features: 0 }.is_core());
        assert!(!Message::ClientRequest { op: "getattr".into() }.is_core());
    }

    #[test]
    fn test_allowed_senders() {
        let m = Message::MdsMap { epoch: 1, payload: vec![] };
        assert!(m.allowed_from(EntityType::Mon));
        assert!(m.allowed_from(EntityType::Mds));
        assert!(!m.allowed_from(EntityType::Client));

        let m = Message::MonCommand { args: vec![] };
        assert!(m.allowed_from(EntityType::Mon));
        assert!(!m.allowed_from(EntityType::Osd));
    }
}
