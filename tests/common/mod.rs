//! Common test utilities for integration tests.

use lattice::auth::{AuthorizerPayload, AUTH_PROTOCOL_SHARED_KEY};
use lattice::config::MdsConfig;
use lattice::map::{CompatSet, MdsInfo, MdsMap, MdsMapBuilder, FEATURE_BASE, FEATURE_OMAP};
use lattice::mds::{Lifecycle, MdsDaemon};
use lattice::messenger::{Connection, Envelope};
use lattice::mon::LocalMonitor;
use lattice::msg::Message;
use lattice::osdc::OsdMapView;
use lattice::types::{DaemonState, EntityName, EntityType, GlobalId, MdsRank};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid address")
}

pub fn mon_addr() -> SocketAddr {
    addr(3300)
}

/// A daemon wired to an in-process monitor, initialized through `init` and
/// ready to receive cluster maps.
pub struct TestDaemon {
    pub daemon: Arc<MdsDaemon>,
    pub monitor: Arc<LocalMonitor>,
    pub gid: GlobalId,
    _socket_dir: TempDir,
}

pub async fn spawn_daemon(name: &str) -> TestDaemon {
    spawn_daemon_with(name, |_| {}).await
}

pub async fn spawn_daemon_with(
    name: &str,
    tweak: impl FnOnce(&mut MdsConfig),
) -> TestDaemon {
    let socket_dir = TempDir::new().expect("create socket dir");
    let mut config = MdsConfig::development(name);
    config.admin_socket_path = socket_dir.path().join("mds.asok");
    // Keep the periodic tick out of the way; tests drive time themselves.
    config.tick_interval = Duration::from_secs(3600);
    config.beacon_interval = Duration::from_secs(3600);
    config.admin_grace = Duration::from_millis(20);
    tweak(&mut config);

    let monitor = LocalMonitor::new();
    let daemon = MdsDaemon::new(config, monitor.clone(), Lifecycle::latched());
    daemon.object_client().install_map(OsdMapView {
        epoch: 1,
        up_nodes: 3,
        features: FEATURE_BASE | FEATURE_OMAP,
    });
    daemon
        .init(DaemonState::Boot)
        .await
        .expect("daemon init succeeds");
    let gid = daemon.monitor_client().global_id();

    TestDaemon {
        daemon,
        monitor,
        gid,
        _socket_dir: socket_dir,
    }
}

/// A peer daemon record for map construction.
pub fn peer_info(gid: u64, name: &str, rank: i32, state: DaemonState, port: u16) -> MdsInfo {
    MdsInfo {
        global_id: GlobalId(gid),
        name: name.to_string(),
        rank: Some(MdsRank(rank)),
        incarnation: 1,
        state,
        addr: addr(port),
        standby_for_rank: None,
        standby_for_name: String::new(),
    }
}

impl TestDaemon {
    /// This daemon's own map record.
    pub fn own_info(&self, rank: i32, state: DaemonState) -> MdsInfo {
        MdsInfo {
            global_id: self.gid,
            name: self.daemon.name().to_string(),
            rank: Some(MdsRank(rank)),
            incarnation: 1,
            state,
            addr: addr(6800),
            standby_for_rank: None,
            standby_for_name: String::new(),
        }
    }

    /// A single-daemon map placing us at rank 0 in `state`.
    pub fn solo_map(&self, epoch: u64, state: DaemonState) -> MdsMap {
        MdsMapBuilder::new(epoch, self.monitor.fsid())
            .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
            .daemon(self.own_info(0, state))
            .build()
    }

    /// Deliver a cluster map through the dispatcher, as the monitor would.
    pub async fn deliver_map(&self, map: &MdsMap) {
        self.daemon
            .dispatch(Envelope::bare(
                EntityName::mon(0),
                mon_addr(),
                Message::MdsMap {
                    epoch: map.epoch(),
                    payload: map.encode(),
                },
            ))
            .await;
    }

    /// Walk this daemon from boot to active at rank 0.
    pub async fn to_active(&self) {
        self.deliver_map(&self.solo_map(1, DaemonState::Creating)).await;
        self.deliver_map(&self.solo_map(2, DaemonState::Active)).await;
    }

    /// Open an authorized client connection with the given caps string.
    pub async fn client_conn(&self, client_id: u64, caps: Option<&str>) -> Arc<Connection> {
        let conn = self
            .daemon
            .messenger()
            .accept(EntityType::Client, addr(50000 + client_id as u16));
        let payload = AuthorizerPayload {
            protocol: AUTH_PROTOCOL_SHARED_KEY,
            name: format!("client.{}", client_id),
            global_id: GlobalId(client_id),
            key: self.monitor.secrets().key,
            caps: caps.map(str::to_string),
        };
        let valid = self
            .daemon
            .verify_authorizer(&conn, payload)
            .await
            .expect("verify runs");
        assert!(valid, "client authorizer should verify");
        self.daemon.handle_accept(&conn).await;
        conn
    }
}
