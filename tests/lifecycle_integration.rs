//! Integration tests for the daemon lifecycle and membership machine.

#[allow(dead_code)]
mod common;

use common::{peer_info, spawn_daemon, spawn_daemon_with};
use lattice::map::{CompatSet, MdsMapBuilder, FEATURE_BASE, FEATURE_OMAP};
use lattice::mds::RecoveryStep;
use lattice::osdc::OsdMapView;
use lattice::types::{DaemonState, MdsRank};

fn steps_of(steps: &[RecoveryStep], step: RecoveryStep) -> usize {
    steps.iter().filter(|s| **s == step).count()
}

#[tokio::test]
async fn test_boot_to_active() {
    let t = spawn_daemon("alpha").await;

    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;
    t.daemon
        .inspect(|core| {
            assert_eq!(core.state(), DaemonState::Creating);
            assert_eq!(core.whoami(), Some(MdsRank(0)));
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::BootCreate), 1);
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::ActiveStart), 0);
        })
        .await;

    t.deliver_map(&t.solo_map(2, DaemonState::Active)).await;
    let osd_epoch = t.daemon.object_client().epoch();
    t.daemon
        .inspect(|core| {
            assert_eq!(core.state(), DaemonState::Active);
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::BootCreate), 1);
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::ActiveStart), 1);
            assert_eq!(
                steps_of(
                    core.recovery_steps(),
                    RecoveryStep::RecoveryDone(DaemonState::Creating)
                ),
                1
            );
            // Freshly issued caps must not be visible to clients with
            // object-store maps older than ours.
            assert_eq!(core.osd_epoch_barrier(), osd_epoch);
        })
        .await;

    assert!(!t.daemon.is_stopping());
    assert_eq!(t.daemon.lifecycle().respawns(), 0);
}

#[tokio::test]
async fn test_installed_epochs_strictly_increase() {
    let t = spawn_daemon("alpha").await;

    t.deliver_map(&t.solo_map(3, DaemonState::Creating)).await;
    assert_eq!(t.daemon.inspect(|c| c.map_epoch()).await, 3);

    // Stale and duplicate epochs are discarded before any validation.
    t.deliver_map(&t.solo_map(2, DaemonState::Active)).await;
    t.deliver_map(&t.solo_map(3, DaemonState::Active)).await;
    assert_eq!(t.daemon.inspect(|c| c.map_epoch()).await, 3);
    assert_eq!(t.daemon.inspect(|c| c.state()).await, DaemonState::Creating);
    assert_eq!(t.daemon.lifecycle().respawns(), 0);

    t.deliver_map(&t.solo_map(4, DaemonState::Active)).await;
    assert_eq!(t.daemon.inspect(|c| c.map_epoch()).await, 4);
    assert_eq!(t.daemon.inspect(|c| c.state()).await, DaemonState::Active);
}

#[tokio::test]
async fn test_invalid_state_transition_respawns() {
    let t = spawn_daemon("alpha").await;

    t.deliver_map(&t.solo_map(1, DaemonState::Replay)).await;
    t.daemon
        .inspect(|core| {
            assert_eq!(core.state(), DaemonState::Replay);
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::ReplayStart), 1);
        })
        .await;

    // replay may only move to resolve or reconnect.
    t.deliver_map(&t.solo_map(2, DaemonState::Active)).await;
    assert_eq!(t.daemon.lifecycle().respawns(), 1);
    assert!(t.daemon.is_stopping());
    t.daemon
        .inspect(|core| {
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::ActiveStart), 0);
        })
        .await;
}

#[tokio::test]
async fn test_rank_change_respawns_exactly_once_and_silences_beacons() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    // A different non-none rank may never be assigned to a live daemon.
    let map = MdsMapBuilder::new(3, t.monitor.fsid())
        .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
        .daemon(t.own_info(1, DaemonState::Active))
        .build();
    t.deliver_map(&map).await;

    assert_eq!(t.daemon.lifecycle().respawns(), 1);
    assert!(t.daemon.is_stopping());

    // No further beacons advertise the new rank: the beacon is down.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let beacons_after_respawn = t.monitor.beacons().len();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(t.monitor.beacons().len(), beacons_after_respawn);
}

#[tokio::test]
async fn test_standby_name_race_loser_suicides() {
    let t = spawn_daemon("alpha").await;
    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;

    // The new map drops our gid and lists another daemon with our name and
    // a larger gid: we lost the name race.
    let rival_gid = t.gid.0 + 100;
    let map = MdsMapBuilder::new(2, t.monitor.fsid())
        .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
        .daemon(peer_info(rival_gid, "alpha", 0, DaemonState::Active, 6801))
        .build();
    t.deliver_map(&map).await;

    assert_eq!(t.daemon.lifecycle().suicides(), 1);
    assert_eq!(t.daemon.lifecycle().respawns(), 0);
    assert!(t.daemon.is_stopping());
}

#[tokio::test]
async fn test_dropped_from_map_without_name_race_respawns() {
    let t = spawn_daemon_with("alpha", |c| c.enforce_unique_name = true).await;
    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;

    // Gone from the map, nobody else holds our name: try again as standby.
    let map = MdsMapBuilder::new(2, t.monitor.fsid())
        .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
        .daemon(peer_info(9000, "other", 0, DaemonState::Active, 6801))
        .build();
    t.deliver_map(&map).await;

    assert_eq!(t.daemon.lifecycle().respawns(), 1);
    assert_eq!(t.daemon.lifecycle().suicides(), 0);
}

#[tokio::test]
async fn test_incompatible_map_suicides() {
    let t = spawn_daemon("alpha").await;
    let unknown_feature = 1 << 40;
    let map = MdsMapBuilder::new(1, t.monitor.fsid())
        .compat(CompatSet::new(FEATURE_BASE | unknown_feature))
        .daemon(t.own_info(0, DaemonState::Creating))
        .build();
    t.deliver_map(&map).await;

    assert_eq!(t.daemon.lifecycle().suicides(), 1);
    assert!(t.daemon.is_stopping());
}

#[tokio::test]
async fn test_suicide_is_idempotent() {
    let t = spawn_daemon("alpha").await;
    t.daemon.suicide(false).await;
    assert!(t.daemon.is_stopping());
    // Second entry is blocked by the stopping latch.
    t.daemon.suicide(false).await;
    assert_eq!(t.daemon.lifecycle().suicides(), 1);
}

#[tokio::test]
async fn test_messages_discarded_after_exit() {
    let t = spawn_daemon("alpha").await;
    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;

    // The legacy `exit` command drives wanted=dne and the stopping latch;
    // everything delivered afterwards is released unprocessed.
    t.daemon
        .dispatch(lattice::messenger::Envelope::bare(
            lattice::types::EntityName::mon(0),
            common::mon_addr(),
            lattice::msg::Message::MonCommand {
                args: vec!["exit".to_string()],
            },
        ))
        .await;
    assert!(t.daemon.is_stopping());
    assert_eq!(t.daemon.inspect(|c| c.want_state()).await, DaemonState::Dne);

    t.deliver_map(&t.solo_map(5, DaemonState::Active)).await;
    assert_eq!(t.daemon.inspect(|c| c.map_epoch()).await, 1);
    t.daemon
        .inspect(|core| {
            assert_eq!(steps_of(core.recovery_steps(), RecoveryStep::ActiveStart), 0);
        })
        .await;
}

#[tokio::test]
async fn test_map_epoch_waiters_drain_in_order() {
    let t = spawn_daemon("alpha").await;
    let rx2 = t.daemon.with_core_mut(|core| core.wait_for_mdsmap(2)).await;
    let rx5 = t.daemon.with_core_mut(|core| core.wait_for_mdsmap(5)).await;

    t.deliver_map(&t.solo_map(2, DaemonState::Creating)).await;
    rx2.await.expect("epoch-2 waiter drained");
    assert_eq!(
        t.daemon
            .inspect(|core| core.pending_map_waiters())
            .await,
        1
    );

    t.deliver_map(&t.solo_map(5, DaemonState::Starting)).await;
    rx5.await.expect("epoch-5 waiter drained");
}

#[tokio::test]
async fn test_peer_failure_fans_out() {
    let t = spawn_daemon("alpha").await;

    // Two-rank cluster, both active.
    let mk = |epoch, peer_state, down: bool| {
        let mut b = MdsMapBuilder::new(epoch, t.monitor.fsid())
            .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
            .daemon(t.own_info(0, DaemonState::Active));
        if down {
            b = b.down(MdsRank(1));
        } else {
            b = b.daemon(peer_info(9000, "beta", 1, peer_state, 6801));
        }
        b.build()
    };

    // Go active alone first; peer-recovery handling only runs once this
    // daemon is past clientreplay.
    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;
    t.deliver_map(&t.solo_map(2, DaemonState::Active)).await;

    t.deliver_map(&mk(3, DaemonState::Active, false)).await;
    t.daemon
        .inspect(|core| {
            // beta went active while we were already serving.
            assert_eq!(core.cache.recovered_peers(), &[MdsRank(1)]);
        })
        .await;

    t.deliver_map(&mk(4, DaemonState::Active, true)).await;
    t.daemon
        .inspect(|core| {
            assert_eq!(core.cache.failed_peers(), &[MdsRank(1)]);
            assert_eq!(core.snapclient.failed_peers(), &[MdsRank(1)]);
        })
        .await;
}

#[tokio::test]
async fn test_stopped_peer_notifies_migrator() {
    let t = spawn_daemon("alpha").await;
    t.deliver_map(&t.solo_map(1, DaemonState::Creating)).await;

    let with_peer = MdsMapBuilder::new(2, t.monitor.fsid())
        .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
        .daemon(t.own_info(0, DaemonState::Active))
        .daemon(peer_info(9000, "beta", 1, DaemonState::Active, 6801))
        .build();
    t.deliver_map(&with_peer).await;

    let stopped = MdsMapBuilder::new(3, t.monitor.fsid())
        .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
        .daemon(t.own_info(0, DaemonState::Active))
        .daemon(peer_info(9000, "beta", 1, DaemonState::Stopped, 6801))
        .stopped(MdsRank(1))
        .build();
    t.deliver_map(&stopped).await;

    t.daemon
        .inspect(|core| {
            assert_eq!(core.migrator.peer_stops(), &[MdsRank(1)]);
        })
        .await;
}

#[tokio::test]
async fn test_osd_epoch_barrier_never_decreases() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    t.daemon.object_client().install_map(OsdMapView {
        epoch: 9,
        up_nodes: 3,
        features: FEATURE_BASE | FEATURE_OMAP,
    });
    t.daemon
        .with_core_mut(|core| core.set_osd_epoch_barrier(9))
        .await;
    assert_eq!(t.daemon.inspect(|c| c.osd_epoch_barrier()).await, 9);

    // A lower request leaves the barrier alone.
    t.daemon
        .with_core_mut(|core| core.set_osd_epoch_barrier(3))
        .await;
    assert_eq!(t.daemon.inspect(|c| c.osd_epoch_barrier()).await, 9);
}

#[tokio::test]
async fn test_signal_triggers_suicide() {
    let t = spawn_daemon("alpha").await;
    t.daemon.handle_signal(libc::SIGTERM).await;
    assert!(t.daemon.is_stopping());
    assert_eq!(t.daemon.lifecycle().suicides(), 1);
    // A second signal is a no-op.
    t.daemon.handle_signal(libc::SIGINT).await;
    assert_eq!(t.daemon.lifecycle().suicides(), 1);
}

#[tokio::test]
async fn test_damaged_reports_then_respawns() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;
    t.daemon.damaged().await;

    assert_eq!(t.daemon.lifecycle().respawns(), 1);
    // The terminal beacon advertised the damaged state.
    assert!(t
        .monitor
        .beacons()
        .iter()
        .any(|b| b.want_state == DaemonState::Damaged));
}

#[tokio::test]
async fn test_accept_race_winner_gets_preopen_queue() {
    let t = spawn_daemon("alpha").await;
    t.to_active().await;

    let conn1 = t.client_conn(42, Some("allow rw")).await;
    let session = conn1.session().expect("session attached");
    assert_eq!(session.connection().unwrap().id(), conn1.id());

    // A racing reconnect wins accept; the session must follow it and any
    // queued pre-open traffic must land on the winner.
    conn1.mark_down();
    session.send_or_queue(lattice::msg::Message::MonMap { epoch: 1 });
    assert_eq!(session.preopen_queue_len(), 1);

    let conn2 = t.client_conn(42, Some("allow rw")).await;
    let session2 = conn2.session().expect("same session");
    assert_eq!(session2.name(), session.name());
    assert_eq!(session.connection().unwrap().id(), conn2.id());
    assert_eq!(session.preopen_queue_len(), 0);
    assert!(conn2.queued_len() >= 1);
}
