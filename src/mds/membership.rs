//! The membership state machine.
//!
//! Consumes cluster-map epochs delivered by the dispatcher, validates rank
//! and state transitions, derives peer events from map diffs, and fans out
//! to the data plane. Invalid transitions are unrecoverable: the function
//! returns the [`FatalAction`] the dispatch layer must execute once the
//! controller lock is released.

use super::{FatalAction, MdsCore, MdsDaemon};
use crate::map::{CompatSet, MdsMap};
use crate::types::{DaemonState, EntityName, Epoch, MdsRank};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Advertise a new wanted state through the beacon.
pub(crate) fn set_want_state(daemon: &MdsDaemon, core: &mut MdsCore, want: DaemonState) {
    if core.want_state != want {
        info!(from = %core.want_state, to = %want, "wanted state change");
        core.want_state = want;
        daemon.beacon.set_want_state(want);
    }
}

/// Whether `old → new` is an acceptable transition while holding a rank.
fn transition_valid(old: DaemonState, new: DaemonState) -> bool {
    match old {
        DaemonState::Replay => {
            matches!(new, DaemonState::Resolve | DaemonState::Reconnect)
        }
        DaemonState::Rejoin => matches!(
            new,
            DaemonState::Active | DaemonState::ClientReplay | DaemonState::Stopped
        ),
        // Between reconnect and active the sequence advances one state at
        // a time; anything else means the monitor and daemon disagree.
        s if s >= DaemonState::Reconnect && s < DaemonState::Active => s.successor() == Some(new),
        // Other originating states are validated by the data plane.
        _ => true,
    }
}

fn active_like(map: &MdsMap) -> BTreeSet<MdsRank> {
    let mut set = map.ranks_in_state(DaemonState::Active);
    set.extend(map.ranks_in_state(DaemonState::ClientReplay));
    set
}

fn visible_like(map: &MdsMap) -> BTreeSet<MdsRank> {
    let mut set = active_like(map);
    set.extend(map.ranks_in_state(DaemonState::Rejoin));
    set
}

fn handle_mds_recovery(core: &mut MdsCore, newmap: &MdsMap, whoami: MdsRank, who: MdsRank) {
    debug!(peer = %who, "peer recovered");
    core.cache.handle_mds_recovery(who);
    if newmap.tableserver() == whoami {
        core.snapserver.handle_mds_recovery(who);
    }
    if let Some(waiters) = core.waiting_for_active_peer.remove(&who) {
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}

fn handle_mds_failure(core: &mut MdsCore, whoami: MdsRank, who: MdsRank) {
    if who == whoami {
        debug!("ignoring failure notification for myself");
        return;
    }
    debug!(peer = %who, "peer failed");
    core.cache.handle_mds_failure(who);
    core.snapclient.handle_mds_failure(who);
}

/// Install one cluster map delivery.
pub(crate) fn handle_mds_map(
    daemon: &Arc<MdsDaemon>,
    core: &mut MdsCore,
    from: EntityName,
    epoch: Epoch,
    payload: &[u8],
) -> Option<FatalAction> {
    debug!(epoch, %from, "handle cluster map");

    // Track how fresh each peer's view is.
    if from.is_mds() {
        let entry = core.peer_mdsmap_epoch.entry(from.id).or_insert(0);
        if *entry < epoch {
            *entry = epoch;
        }
    }

    if epoch <= core.mdsmap.epoch() {
        debug!(
            epoch,
            installed = core.mdsmap.epoch(),
            "old map epoch, discarding"
        );
        return None;
    }

    let decoded = match MdsMap::decode(payload) {
        Ok(map) => map,
        Err(e) => {
            daemon
                .clog
                .error(format!("failed to decode cluster map epoch {}: {}", epoch, e));
            return None;
        }
    };

    // Swap the new map in, keeping the old one for diffing.
    let oldmap = std::mem::replace(&mut core.mdsmap, Arc::new(decoded));
    let newmap = core.mdsmap.clone();
    let oldwhoami = core.whoami;
    let oldstate = core.state;

    daemon.monc.sub_got("mdsmap", newmap.epoch());
    // The beacon must carry the new epoch before any state-change send below.
    daemon.beacon.notify_mdsmap(newmap.epoch());

    let my_compat = CompatSet::supported();
    if !my_compat.writeable(newmap.compat()) {
        daemon.clog.error(format!(
            "cluster map epoch {} requires features this daemon lacks, killing myself",
            newmap.epoch()
        ));
        return Some(FatalAction::Suicide);
    }

    // See who I am in the new map.
    let gid = daemon.monc.global_id();
    core.state = newmap.state_gid(gid);
    core.incarnation = newmap.inc_gid(gid);
    core.whoami = newmap.rank_gid(gid);
    if core.whoami.is_none()
        && matches!(
            core.state,
            DaemonState::StandbyReplay | DaemonState::OneshotReplay
        )
    {
        core.whoami = newmap.info_gid(gid).and_then(|i| i.standby_for_rank);
    }
    info!(
        rank = ?core.whoami,
        incarnation = core.incarnation,
        state = %core.state,
        epoch = newmap.epoch(),
        "map installed"
    );

    // Once held, a rank can only change through process replacement.
    if oldwhoami.is_some() && core.whoami != oldwhoami {
        error!(?oldwhoami, new = ?core.whoami, "invalid rank transition");
        return Some(FatalAction::Respawn);
    }

    if core.whoami.is_some() && core.state != oldstate && !transition_valid(oldstate, core.state) {
        error!(old = %oldstate, new = %core.state, "invalid state transition");
        return Some(FatalAction::Respawn);
    }

    // Mark down peers that disappeared from the map entirely.
    for peer in oldmap.infos() {
        if newmap.info_gid(peer.global_id).is_none() {
            debug!(peer = %peer.global_id, "peer removed from map");
            daemon.messenger.mark_down_addr(peer.addr);
        }
    }

    if core.state != oldstate {
        core.last_state = oldstate;
    }

    if core.state == DaemonState::Standby {
        set_want_state(daemon, core, DaemonState::Standby);
        info!("standing by");
        if let Some(standby_type) = core.standby_type {
            // We actually want to follow a rank's journal.
            set_want_state(daemon, core, standby_type);
            daemon.beacon.kick();
        }
        return None;
    } else if core.state == DaemonState::StandbyReplay {
        if let Some(standby_type) = core.standby_type {
            if standby_type != DaemonState::StandbyReplay {
                set_want_state(daemon, core, standby_type);
                daemon.beacon.kick();
                core.state = oldstate;
                return None;
            }
        }
    }

    let Some(whoami) = core.whoami else {
        // No rank in the new map.
        if core.want_state == DaemonState::Standby {
            debug!("dropped out of the map, trying to re-add myself");
            core.state = DaemonState::Boot;
            set_want_state(daemon, core, DaemonState::Boot);
            return None;
        }
        if core.want_state == DaemonState::Boot {
            debug!("not in the map yet");
            return None;
        }
        // Did someone else take our name?
        if daemon.config().with(|c| c.enforce_unique_name) {
            if let Some(other) = newmap.find_by_name(daemon.name()) {
                if other.global_id > gid {
                    // Suicide rather than respawn: restart-fighting the
                    // newer daemon for the name would oscillate forever.
                    daemon.clog.error(format!(
                        "dropped from the map; a newer daemon holds name '{}' ({}), suicide",
                        daemon.name(),
                        other.global_id
                    ));
                    return Some(FatalAction::Suicide);
                }
            }
        }
        info!("no longer in the map, respawning");
        return Some(FatalAction::Respawn);
    };

    if oldwhoami != core.whoami || oldstate != core.state {
        if matches!(
            core.state,
            DaemonState::StandbyReplay | DaemonState::OneshotReplay
        ) {
            info!(gid = %gid, replaying = %whoami, "now replaying another rank's journal");
            daemon.messenger.set_myname(EntityName::mds(gid.0));
        } else {
            info!(rank = %whoami, incarnation = core.incarnation, "now holding rank");
            daemon.messenger.set_myname(EntityName::mds(whoami.0 as u64));
        }
    }

    if daemon.objecter.client_incarnation() != core.incarnation {
        daemon.objecter.set_client_incarnation(core.incarnation);
    }

    if daemon.config().with(|c| c.dump_cache_on_map) {
        let _ = core.cache.dump_formatted();
    }

    if oldstate != core.state {
        info!(old = %oldstate, new = %core.state, "state change");
        set_want_state(daemon, core, core.state);
        daemon.beacon.set_current_state(core.state);
        daemon.beacon.kick();

        if oldstate == DaemonState::StandbyReplay {
            debug!("monitor activated us; leaving the standby replay loop");
        } else {
            if (core.state.is_active() || core.state.is_clientreplay())
                && matches!(
                    oldstate,
                    DaemonState::Creating | DaemonState::Rejoin | DaemonState::Reconnect
                )
            {
                core.recovery_done(oldstate);
            }

            match core.state {
                DaemonState::Active => core.active_start(),
                s if s.is_any_replay() => core.replay_start(),
                DaemonState::Resolve => core.resolve_start(),
                DaemonState::Reconnect => core.reconnect_start(),
                DaemonState::Rejoin => core.rejoin_start(),
                DaemonState::ClientReplay => core.clientreplay_start(),
                DaemonState::Creating => core.boot_create(),
                DaemonState::Starting => core.boot_start(),
                DaemonState::Stopping => core.stopping_start(),
                _ => {}
            }
        }
    } else {
        daemon.beacon.set_current_state(core.state);
    }

    // Is someone else newly resolving?
    let serving = matches!(
        core.state,
        DaemonState::Resolve
            | DaemonState::Reconnect
            | DaemonState::Rejoin
            | DaemonState::ClientReplay
            | DaemonState::Active
            | DaemonState::Stopping
    );
    if serving && !oldmap.is_resolving() && newmap.is_resolving() {
        let resolve_set = newmap.ranks_in_state(DaemonState::Resolve);
        debug!(?resolve_set, "resolve set");
        let mut recovery_set = newmap.up_ranks();
        recovery_set.extend(newmap.down_ranks().iter().copied());
        recovery_set.remove(&whoami);
        core.cache.set_recovery_set(recovery_set);
        core.cache.send_resolves();
    }

    // Is everybody finally rejoining?
    if matches!(
        core.state,
        DaemonState::Rejoin
            | DaemonState::ClientReplay
            | DaemonState::Active
            | DaemonState::Stopping
    ) {
        if !oldmap.is_rejoining() && newmap.is_rejoining() {
            core.cache.rejoin_joint_start();
        }
        if daemon.config().with(|c| c.dump_cache_after_rejoin)
            && oldmap.is_rejoining()
            && !newmap.is_rejoining()
        {
            let _ = core.cache.dump_formatted();
        }
        if oldstate >= DaemonState::Rejoin {
            // Active, clientreplay, or rejoin peers can serve discovers.
            let old_visible = visible_like(&oldmap);
            for peer in visible_like(&newmap) {
                if peer != whoami && !old_visible.contains(&peer) {
                    core.cache.kick_discovers(peer);
                    core.cache.kick_open_ino_peers(peer);
                }
            }
        }
    }

    if oldmap.is_degraded() && !newmap.is_degraded() && core.state >= DaemonState::Active {
        info!("cluster recovered");
    }

    // Did someone go active?
    if oldstate >= DaemonState::ClientReplay
        && matches!(
            core.state,
            DaemonState::ClientReplay | DaemonState::Active | DaemonState::Stopping
        )
    {
        let old_active = active_like(&oldmap);
        for peer in active_like(&newmap) {
            if peer != whoami && !old_active.contains(&peer) {
                handle_mds_recovery(core, &newmap, whoami, peer);
            }
        }
    }

    // Did someone newly fail?
    for peer in newmap.down_ranks() {
        if !oldmap.down_ranks().contains(peer) {
            if let Some(addr) = oldmap.addr_of(*peer) {
                daemon.messenger.mark_down_addr(addr);
            }
            handle_mds_failure(core, whoami, *peer);
        }
    }

    // Did a still-up peer change address?
    for peer in newmap.up_ranks() {
        if oldmap.have_inst(peer) && oldmap.addr_of(peer) != newmap.addr_of(peer) {
            if let Some(addr) = oldmap.addr_of(peer) {
                daemon.messenger.mark_down_addr(addr);
            }
            handle_mds_failure(core, whoami, peer);
        }
    }

    // Did anyone stop?
    if matches!(
        core.state,
        DaemonState::ClientReplay | DaemonState::Active | DaemonState::Stopping
    ) {
        for peer in newmap.stopped_ranks() {
            if !oldmap.stopped_ranks().contains(peer) {
                core.migrator.handle_mds_failure_or_stop(*peer);
            }
        }
    }

    if !core.state.is_any_replay() {
        core.balancer.try_rebalance();
    }

    // Drain continuations parked on this or earlier epochs.
    let installed = newmap.epoch();
    let ready: Vec<Epoch> = core
        .waiting_for_mdsmap
        .range(..=installed)
        .map(|(e, _)| *e)
        .collect();
    for epoch in ready {
        for tx in core.waiting_for_mdsmap.remove(&epoch).unwrap_or_default() {
            let _ = tx.send(());
        }
    }

    if core.state.is_active() {
        // Caps issued from here on must not be visible to clients whose
        // object-store map predates this incarnation's barriers.
        core.set_osd_epoch_barrier(daemon.objecter.epoch());
        core.bcast_mds_map();
    }

    core.cache.notify_mdsmap_changed();
    None
}
