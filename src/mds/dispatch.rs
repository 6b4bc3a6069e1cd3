//! The inbound message dispatcher.
//!
//! Single entry point for everything the messenger delivers. Core messages
//! (maps, commands) mutate controller state synchronously under the
//! controller lock; rank messages are handed to the serving data plane and
//! dropped when no rank is held.

use super::{admin, membership, FatalAction, MdsCore, MdsDaemon};
use crate::messenger::Envelope;
use crate::msg::Message;
use crate::osdc::OsdMapView;
use crate::types::DaemonState;
use std::sync::Arc;
use tracing::{debug, trace};

impl MdsDaemon {
    /// Dispatch one inbound envelope.
    pub async fn dispatch(self: &Arc<Self>, env: Envelope) {
        self.heartbeat.reset();
        if self.is_stopping() {
            return;
        }

        let Envelope {
            from,
            peer_addr,
            conn,
            msg,
        } = env;

        let mut core = self.lock_core().await;

        // Drop out early if shutting down.
        if core.want_state == DaemonState::Dne {
            debug!(kind = msg.type_name(), %from, "shutting down, discarding message");
            return;
        }

        if !msg.is_core() {
            let accepted = self.handle_rank_message(&mut core, &from, &conn, &msg);
            if !accepted {
                trace!(kind = msg.type_name(), %from, "rank message not accepted");
            }
            return;
        }

        if !msg.allowed_from(from.entity_type) {
            self.clog.warn(format!(
                "dropping {} from unauthorized sender {} at {}",
                msg.type_name(),
                from,
                peer_addr
            ));
            return;
        }

        let action = match msg {
            Message::MonMap { epoch } => {
                debug!(epoch, "monitor map acknowledged");
                None
            }
            Message::MdsMap { epoch, payload } => {
                membership::handle_mds_map(self, &mut core, from, epoch, &payload)
            }
            Message::MonCommand { args } => {
                admin::handle_command_legacy(self, &mut core, &args)
            }
            Message::Command { tid, cmdmap } => {
                admin::handle_command_msg(self, &mut core, conn.as_ref(), tid, &cmdmap);
                None
            }
            Message::CommandReply { tid, .. } => {
                trace!(tid, "ignoring command reply addressed to us");
                None
            }
            Message::OsdMap {
                epoch,
                up_nodes,
                features,
            } => {
                self.objecter.install_map(OsdMapView {
                    epoch,
                    up_nodes,
                    features,
                });
                if core.state.is_active() {
                    core.snapserver.check_osd_map(epoch, true);
                }
                core.sessions.note_osdmap(epoch);
                // Keep requesting maps so full-flag policy stays current.
                self.objecter.maybe_request_map();
                None
            }
            Message::ClientRequest { .. } | Message::PeerEvent { .. } => unreachable!(),
        };

        drop(core);
        match action {
            Some(FatalAction::Suicide) => self.suicide(false).await,
            Some(FatalAction::Respawn) => self.respawn().await,
            None => {}
        }
    }

    /// Rank-plane delegation; returns whether the message was accepted.
    fn handle_rank_message(
        &self,
        core: &mut MdsCore,
        from: &crate::types::EntityName,
        conn: &Option<Arc<crate::messenger::Connection>>,
        msg: &Message,
    ) -> bool {
        // Without a rank there is no data plane to hand the message to.
        if core.whoami.is_none() {
            return false;
        }
        match msg {
            Message::ClientRequest { op } => {
                if core.state < DaemonState::ClientReplay {
                    return false;
                }
                if let Some(conn) = conn {
                    if let Some(session) = conn.session() {
                        session.note_request();
                        session.note_completed_request();
                    }
                }
                let id = self.op_tracker.start_op(format!("client_request({})", op));
                self.op_tracker.finish_op(id);
                true
            }
            Message::PeerEvent { description } => {
                debug!(%from, description, "peer event");
                true
            }
            _ => false,
        }
    }
}
