//! In-process connection fabric.
//!
//! The messenger owns every live [`Connection`], queues inbound envelopes
//! for the dispatcher, and lets the controller mark peer addresses down.
//! Transport framing lives elsewhere; this layer only moves [`Message`]
//! values and tracks connection/session attachment.

use crate::msg::Message;
use crate::session::Session;
use crate::types::{EntityName, EntityType};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub type ConnId = u64;

/// One accepted peer connection.
pub struct Connection {
    id: ConnId,
    peer_type: EntityType,
    peer_addr: SocketAddr,
    open: AtomicBool,
    outbox: Mutex<Vec<Message>>,
    session: Mutex<Option<Arc<Session>>>,
}

impl Connection {
    fn new(id: ConnId, peer_type: EntityType, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_type,
            peer_addr,
            open: AtomicBool::new(true),
            outbox: Mutex::new(Vec::new()),
            session: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_type(&self) -> EntityType {
        self.peer_type
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue a message for the peer. Returns false if the connection is
    /// already down.
    pub fn send_message(&self, msg: Message) -> bool {
        if !self.is_open() {
            return false;
        }
        self.outbox.lock().push(msg);
        true
    }

    pub fn mark_down(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Attach the session owning this connection.
    pub fn set_session(&self, session: Arc<Session>) {
        *self.session.lock() = Some(session);
    }

    pub fn clear_session(&self) {
        *self.session.lock() = None;
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    /// Drain everything queued on this connection.
    pub fn take_outbox(&self) -> Vec<Message> {
        std::mem::take(&mut *self.outbox.lock())
    }

    pub fn queued_len(&self) -> usize {
        self.outbox.lock().len()
    }
}

/// An inbound message together with its provenance.
#[derive(Clone)]
pub struct Envelope {
    pub from: EntityName,
    pub peer_addr: SocketAddr,
    pub conn: Option<Arc<Connection>>,
    pub msg: Message,
}

impl Envelope {
    /// An envelope with no backing connection (monitor-side injection).
    pub fn bare(from: EntityName, peer_addr: SocketAddr, msg: Message) -> Self {
        Self {
            from,
            peer_addr,
            conn: None,
            msg,
        }
    }
}

/// The process-wide messenger.
pub struct Messenger {
    myname: Mutex<EntityName>,
    conns: RwLock<HashMap<ConnId, Arc<Connection>>>,
    next_conn_id: AtomicU64,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    queued: AtomicUsize,
    stopped: AtomicBool,
}

impl Messenger {
    pub fn new(myname: EntityName) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            myname: Mutex::new(myname),
            conns: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            queued: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn set_myname(&self, name: EntityName) {
        *self.myname.lock() = name;
    }

    pub fn myname(&self) -> EntityName {
        *self.myname.lock()
    }

    /// Register a newly accepted connection.
    pub fn accept(&self, peer_type: EntityType, peer_addr: SocketAddr) -> Arc<Connection> {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(Connection::new(id, peer_type, peer_addr));
        self.conns.write().insert(id, conn.clone());
        conn
    }

    /// Mark every connection to `addr` down.
    pub fn mark_down_addr(&self, addr: SocketAddr) {
        let conns = self.conns.read();
        for conn in conns.values() {
            if conn.peer_addr() == addr && conn.is_open() {
                debug!(%addr, conn = conn.id(), "marking connection down");
                conn.mark_down();
            }
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.conns.read().values().cloned().collect()
    }

    /// Queue an inbound envelope for the dispatcher.
    pub fn deliver(&self, env: Envelope) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.queued.fetch_add(1, Ordering::SeqCst);
        let _ = self.inbound_tx.send(env);
    }

    /// Take the inbound receiver; the dispatch pump calls this once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.inbound_rx.lock().take()
    }

    /// The dispatch pump reports each dequeued envelope here.
    pub fn note_dequeued(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    pub fn dispatch_queue_len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for conn in self.conns.read().values() {
            conn.mark_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_connection_send_and_drain() {
        let messenger = Messenger::new(EntityName::mds(0));
        let conn = messenger.accept(EntityType::Client, addr(4000));
        assert!(conn.send_message(Message::MonMap { epoch: 1 }));
        assert_eq!(conn.queued_len(), 1);
        assert_eq!(conn.take_outbox().len(), 1);
        assert_eq!(conn.queued_len(), 0);
    }

    #[test]
    fn test_mark_down_addr_closes_all() {
        let messenger = Messenger::new(EntityName::mds(0));
        let a = messenger.accept(EntityType::Mds, addr(4001));
        let b = messenger.accept(EntityType::Mds, addr(4001));
        let other = messenger.accept(EntityType::Mds, addr(4002));

        messenger.mark_down_addr(addr(4001));
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert!(other.is_open());
        assert!(!a.send_message(Message::MonMap { epoch: 1 }));
    }

    #[tokio::test]
    async fn test_deliver_and_queue_length() {
        let messenger = Messenger::new(EntityName::mds(0));
        let mut rx = messenger.take_inbound().unwrap();
        messenger.deliver(Envelope::bare(
            EntityName::mon(0),
            addr(4003),
            Message::MonMap { epoch: 1 },
        ));
        assert_eq!(messenger.dispatch_queue_len(), 1);
        let env = rx.recv().await.unwrap();
        messenger.note_dequeued();
        assert_eq!(env.msg.type_name(), "mon_map");
        assert_eq!(messenger.dispatch_queue_len(), 0);
    }
}
