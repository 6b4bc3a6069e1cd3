//! Client/peer session records.
//!
//! A session is created when a connection passes authorization and lives
//! until eviction or close. The connection owns a back-pointer to the
//! session; the session in turn records the *winning* connection (see
//! accept handling), with messages queued pre-open until one wins.

use crate::auth::AuthCaps;
use crate::messenger::Connection;
use crate::msg::Message;
use crate::types::{EntityName, Epoch};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
    Killing,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Killing => "killing",
        }
    }
}

/// One authenticated peer session.
pub struct Session {
    name: EntityName,
    addr: Mutex<SocketAddr>,
    state: Mutex<SessionState>,
    connection: Mutex<Option<Arc<Connection>>>,
    preopen_out_queue: Mutex<VecDeque<Message>>,
    auth_caps: Mutex<AuthCaps>,
    client_metadata: Mutex<HashMap<String, String>>,
    num_caps: AtomicUsize,
    num_leases: AtomicUsize,
    request_count: AtomicU64,
    completed_requests: AtomicU64,
    last_seen: Mutex<Instant>,
}

impl Session {
    pub fn new(name: EntityName, addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            name,
            addr: Mutex::new(addr),
            state: Mutex::new(SessionState::Open),
            connection: Mutex::new(None),
            preopen_out_queue: Mutex::new(VecDeque::new()),
            auth_caps: Mutex::new(AuthCaps::legacy()),
            client_metadata: Mutex::new(HashMap::new()),
            num_caps: AtomicUsize::new(0),
            num_leases: AtomicUsize::new(0),
            request_count: AtomicU64::new(0),
            completed_requests: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub fn name(&self) -> EntityName {
        self.name
    }

    pub fn addr(&self) -> SocketAddr {
        *self.addr.lock()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closed)
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }

    /// Install the winning connection and flush the pre-open queue onto it.
    pub fn adopt_connection(&self, conn: Arc<Connection>) {
        let mut slot = self.connection.lock();
        let replacing = slot
            .as_ref()
            .map(|old| old.id() != conn.id())
            .unwrap_or(true);
        if !replacing {
            return;
        }
        debug!(session = %self.name, conn = conn.id(), "session adopting connection");
        *slot = Some(conn.clone());
        drop(slot);

        let mut queue = self.preopen_out_queue.lock();
        while let Some(msg) = queue.pop_front() {
            conn.send_message(msg);
        }
    }

    /// Queue an outbound message until a connection wins the accept race.
    pub fn send_or_queue(&self, msg: Message) {
        if let Some(conn) = self.connection() {
            if conn.is_open() && conn.send_message(msg.clone()) {
                return;
            }
        }
        self.preopen_out_queue.lock().push_back(msg);
    }

    pub fn preopen_queue_len(&self) -> usize {
        self.preopen_out_queue.lock().len()
    }

    pub fn auth_caps(&self) -> AuthCaps {
        self.auth_caps.lock().clone()
    }

    pub fn set_auth_caps(&self, caps: AuthCaps) {
        *self.auth_caps.lock() = caps;
    }

    pub fn set_client_metadata(&self, metadata: HashMap<String, String>) {
        *self.client_metadata.lock() = metadata;
    }

    pub fn num_caps(&self) -> usize {
        self.num_caps.load(Ordering::Relaxed)
    }

    pub fn num_leases(&self) -> usize {
        self.num_leases.load(Ordering::Relaxed)
    }

    pub fn note_cap_grant(&self) {
        self.num_caps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    pub fn note_completed_request(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn completed_requests(&self) -> u64 {
        self.completed_requests.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// JSON summary for `session ls`.
    pub fn dump(&self, replaying: bool, reconnecting: bool) -> serde_json::Value {
        json!({
            "id": self.name.id,
            "num_leases": self.num_leases(),
            "num_caps": self.num_caps(),
            "state": self.state().name(),
            "replay_requests": if replaying { self.request_count() } else { 0 },
            "completed_requests": self.completed_requests(),
            "reconnecting": reconnecting,
            "inst": format!("{} {}", self.name, self.addr()),
            "client_metadata": self.client_metadata.lock().clone(),
        })
    }
}

/// The session table, keyed by entity name.
#[derive(Default)]
pub struct SessionMap {
    sessions: HashMap<EntityName, Arc<Session>>,
    evictions: u64,
    last_osdmap_epoch: Epoch,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &EntityName) -> Option<Arc<Session>> {
        self.sessions.get(name).cloned()
    }

    pub fn get_or_create(&mut self, name: EntityName, addr: SocketAddr) -> Arc<Session> {
        if let Some(existing) = self.sessions.get(&name) {
            return existing.clone();
        }
        let session = Session::new(name, addr);
        self.sessions.insert(name, session.clone());
        session
    }

    pub fn remove(&mut self, name: &EntityName) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(name);
        if removed.is_some() {
            self.evictions += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Session>> {
        self.sessions.values()
    }

    pub fn client_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .values()
            .filter(|s| s.name().is_client())
            .cloned()
            .collect()
    }

    /// Client sessions idle longer than `cutoff`.
    pub fn find_idle(&self, cutoff: Duration) -> Vec<Arc<Session>> {
        self.sessions
            .values()
            .filter(|s| s.name().is_client() && s.idle_for() > cutoff)
            .cloned()
            .collect()
    }

    /// Record the latest object-store map epoch observed by the session layer.
    pub fn note_osdmap(&mut self, epoch: Epoch) {
        if epoch > self.last_osdmap_epoch {
            self.last_osdmap_epoch = epoch;
        }
    }

    pub fn last_osdmap_epoch(&self) -> Epoch {
        self.last_osdmap_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::Messenger;
    use crate::types::EntityType;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut map = SessionMap::new();
        let a = map.get_or_create(EntityName::client(1), addr(5000));
        let b = map.get_or_create(EntityName::client(1), addr(5001));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_preopen_queue_drains_on_adopt() {
        let messenger = Messenger::new(EntityName::mds(0));
        let session = Session::new(EntityName::client(7), addr(5002));
        session.send_or_queue(Message::MonMap { epoch: 1 });
        session.send_or_queue(Message::MonMap { epoch: 2 });
        assert_eq!(session.preopen_queue_len(), 2);

        let conn = messenger.accept(EntityType::Client, addr(5002));
        session.adopt_connection(conn.clone());
        assert_eq!(session.preopen_queue_len(), 0);
        assert_eq!(conn.queued_len(), 2);
    }

    #[test]
    fn test_remove_counts_evictions() {
        let mut map = SessionMap::new();
        map.get_or_create(EntityName::client(1), addr(5003));
        assert!(map.remove(&EntityName::client(1)).is_some());
        assert!(map.remove(&EntityName::client(1)).is_none());
        assert_eq!(map.evictions(), 1);
    }

    #[test]
    fn test_osdmap_epoch_monotonic() {
        let mut map = SessionMap::new();
        map.note_osdmap(5);
        map.note_osdmap(3);
        assert_eq!(map.last_osdmap_epoch(), 5);
    }
}
