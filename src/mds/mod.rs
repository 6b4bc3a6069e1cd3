//! The MDS daemon controller.
//!
//! [`MdsDaemon`] owns the single controller lock under which all controller
//! and data-plane state mutates, constructs every peer, and exposes the
//! lifecycle entry points: `init`, `suicide`, `respawn`, `damaged`, and
//! signal handling. The membership state machine, message dispatcher, and
//! admin surface live in the sibling modules and operate on [`MdsCore`]
//! through that lock.

pub mod admin;
pub mod dispatch;
pub mod membership;

use crate::auth::{AuthCaps, AuthorizeRegistry, AuthorizerPayload};
use crate::balancer::Balancer;
use crate::beacon::Beacon;
use crate::cache::MetaCache;
use crate::clog::ClusterLog;
use crate::config::{ChangeSet, ConfigHandle, MdsConfig};
use crate::error::{LatticeError, Result};
use crate::inotable::InoTable;
use crate::journal::Journal;
use crate::locker::Locker;
use crate::map::MdsMap;
use crate::messenger::{Connection, Messenger};
use crate::migrator::Migrator;
use crate::mon::{MonClient, MonitorBackend};
use crate::msg::{HealthMetric, MdsHealth, Message};
use crate::ops::OpTracker;
use crate::osdc::ObjectClient;
use crate::session::SessionMap;
use crate::snapshot::{SnapClient, SnapServer};
use crate::types::{DaemonState, EntityName, EntityType, Epoch, MdsRank, StandbyHint};
use parking_lot::Mutex as PlMutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How stale the internal watchdog heartbeat may get.
const HEARTBEAT_GRACE: Duration = Duration::from_secs(15);

/// Fatal outcome decided under the controller lock and executed by the
/// dispatch layer once the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalAction {
    /// Terminal teardown; the daemon never serves again.
    Suicide,
    /// Process-image replacement; the daemon may return as standby.
    Respawn,
}

/// How [`MdsDaemon::respawn`] replaces the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMode {
    /// Real `execv` of the current binary with the original argv.
    Exec,
    /// Record the intent and latch the daemon; a supervising parent (or a
    /// test harness) performs the relaunch.
    Latch,
}

/// Process-lifecycle seam shared by `suicide`/`respawn`/`damaged`.
pub struct Lifecycle {
    mode: LifecycleMode,
    argv: Vec<String>,
    respawns: AtomicU32,
    suicides: AtomicU32,
}

impl Lifecycle {
    /// Real process replacement with the invoking argv.
    pub fn exec() -> Self {
        Self {
            mode: LifecycleMode::Exec,
            argv: std::env::args().collect(),
            respawns: AtomicU32::new(0),
            suicides: AtomicU32::new(0),
        }
    }

    /// Supervisor-assisted mode: intents are recorded, the process stays.
    pub fn latched() -> Self {
        Self {
            mode: LifecycleMode::Latch,
            argv: Vec::new(),
            respawns: AtomicU32::new(0),
            suicides: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> LifecycleMode {
        self.mode
    }

    pub fn respawns(&self) -> u32 {
        self.respawns.load(Ordering::SeqCst)
    }

    pub fn suicides(&self) -> u32 {
        self.suicides.load(Ordering::SeqCst)
    }

    fn note_respawn(&self) {
        self.respawns.fetch_add(1, Ordering::SeqCst);
    }

    fn note_suicide(&self) {
        self.suicides.fetch_add(1, Ordering::SeqCst);
    }
}

/// Replace the process image with the original argv.
///
/// Only returns on failure; callers treat any return as fatal.
#[cfg(not(unix))]
fn exec_respawn(_argv: &[String]) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process-image replacement requires unix",
    )
}

#[cfg(unix)]
fn exec_respawn(argv: &[String]) -> std::io::Error {
    use std::os::unix::process::CommandExt;

    // The new image must start with a clean signal mask.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }

    let exe = std::fs::read_link("/proc/self/exe").unwrap_or_else(|_| {
        // Best effort: run whatever argv[0] resolves to in our cwd.
        PathBuf::from(argv.first().cloned().unwrap_or_default())
    });
    info!(?exe, ?argv, "replacing process image");

    let mut cmd = std::process::Command::new(exe);
    if argv.len() > 1 {
        cmd.args(&argv[1..]);
    }
    cmd.exec()
}

/// Internal watchdog fed by the dispatcher and tick.
pub struct Heartbeat {
    last_reset: PlMutex<Instant>,
    grace: Duration,
    registered: AtomicBool,
}

impl Heartbeat {
    fn new(grace: Duration) -> Self {
        Self {
            last_reset: PlMutex::new(Instant::now()),
            grace,
            registered: AtomicBool::new(false),
        }
    }

    pub fn reset(&self) {
        *self.last_reset.lock() = Instant::now();
    }

    pub fn is_healthy(&self) -> bool {
        self.last_reset.lock().elapsed() < self.grace
    }

    pub fn register_worker(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    pub fn remove_worker(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }
}

/// Data-plane entry points invoked by the membership fan-out, retained for
/// the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    BootCreate,
    BootStart,
    ReplayStart,
    ResolveStart,
    ReconnectStart,
    RejoinStart,
    ClientReplayStart,
    ActiveStart,
    StoppingStart,
    RecoveryDone(DaemonState),
}

type Continuation = Box<dyn FnOnce(&mut MdsCore) + Send>;

/// Everything guarded by the controller lock.
pub struct MdsCore {
    pub(crate) whoami: Option<MdsRank>,
    pub(crate) incarnation: u32,
    pub(crate) state: DaemonState,
    pub(crate) last_state: DaemonState,
    pub(crate) want_state: DaemonState,
    pub(crate) standby_type: Option<DaemonState>,
    pub(crate) standby_for_rank: Option<MdsRank>,
    pub(crate) standby_for_name: String,
    pub(crate) standby_hint: StandbyHint,
    pub(crate) mdsmap: Arc<MdsMap>,
    pub(crate) peer_mdsmap_epoch: HashMap<u64, Epoch>,
    pub(crate) osd_epoch_barrier: Epoch,
    pub(crate) last_client_map_bcast: Epoch,
    pub(crate) waiting_for_mdsmap: BTreeMap<Epoch, Vec<oneshot::Sender<()>>>,
    pub(crate) waiting_for_active_peer: HashMap<MdsRank, Vec<oneshot::Sender<()>>>,
    pub(crate) recovery_steps: Vec<RecoveryStep>,
    pub sessions: SessionMap,
    pub cache: MetaCache,
    pub journal: Journal,
    pub balancer: Balancer,
    pub migrator: Migrator,
    pub locker: Locker,
    pub snapserver: SnapServer,
    pub snapclient: SnapClient,
    pub inotable: InoTable,
}

impl MdsCore {
    fn new() -> Self {
        Self {
            whoami: None,
            incarnation: 0,
            state: DaemonState::Boot,
            last_state: DaemonState::Boot,
            want_state: DaemonState::Boot,
            standby_type: None,
            standby_for_rank: None,
            standby_for_name: String::new(),
            standby_hint: StandbyHint::Unset,
            mdsmap: Arc::new(MdsMap::default()),
            peer_mdsmap_epoch: HashMap::new(),
            osd_epoch_barrier: 0,
            last_client_map_bcast: 0,
            waiting_for_mdsmap: BTreeMap::new(),
            waiting_for_active_peer: HashMap::new(),
            recovery_steps: Vec::new(),
            sessions: SessionMap::new(),
            cache: MetaCache::new(),
            journal: Journal::new(),
            balancer: Balancer::new(),
            migrator: Migrator::new(),
            locker: Locker::new(),
            snapserver: SnapServer::new(),
            snapclient: SnapClient::new(),
            inotable: InoTable::new(),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn last_state(&self) -> DaemonState {
        self.last_state
    }

    pub fn want_state(&self) -> DaemonState {
        self.want_state
    }

    pub fn whoami(&self) -> Option<MdsRank> {
        self.whoami
    }

    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    pub fn mdsmap(&self) -> &Arc<MdsMap> {
        &self.mdsmap
    }

    pub fn map_epoch(&self) -> Epoch {
        self.mdsmap.epoch()
    }

    pub fn osd_epoch_barrier(&self) -> Epoch {
        self.osd_epoch_barrier
    }

    /// Raise the OSD epoch barrier; it never decreases.
    pub fn set_osd_epoch_barrier(&mut self, epoch: Epoch) {
        if epoch > self.osd_epoch_barrier {
            debug!(epoch, "osd epoch barrier raised");
            self.osd_epoch_barrier = epoch;
        }
    }

    pub fn recovery_steps(&self) -> &[RecoveryStep] {
        &self.recovery_steps
    }

    /// Continuations still parked on future map epochs.
    pub fn pending_map_waiters(&self) -> usize {
        self.waiting_for_mdsmap.values().map(Vec::len).sum()
    }

    /// Park a continuation until the installed map reaches `epoch`.
    pub fn wait_for_mdsmap(&mut self, epoch: Epoch) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.mdsmap.epoch() >= epoch {
            let _ = tx.send(());
        } else {
            self.waiting_for_mdsmap.entry(epoch).or_default().push(tx);
        }
        rx
    }

    /// Kill a session and journal the close.
    ///
    /// Returns a receiver that completes once the close has committed, or
    /// `None` when no such session exists.
    pub(crate) fn kill_session(&mut self, name: EntityName) -> Option<oneshot::Receiver<i32>> {
        let session = self.sessions.get(&name)?;
        info!(session = %name, "killing session");
        session.set_state(crate::session::SessionState::Killing);
        if let Some(conn) = session.connection() {
            conn.mark_down();
            conn.clear_session();
        }
        self.sessions.remove(&name);

        let rx = self.journal.wait_for_safe();
        self.journal.submit_event(64);
        self.journal.flush();
        metrics::counter!("mds.sessions_evicted").increment(1);
        Some(rx)
    }

    /// Share the installed map with every client session.
    pub(crate) fn bcast_mds_map(&mut self) {
        let epoch = self.mdsmap.epoch();
        if epoch <= self.last_client_map_bcast {
            return;
        }
        let payload = self.mdsmap.encode();
        for session in self.sessions.client_sessions() {
            session.send_or_queue(Message::MdsMap {
                epoch,
                payload: payload.clone(),
            });
        }
        self.last_client_map_bcast = epoch;
        debug!(epoch, "broadcast map to clients");
    }

    fn step(&mut self, step: RecoveryStep) {
        debug!(?step, "data-plane entry point");
        self.recovery_steps.push(step);
    }

    pub(crate) fn boot_create(&mut self) {
        self.step(RecoveryStep::BootCreate);
        let rank = self.whoami.unwrap_or(MdsRank(0));
        self.inotable.reset(rank.0);
        self.journal.create();
        let root = self.inotable.alloc();
        self.cache.create_root(root, rank);
    }

    pub(crate) fn boot_start(&mut self) {
        self.step(RecoveryStep::BootStart);
        self.journal.create();
    }

    pub(crate) fn replay_start(&mut self) {
        self.step(RecoveryStep::ReplayStart);
    }

    pub(crate) fn resolve_start(&mut self) {
        self.step(RecoveryStep::ResolveStart);
        self.cache.send_resolves();
    }

    pub(crate) fn reconnect_start(&mut self) {
        self.step(RecoveryStep::ReconnectStart);
    }

    pub(crate) fn rejoin_start(&mut self) {
        self.step(RecoveryStep::RejoinStart);
    }

    pub(crate) fn clientreplay_start(&mut self) {
        self.step(RecoveryStep::ClientReplayStart);
    }

    pub(crate) fn active_start(&mut self) {
        self.step(RecoveryStep::ActiveStart);
        self.cache.activate();
    }

    pub(crate) fn stopping_start(&mut self) {
        self.step(RecoveryStep::StoppingStart);
    }

    pub(crate) fn recovery_done(&mut self, oldstate: DaemonState) {
        self.step(RecoveryStep::RecoveryDone(oldstate));
    }

    /// Idle-session sweep from the tick.
    pub(crate) fn find_idle_sessions(&mut self, cutoff: Duration) {
        for session in self.sessions.find_idle(cutoff) {
            warn!(session = %session.name(), idle = ?session.idle_for(), "evicting idle session");
            self.kill_session(session.name());
        }
    }

    /// Periodic reconnect-phase bookkeeping.
    pub(crate) fn reconnect_tick(&mut self) {
        // Reconnect timeouts are enforced by the session layer; the tick
        // only has to keep the phase moving.
        debug!("reconnect tick");
    }
}

/// The MDS daemon supervisor.
pub struct MdsDaemon {
    name: String,
    config: ConfigHandle,
    pub(crate) messenger: Arc<Messenger>,
    pub(crate) monc: Arc<MonClient>,
    pub(crate) objecter: Arc<ObjectClient>,
    pub(crate) beacon: Arc<Beacon>,
    pub(crate) clog: Arc<ClusterLog>,
    pub(crate) op_tracker: Arc<OpTracker>,
    pub(crate) authorize_cluster: AuthorizeRegistry,
    pub(crate) authorize_service: AuthorizeRegistry,
    pub(crate) commands: admin::CommandRegistry,
    pub(crate) heartbeat: Heartbeat,
    lifecycle: Lifecycle,
    stopping: AtomicBool,
    core: Mutex<MdsCore>,
    finisher_tx: mpsc::UnboundedSender<Continuation>,
    finisher_rx: PlMutex<Option<mpsc::UnboundedReceiver<Continuation>>>,
    finisher_stopped: AtomicBool,
    tick_task: PlMutex<Option<JoinHandle<()>>>,
    progress_task: PlMutex<Option<JoinHandle<()>>>,
    dispatch_task: PlMutex<Option<JoinHandle<()>>>,
    config_task: PlMutex<Option<JoinHandle<()>>>,
    admin_socket: PlMutex<Option<admin::AdminSocket>>,
}

impl MdsDaemon {
    /// Wire the daemon and its peers. Nothing asynchronous happens here;
    /// `init` starts the machinery.
    pub fn new(
        config: MdsConfig,
        backend: Arc<dyn MonitorBackend>,
        lifecycle: Lifecycle,
    ) -> Arc<Self> {
        let name = config.name.clone();
        let config = ConfigHandle::new(config);
        let (beacon_interval, beacon_grace, clog_cfg, op_cfg) = config.with(|c| {
            (
                c.beacon_interval,
                c.beacon_grace,
                c.clog.clone(),
                c.op.clone(),
            )
        });

        let messenger = Messenger::new(EntityName::mds(u64::MAX));
        let monc = MonClient::new(backend);
        let objecter = Arc::new(ObjectClient::new());
        let beacon = Beacon::new(name.clone(), monc.clone(), beacon_interval, beacon_grace);
        let clog = ClusterLog::new(monc.clone(), clog_cfg);
        let op_tracker = Arc::new(OpTracker::new(op_cfg));
        let (finisher_tx, finisher_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            name,
            config,
            messenger,
            monc,
            objecter,
            beacon,
            clog,
            op_tracker,
            authorize_cluster: AuthorizeRegistry::with_defaults(),
            authorize_service: AuthorizeRegistry::with_defaults(),
            commands: admin::CommandRegistry::new(),
            heartbeat: Heartbeat::new(HEARTBEAT_GRACE),
            lifecycle,
            stopping: AtomicBool::new(false),
            core: Mutex::new(MdsCore::new()),
            finisher_tx,
            finisher_rx: PlMutex::new(Some(finisher_rx)),
            finisher_stopped: AtomicBool::new(false),
            tick_task: PlMutex::new(None),
            progress_task: PlMutex::new(None),
            dispatch_task: PlMutex::new(None),
            config_task: PlMutex::new(None),
            admin_socket: PlMutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn monitor_client(&self) -> &Arc<MonClient> {
        &self.monc
    }

    pub fn object_client(&self) -> &Arc<ObjectClient> {
        &self.objecter
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn beacon(&self) -> &Arc<Beacon> {
        &self.beacon
    }

    pub fn cluster_log(&self) -> &Arc<ClusterLog> {
        &self.clog
    }

    pub fn op_tracker(&self) -> &Arc<OpTracker> {
        &self.op_tracker
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) async fn lock_core(&self) -> MutexGuard<'_, MdsCore> {
        self.core.lock().await
    }

    /// Read controller state under the lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&MdsCore) -> R) -> R {
        let core = self.core.lock().await;
        f(&core)
    }

    /// Mutate controller state under the lock (harness and peer use).
    pub async fn with_core_mut<R>(&self, f: impl FnOnce(&mut MdsCore) -> R) -> R {
        let mut core = self.core.lock().await;
        f(&mut core)
    }

    /// Post a continuation to run under the controller lock.
    pub fn queue_continuation(&self, f: impl FnOnce(&mut MdsCore) + Send + 'static) {
        if self.finisher_stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.finisher_tx.send(Box::new(f));
    }

    pub(crate) fn wake_progress(&self) {
        self.queue_continuation(|_| {});
    }

    /// Bring the daemon up. See the ordered sequence in the module docs;
    /// returns the authentication error when the monitor rejects us.
    pub async fn init(self: &Arc<Self>, wanted_state: DaemonState) -> Result<()> {
        self.objecter.init();

        let gid = match self.monc.authenticate(&self.name).await {
            Ok(gid) => gid,
            Err(e) => {
                error!("failed to authenticate: {}", e);
                {
                    let mut core = self.core.lock().await;
                    core.want_state = DaemonState::Dne;
                    self.beacon.set_want_state(DaemonState::Dne);
                }
                self.suicide(false).await;
                return Err(e);
            }
        };

        let rotating_timeout = self.config.with(|c| c.auth_rotating_timeout);
        while let Err(e) = self.monc.wait_auth_rotating(rotating_timeout).await {
            if matches!(e, LatticeError::ShuttingDown) {
                return Err(e);
            }
            error!("unable to obtain rotating service keys; retrying: {}", e);
        }

        self.objecter.start();

        {
            let core = self.core.lock().await;
            if core.want_state == DaemonState::Dne {
                return Ok(());
            }
        }

        self.monc.sub_want("mdsmap", 0);
        self.monc.renew_subs().await;

        // Block until the backend is serving and advertises sorted-map
        // support; the journal cannot run without it.
        let poll = self.config.with(|c| c.backend_poll_interval);
        loop {
            self.objecter.maybe_request_map();
            let view = self.objecter.osdmap();
            if view.up_nodes > 0 && view.features & crate::map::FEATURE_OMAP != 0 {
                break;
            }
            if view.up_nodes > 0 {
                error!(
                    "store nodes do not advertise sorted-map support; upgrade them before starting the MDS"
                );
            } else {
                warn!(epoch = view.epoch, "no store nodes up yet, waiting");
            }
            if self.is_stopping() {
                return Err(LatticeError::ShuttingDown);
            }
            tokio::time::sleep(poll).await;
        }

        let cfg = self.config.get();
        {
            let mut core = self.core.lock().await;
            if core.want_state == DaemonState::Dne {
                drop(core);
                self.suicide(false).await;
                return Ok(());
            }

            let requested = if wanted_state == DaemonState::Boot && cfg.standby_replay {
                DaemonState::StandbyReplay
            } else {
                wanted_state
            };
            core.want_state = requested;

            if matches!(
                requested,
                DaemonState::StandbyReplay | DaemonState::OneshotReplay
            ) {
                if requested == DaemonState::OneshotReplay
                    && cfg.standby_for_rank.is_none()
                    && cfg.standby_for_name.is_empty()
                {
                    error!("oneshot replay requested without a target rank or name");
                    drop(core);
                    self.suicide(false).await;
                    return Err(LatticeError::InvalidConfig {
                        field: "standby_for_rank".to_string(),
                        reason: "oneshot replay needs a target rank or name".to_string(),
                    });
                }
                core.standby_type = Some(requested);
                core.want_state = DaemonState::Boot;
            }

            core.standby_for_rank = cfg.standby_for_rank.map(MdsRank);
            core.standby_for_name = cfg.standby_for_name.clone();
            core.standby_hint = match core.standby_for_rank {
                Some(rank) => StandbyHint::Rank(rank),
                None => StandbyHint::Unset,
            };
            if requested == DaemonState::StandbyReplay && core.standby_for_rank.is_none() {
                core.standby_hint = if core.standby_for_name.is_empty() {
                    StandbyHint::Any
                } else {
                    StandbyHint::Name
                };
            } else if core.standby_type.is_none() && !core.standby_for_name.is_empty() {
                core.standby_hint = StandbyHint::MatchedActive;
            }

            // The beacon now advertises us to the monitor, which will mint
            // a map slot for this gid.
            self.beacon.init(
                core.mdsmap.epoch(),
                core.want_state,
                core.standby_hint,
                core.standby_for_name.clone(),
            );

            core.whoami = None;
            self.messenger.set_myname(EntityName::mds(gid.0));
        }

        self.heartbeat.register_worker();
        self.reset_tick();
        self.start_progress_worker();
        self.start_dispatch_pump();
        self.create_counters();
        admin::register_commands(&self.commands)?;
        let socket_path = cfg.admin_socket_path.clone();
        let socket = admin::AdminSocket::bind(self.clone(), socket_path).await?;
        *self.admin_socket.lock() = Some(socket);
        self.start_config_observer();
        self.beacon.kick();

        info!(gid = %gid, name = %self.name, "MDS daemon initialized");
        Ok(())
    }

    /// One-shot terminal shutdown.
    ///
    /// Re-entry is blocked by the stopping latch: a second call returns
    /// without touching anything.
    pub async fn suicide(&self, fast: bool) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifecycle.note_suicide();

        let (send_final, want, state) = {
            let mut core = self.core.lock().await;
            core.want_state = DaemonState::Dne;
            self.beacon.set_want_state(DaemonState::Dne);
            let send_final = !fast && !core.mdsmap.is_dne_gid(self.monc.global_id());
            (send_final, core.want_state, core.state)
        };

        if send_final {
            // Tell the monitor we are going away so it doesn't wait for us
            // to go laggy. Skipped when the map no longer lists us.
            self.beacon.send_and_wait(Duration::from_secs(1)).await;
        }

        info!(wanted = %want, current = %state, "suicide");

        // Teardown, reverse dependency order.
        {
            let mut core = self.core.lock().await;
            core.journal.shutdown();
        }
        self.finisher_stopped.store(true, Ordering::SeqCst);
        self.beacon.shutdown();
        if let Some(task) = self.tick_task.lock().take() {
            task.abort();
        }
        if let Some(socket) = self.admin_socket.lock().take() {
            socket.shutdown();
        }
        self.commands.unregister_all();
        {
            let mut core = self.core.lock().await;
            core.cache.shutdown();
        }
        self.objecter.shutdown();
        self.monc.shutdown();
        self.op_tracker.on_shutdown();
        if let Some(task) = self.progress_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.config_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        self.messenger.shutdown();
        self.heartbeat.remove_worker();
    }

    /// Replace the process image, preserving the original argv.
    ///
    /// In `Exec` mode this never returns on success. In `Latch` mode the
    /// intent is recorded and the daemon latches as if the image had been
    /// replaced; the supervising parent performs the relaunch.
    pub async fn respawn(&self) {
        info!("respawn");
        self.lifecycle.note_respawn();
        match self.lifecycle.mode() {
            LifecycleMode::Exec => {
                let err = exec_respawn(&self.lifecycle.argv);
                // Returning from exec means the image was not replaced;
                // callers rely on respawn never returning.
                error!("respawn exec failed: {}", err);
                std::process::abort();
            }
            LifecycleMode::Latch => {
                self.stopping.store(true, Ordering::SeqCst);
                self.beacon.shutdown();
                if let Some(task) = self.tick_task.lock().take() {
                    task.abort();
                }
                if let Some(task) = self.dispatch_task.lock().take() {
                    task.abort();
                }
                if let Some(task) = self.progress_task.lock().take() {
                    task.abort();
                }
            }
        }
    }

    /// Escalation for unrepairable data-plane corruption: tell the monitor,
    /// then respawn into standby so another daemon can take the rank.
    pub async fn damaged(&self) {
        {
            let mut core = self.core.lock().await;
            core.want_state = DaemonState::Damaged;
            self.beacon.set_want_state(DaemonState::Damaged);
        }
        self.clog.flush().await;

        let timeout = self.config.with(|c| c.mon_shutdown_timeout);
        // A timeout here is acceptable: whoever takes the rank next will
        // hit the same damage and report it again.
        self.beacon.send_and_wait(timeout).await;

        self.respawn().await;
    }

    /// SIGINT/SIGTERM entry point.
    pub async fn handle_signal(&self, signum: i32) {
        warn!(signum, "got signal");
        if self.is_stopping() {
            return;
        }
        self.suicide(false).await;
    }

    fn reset_tick(self: &Arc<Self>) {
        let daemon = self.clone();
        let interval = self.config.with(|c| c.tick_interval);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if daemon.is_stopping() {
                    break;
                }
                daemon.tick().await;
            }
        });
        *self.tick_task.lock() = Some(handle);
    }

    fn start_progress_worker(self: &Arc<Self>) {
        let Some(mut rx) = self.finisher_rx.lock().take() else {
            return;
        };
        let daemon = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(f) = rx.recv().await {
                if daemon.is_stopping() {
                    break;
                }
                let mut core = daemon.core.lock().await;
                f(&mut core);
            }
        });
        *self.progress_task.lock() = Some(handle);
    }

    fn start_dispatch_pump(self: &Arc<Self>) {
        let Some(mut rx) = self.messenger.take_inbound() else {
            return;
        };
        let daemon = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                daemon.messenger.note_dequeued();
                if daemon.is_stopping() {
                    break;
                }
                daemon.dispatch(env).await;
            }
        });
        *self.dispatch_task.lock() = Some(handle);
    }

    fn start_config_observer(self: &Arc<Self>) {
        let mut rx = self.config.subscribe();
        let daemon = self.clone();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let changed = rx.borrow().clone();
                daemon.handle_conf_change(&changed);
            }
        });
        *self.config_task.lock() = Some(handle);
    }

    /// Apply live changes to tracked configuration keys.
    pub fn handle_conf_change(&self, changed: &ChangeSet) {
        if changed.contains("mds_op_complaint_time") || changed.contains("mds_op_log_threshold") {
            let (time, threshold) =
                self.config.with(|c| (c.op.complaint_time, c.op.log_threshold));
            self.op_tracker.set_complaint_and_threshold(time, threshold);
        }
        if changed.contains("mds_op_history_size") || changed.contains("mds_op_history_duration") {
            let (size, duration) =
                self.config.with(|c| (c.op.history_size, c.op.history_duration));
            self.op_tracker.set_history_size_and_duration(size, duration);
        }
        if changed.iter().any(|k| k.starts_with("clog_to_")) {
            self.clog.update_config(self.config.with(|c| c.clog.clone()));
        }
    }

    fn create_counters(&self) {
        metrics::describe_gauge!("mds.load", "Published metadata load");
        metrics::describe_gauge!("mds.dispatch_queue_len", "Inbound dispatch queue length");
        metrics::describe_gauge!("mds.subtrees", "Subtrees held by this rank");
        metrics::describe_gauge!("mds.inodes", "Cached inodes");
        metrics::describe_gauge!("mds.sessions", "Live client sessions");
        metrics::describe_counter!("mds.sessions_evicted", "Sessions evicted");
        metrics::describe_counter!("mds.dir_split", "Directory fragment splits");
    }

    /// Periodic maintenance.
    pub async fn tick(self: &Arc<Self>) {
        self.heartbeat.reset();

        if self.beacon.is_laggy() {
            debug!("tick bailing out since we seem laggy");
            return;
        }
        // We may have been laggy; make sure parked continuations progress.
        self.wake_progress();

        let mut core = self.core.lock().await;
        core.journal.flush();

        let state = core.state;
        if state.is_active() || state.is_stopping() {
            core.cache.trim();
            core.cache.trim_client_leases();
            core.cache.check_memory_usage();
            core.journal.trim();
        }

        let queue_len = self.messenger.dispatch_queue_len();
        let load = core.balancer.get_load(queue_len);
        metrics::gauge!("mds.load").set(load.mds_load());
        metrics::gauge!("mds.dispatch_queue_len").set(queue_len as f64);
        metrics::gauge!("mds.subtrees").set(core.cache.num_subtrees() as f64);
        metrics::gauge!("mds.inodes").set(core.cache.num_inodes() as f64);
        metrics::gauge!("mds.sessions").set(core.sessions.len() as f64);

        if state.is_clientreplay() || state.is_active() || state.is_stopping() {
            core.locker.tick();
            let cutoff = self.config.with(|c| c.session_timeout);
            core.find_idle_sessions(cutoff);
        }

        if state.is_reconnect() {
            core.reconnect_tick();
        }

        if state.is_active() {
            core.balancer.tick();
            core.cache.find_stale_fragment_freeze();
            core.migrator.find_stale_export_freeze();
            let osd_epoch = self.objecter.epoch();
            core.snapserver.check_osd_map(osd_epoch, false);
        }
        drop(core);

        // Refresh health and warn about anything slow.
        let warnings = self.op_tracker.check_ops_in_flight();
        let mut health = MdsHealth::default();
        if !warnings.is_empty() {
            health.metrics.push(HealthMetric {
                code: "MDS_SLOW_REQUEST".to_string(),
                message: format!("{} slow requests", warnings.len()),
            });
        }
        self.beacon.notify_health(health);
        for warning in warnings {
            self.clog.warn(warning);
        }
    }

    // Connection & session glue.

    /// Verify a connecting peer's authorizer and wire up its session.
    ///
    /// Returns `Ok(true)` when the peer is authorized.
    pub async fn verify_authorizer(
        &self,
        conn: &Arc<Connection>,
        payload: AuthorizerPayload,
    ) -> Result<bool> {
        if self.is_stopping() {
            return Err(LatticeError::ShuttingDown);
        }
        let mut core = self.core.lock().await;
        if core.want_state == DaemonState::Dne {
            return Ok(false);
        }

        let registry = match conn.peer_type() {
            EntityType::Mds => &self.authorize_cluster,
            _ => &self.authorize_service,
        };
        let Some(handler) = registry.get_handler(payload.protocol) else {
            warn!(protocol = payload.protocol, "no authorize handler for protocol");
            return Ok(false);
        };

        let identity = match handler.verify(&self.monc.rotating_secrets(), &payload) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(peer = %conn.peer_addr(), "authorizer rejected: {}", e);
                return Ok(false);
            }
        };

        let name = EntityName {
            entity_type: conn.peer_type(),
            id: identity.global_id.0,
        };
        let session = core.sessions.get_or_create(name, conn.peer_addr());
        conn.set_session(session.clone());

        let mut caps = match identity.caps.as_deref() {
            Some(s) => AuthCaps::parse(s).unwrap_or_else(|e| {
                debug!(session = %name, "auth cap parse error: {}", e);
                AuthCaps::legacy()
            }),
            // Missing cap payload: legacy permissive-fs / deny-tell.
            None => AuthCaps::legacy(),
        };
        if identity.allow_all {
            caps.set_allow_all();
        }
        session.set_auth_caps(caps);
        Ok(true)
    }

    /// The messenger fully accepted `conn`; resolve the accept race in its
    /// favor and flush any pre-open queue.
    pub async fn handle_accept(&self, conn: &Arc<Connection>) {
        if self.is_stopping() {
            return;
        }
        let _core = self.core.lock().await;
        if let Some(session) = conn.session() {
            session.adopt_connection(conn.clone());
        }
    }

    /// Local connection reset.
    pub async fn handle_reset(&self, conn: &Arc<Connection>) {
        if conn.peer_type() != EntityType::Client {
            return;
        }
        if self.is_stopping() {
            return;
        }
        let core = self.core.lock().await;
        if core.want_state == DaemonState::Dne {
            return;
        }
        debug!(peer = %conn.peer_addr(), "connection reset");
        match conn.session() {
            Some(session) => {
                if session.is_closed() {
                    conn.mark_down();
                    conn.clear_session();
                }
            }
            None => conn.mark_down(),
        }
    }

    /// Peer-initiated connection reset; same closed-session teardown.
    pub async fn handle_remote_reset(&self, conn: &Arc<Connection>) {
        if conn.peer_type() != EntityType::Client {
            return;
        }
        if self.is_stopping() {
            return;
        }
        let core = self.core.lock().await;
        if core.want_state == DaemonState::Dne {
            return;
        }
        debug!(peer = %conn.peer_addr(), "remote connection reset");
        if let Some(session) = conn.session() {
            if session.is_closed() {
                conn.mark_down();
                conn.clear_session();
            }
        }
    }
}
