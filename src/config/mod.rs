//! Configuration for the Lattice MDS daemon.

use crate::error::{LatticeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration keys that may be changed on a running daemon via
/// `injectargs`. Everything else requires a restart.
pub const TRACKED_KEYS: &[&str] = &[
    "mds_op_complaint_time",
    "mds_op_log_threshold",
    "mds_op_history_size",
    "mds_op_history_duration",
    "clog_to_monitors",
    "clog_to_syslog",
    "clog_to_syslog_facility",
    "clog_to_syslog_level",
];

/// Main configuration for an MDS daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdsConfig {
    /// Daemon name, as registered with the monitor.
    pub name: String,
    /// Boot into standby-replay instead of plain boot.
    #[serde(default)]
    pub standby_replay: bool,
    /// Rank to follow when in a standby flavor.
    #[serde(default)]
    pub standby_for_rank: Option<i32>,
    /// Daemon name to follow when in a standby flavor.
    #[serde(default)]
    pub standby_for_name: String,
    /// Suicide when another daemon of the same name holds a larger global id.
    #[serde(default = "default_true")]
    pub enforce_unique_name: bool,
    /// Dump the cache each time a cluster map installs (debugging).
    #[serde(default)]
    pub dump_cache_on_map: bool,
    /// Dump the cache when the cluster finishes rejoining (debugging).
    #[serde(default)]
    pub dump_cache_after_rejoin: bool,
    /// Periodic tick interval.
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Beacon send interval.
    #[serde(with = "humantime_serde", default = "default_beacon_interval")]
    pub beacon_interval: Duration,
    /// Beacon ack age beyond which the daemon considers itself laggy.
    #[serde(with = "humantime_serde", default = "default_beacon_grace")]
    pub beacon_grace: Duration,
    /// Bounded wait for the terminal beacon in `damaged` and `suicide`.
    #[serde(with = "humantime_serde", default = "default_mon_shutdown_timeout")]
    pub mon_shutdown_timeout: Duration,
    /// Poll interval while waiting for backend feature readiness.
    #[serde(with = "humantime_serde", default = "default_backend_poll")]
    pub backend_poll_interval: Duration,
    /// Per-attempt timeout while waiting for rotating service keys.
    #[serde(with = "humantime_serde", default = "default_rotating_timeout")]
    pub auth_rotating_timeout: Duration,
    /// Grace delay before a scheduled `exit`/`respawn` runs.
    #[serde(with = "humantime_serde", default = "default_admin_grace")]
    pub admin_grace: Duration,
    /// Idle client sessions older than this are swept by the tick.
    #[serde(with = "humantime_serde", default = "default_session_timeout")]
    pub session_timeout: Duration,
    /// Local admin command socket path.
    #[serde(default = "default_admin_socket")]
    pub admin_socket_path: PathBuf,
    /// Op tracker settings.
    #[serde(default)]
    pub op: OpTrackerConfig,
    /// Cluster log routing.
    #[serde(default)]
    pub clog: ClogConfig,
}

fn default_true() -> bool {
    true
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_beacon_interval() -> Duration {
    Duration::from_secs(4)
}

fn default_beacon_grace() -> Duration {
    Duration::from_secs(15)
}

fn default_mon_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_backend_poll() -> Duration {
    Duration::from_secs(10)
}

fn default_rotating_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_admin_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_admin_socket() -> PathBuf {
    PathBuf::from("/var/run/lattice/mds.asok")
}

impl Default for MdsConfig {
    fn default() -> Self {
        Self {
            name: "mds-node".to_string(),
            standby_replay: false,
            standby_for_rank: None,
            standby_for_name: String::new(),
            enforce_unique_name: true,
            dump_cache_on_map: false,
            dump_cache_after_rejoin: false,
            tick_interval: default_tick_interval(),
            beacon_interval: default_beacon_interval(),
            beacon_grace: default_beacon_grace(),
            mon_shutdown_timeout: default_mon_shutdown_timeout(),
            backend_poll_interval: default_backend_poll(),
            auth_rotating_timeout: default_rotating_timeout(),
            admin_grace: default_admin_grace(),
            session_timeout: default_session_timeout(),
            admin_socket_path: default_admin_socket(),
            op: OpTrackerConfig::default(),
            clog: ClogConfig::default(),
        }
    }
}

impl MdsConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LatticeError::Config(format!("Failed to read config file: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| LatticeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LatticeError::InvalidConfig {
                field: "name".to_string(),
                reason: "daemon name must not be empty".to_string(),
            });
        }
        if self.tick_interval.is_zero() {
            return Err(LatticeError::InvalidConfig {
                field: "tick_interval".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.op.history_size == 0 {
            return Err(LatticeError::InvalidConfig {
                field: "op.history_size".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// A single-node development configuration with short timers and a
    /// scratch admin socket.
    pub fn development(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tick_interval: Duration::from_millis(500),
            beacon_interval: Duration::from_millis(500),
            backend_poll_interval: Duration::from_millis(100),
            admin_grace: Duration::from_millis(50),
            admin_socket_path: std::env::temp_dir().join(format!(
                "lattice-mds-{}.asok",
                std::process::id()
            )),
            ..Default::default()
        }
    }
}

/// Op tracker settings; all four are live-reloadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpTrackerConfig {
    /// In-flight ops older than this are reported as slow.
    #[serde(with = "humantime_serde", default = "default_complaint_time")]
    pub complaint_time: Duration,
    /// Maximum slow-op warnings emitted per scan.
    #[serde(default = "default_log_threshold")]
    pub log_threshold: usize,
    /// Completed ops kept for `dump_historic_ops`.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Completed ops older than this are dropped from history.
    #[serde(with = "humantime_serde", default = "default_history_duration")]
    pub history_duration: Duration,
}

fn default_complaint_time() -> Duration {
    Duration::from_secs(30)
}

fn default_log_threshold() -> usize {
    5
}

fn default_history_size() -> usize {
    20
}

fn default_history_duration() -> Duration {
    Duration::from_secs(600)
}

impl Default for OpTrackerConfig {
    fn default() -> Self {
        Self {
            complaint_time: default_complaint_time(),
            log_threshold: default_log_threshold(),
            history_size: default_history_size(),
            history_duration: default_history_duration(),
        }
    }
}

/// Cluster log routing; all keys are live-reloadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClogConfig {
    #[serde(default = "default_true")]
    pub to_monitors: bool,
    #[serde(default)]
    pub to_syslog: bool,
    #[serde(default = "default_syslog_facility")]
    pub syslog_facility: String,
    #[serde(default = "default_syslog_level")]
    pub syslog_level: String,
}

fn default_syslog_facility() -> String {
    "daemon".to_string()
}

fn default_syslog_level() -> String {
    "info".to_string()
}

impl Default for ClogConfig {
    fn default() -> Self {
        Self {
            to_monitors: true,
            to_syslog: false,
            syslog_facility: default_syslog_facility(),
            syslog_level: default_syslog_level(),
        }
    }
}

/// Shared, live-reloadable configuration handle.
///
/// `injectargs` mutates tracked keys and bumps the change channel so
/// observers can re-read the keys they care about.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<parking_lot::RwLock<MdsConfig>>,
    changes_tx: tokio::sync::watch::Sender<ChangeSet>,
}

/// The set of keys touched by the most recent change.
pub type ChangeSet = HashSet<String>;

impl ConfigHandle {
    pub fn new(config: MdsConfig) -> Self {
        let (changes_tx, _) = tokio::sync::watch::channel(ChangeSet::new());
        Self {
            inner: Arc::new(parking_lot::RwLock::new(config)),
            changes_tx,
        }
    }

    /// Snapshot the current configuration.
    pub fn get(&self) -> MdsConfig {
        self.inner.read().clone()
    }

    /// Read a projection of the current configuration.
    pub fn with<R>(&self, f: impl FnOnce(&MdsConfig) -> R) -> R {
        f(&self.inner.read())
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ChangeSet> {
        self.changes_tx.subscribe()
    }

    /// Apply `key=value` (or `--key value`) pairs to tracked keys.
    ///
    /// Returns the set of keys that changed. Unknown or untracked keys are
    /// rejected without applying anything.
    pub fn injectargs(&self, args: &[String]) -> Result<ChangeSet> {
        let pairs = parse_injectargs(args)?;
        for (key, _) in &pairs {
            if !TRACKED_KEYS.contains(&key.as_str()) {
                return Err(LatticeError::InvalidArgument(format!(
                    "'{}' is not a tracked configuration key",
                    key
                )));
            }
        }

        let mut changed = ChangeSet::new();
        {
            let mut config = self.inner.write();
            for (key, value) in pairs {
                apply_tracked_key(&mut config, &key, &value)?;
                changed.insert(key);
            }
        }
        if !changed.is_empty() {
            let _ = self.changes_tx.send(changed.clone());
        }
        Ok(changed)
    }
}

fn parse_injectargs(args: &[String]) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(token) = iter.next() {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((key, value)) = token.split_once('=') {
            pairs.push((key.trim_start_matches("--").to_string(), value.to_string()));
        } else {
            let key = token.trim_start_matches("--").to_string();
            let value = iter
                .next()
                .ok_or_else(|| {
                    LatticeError::InvalidArgument(format!("missing value for '{}'", key))
                })?
                .to_string();
            pairs.push((key, value));
        }
    }
    if pairs.is_empty() {
        return Err(LatticeError::InvalidArgument(
            "ignoring empty injectargs".to_string(),
        ));
    }
    Ok(pairs)
}

fn apply_tracked_key(config: &mut MdsConfig, key: &str, value: &str) -> Result<()> {
    let bad = |reason: &str| LatticeError::InvalidConfig {
        field: key.to_string(),
        reason: reason.to_string(),
    };
    match key {
        "mds_op_complaint_time" => {
            config.op.complaint_time =
                humantime_serde::parse_duration(value).map_err(|e| bad(&e))?;
        }
        "mds_op_log_threshold" => {
            config.op.log_threshold = value.parse().map_err(|_| bad("expected an integer"))?;
        }
        "mds_op_history_size" => {
            config.op.history_size = value.parse().map_err(|_| bad("expected an integer"))?;
        }
        "mds_op_history_duration" => {
            config.op.history_duration =
                humantime_serde::parse_duration(value).map_err(|e| bad(&e))?;
        }
        "clog_to_monitors" => {
            config.clog.to_monitors = value.parse().map_err(|_| bad("expected a bool"))?;
        }
        "clog_to_syslog" => {
            config.clog.to_syslog = value.parse().map_err(|_| bad("expected a bool"))?;
        }
        "clog_to_syslog_facility" => {
            config.clog.syslog_facility = value.to_string();
        }
        "clog_to_syslog_level" => {
            config.clog.syslog_level = value.to_string();
        }
        _ => return Err(bad("not a tracked key")),
    }
    Ok(())
}

/// Serde helper for `Duration` using a humantime-style format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            // Bare numbers are seconds.
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        }
    }
}
