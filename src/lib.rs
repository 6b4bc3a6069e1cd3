//! Lattice - a horizontally scaled distributed file system.
//!
//! This crate is the metadata server (MDS) daemon core. A logical cluster
//! of MDS ranks serves the filesystem namespace (inodes, directories,
//! capabilities) on top of an object storage backend, coordinated by an
//! external monitor service that publishes the authoritative cluster
//! membership map.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      lattice-mds                         │
//! ├──────────────────────────────────────────────────────────┤
//! │  Supervisor: controller lock | init / suicide / respawn  │
//! ├──────────────────────────────────────────────────────────┤
//! │  Membership machine | Dispatcher | Admin surface | Tick  │
//! ├──────────────────────────────────────────────────────────┤
//! │  Data plane: cache | journal | balancer | migrator       │
//! │              locker | snapshot tables | inode table      │
//! ├──────────────────────────────────────────────────────────┤
//! │  Edges: messenger | monitor client | object client       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The supervisor owns a single controller lock under which all controller
//! and data-plane state mutates. Long-running waits (journal flush,
//! session evict commits, map barriers) explicitly release the lock and
//! reacquire it afterwards, re-checking the stopping latch on every wake.
//!
//! # Quick start
//!
//! ```no_run
//! use lattice::config::MdsConfig;
//! use lattice::mds::{Lifecycle, MdsDaemon};
//! use lattice::mon::LocalMonitor;
//! use lattice::types::DaemonState;
//!
//! #[tokio::main]
//! async fn main() -> lattice::Result<()> {
//!     let monitor = LocalMonitor::new();
//!     let daemon = MdsDaemon::new(
//!         MdsConfig::development("alpha"),
//!         monitor,
//!         Lifecycle::exec(),
//!     );
//!     daemon.init(DaemonState::Boot).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod balancer;
pub mod beacon;
pub mod cache;
pub mod clog;
pub mod config;
pub mod error;
pub mod inotable;
pub mod journal;
pub mod locker;
pub mod map;
pub mod mds;
pub mod messenger;
pub mod migrator;
pub mod mon;
pub mod msg;
pub mod ops;
pub mod osdc;
pub mod session;
pub mod snapshot;
pub mod types;

pub use error::{LatticeError, Result};
pub use mds::{FatalAction, Lifecycle, LifecycleMode, MdsDaemon};
