//! Lattice MDS daemon entry point.

use clap::Parser;
use lattice::config::MdsConfig;
use lattice::map::{CompatSet, MdsInfo, MdsMapBuilder, FEATURE_BASE, FEATURE_OMAP};
use lattice::mds::{Lifecycle, MdsDaemon};
use lattice::messenger::Envelope;
use lattice::mon::LocalMonitor;
use lattice::msg::Message;
use lattice::osdc::OsdMapView;
use lattice::types::{DaemonState, EntityName, MdsRank};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "lattice-mds")]
#[command(author, version, about = "Lattice metadata server daemon")]
struct Args {
    /// Daemon name, as registered with the monitor
    #[arg(short, long, env = "LATTICE_MDS_NAME", default_value = "a")]
    name: String,

    /// Configuration file path
    #[arg(short, long, env = "LATTICE_MDS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LATTICE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Admin command socket path
    #[arg(long)]
    admin_socket: Option<PathBuf>,

    /// Boot into standby-replay
    #[arg(long)]
    standby_replay: bool,

    /// Boot into oneshot-replay (requires a standby target)
    #[arg(long, conflicts_with = "standby_replay")]
    oneshot_replay: bool,

    /// Rank to follow in a standby flavor
    #[arg(long)]
    standby_for_rank: Option<i32>,

    /// Daemon name to follow in a standby flavor
    #[arg(long)]
    standby_for_name: Option<String>,

    /// Run a self-contained single-rank cluster with an in-process monitor
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => MdsConfig::from_file(path)?,
        None if args.dev => MdsConfig::development(args.name.clone()),
        None => MdsConfig {
            name: args.name.clone(),
            ..MdsConfig::default()
        },
    };
    config.name = args.name.clone();
    config.standby_replay = config.standby_replay || args.standby_replay;
    if let Some(rank) = args.standby_for_rank {
        config.standby_for_rank = Some(rank);
    }
    if let Some(name) = &args.standby_for_name {
        config.standby_for_name = name.clone();
    }
    if let Some(path) = &args.admin_socket {
        config.admin_socket_path = path.clone();
    }
    config.validate()?;

    let monitor = LocalMonitor::new();
    let daemon = MdsDaemon::new(config, monitor.clone(), Lifecycle::exec());

    // The in-process backend is already serving.
    daemon.object_client().install_map(OsdMapView {
        epoch: 1,
        up_nodes: 3,
        features: FEATURE_BASE | FEATURE_OMAP,
    });

    let wanted = if args.oneshot_replay {
        DaemonState::OneshotReplay
    } else {
        DaemonState::Boot
    };
    daemon.init(wanted).await?;

    if args.dev {
        drive_dev_cluster(&daemon, &monitor).await;
    }

    wait_for_shutdown(&daemon).await;
    info!("lattice-mds exiting");
    Ok(())
}

/// Stand in for the monitor: assign this daemon rank 0 and walk it from
/// creating to active.
async fn drive_dev_cluster(daemon: &Arc<MdsDaemon>, monitor: &Arc<LocalMonitor>) {
    let gid = daemon.monitor_client().global_id();
    let mon_addr = "127.0.0.1:3300".parse().expect("valid socket address");
    let mds_addr = "127.0.0.1:6800".parse().expect("valid socket address");

    let mut info = MdsInfo {
        global_id: gid,
        name: daemon.name().to_string(),
        rank: Some(MdsRank(0)),
        incarnation: 1,
        state: DaemonState::Creating,
        addr: mds_addr,
        standby_for_rank: None,
        standby_for_name: String::new(),
    };

    for (epoch, state) in [(1, DaemonState::Creating), (2, DaemonState::Active)] {
        info.state = state;
        let map = MdsMapBuilder::new(epoch, monitor.fsid())
            .compat(CompatSet::new(FEATURE_BASE | FEATURE_OMAP))
            .daemon(info.clone())
            .build();
        daemon.messenger().deliver(Envelope::bare(
            EntityName::mon(0),
            mon_addr,
            Message::MdsMap {
                epoch,
                payload: map.encode(),
            },
        ));
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(daemon: &Arc<MdsDaemon>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                daemon.handle_signal(libc::SIGTERM).await;
                break;
            }
            _ = sigint.recv() => {
                daemon.handle_signal(libc::SIGINT).await;
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                if daemon.is_stopping() {
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(daemon: &Arc<MdsDaemon>) {
    let _ = tokio::signal::ctrl_c().await;
    daemon.handle_signal(2).await;
}
