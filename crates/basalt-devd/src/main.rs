//! Device manager daemon: coldplugs `/sys`, then follows kernel uevents.

use anyhow::{Context, Result};
use basalt_core::{logging, BasaltConfig};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio::select;
use tokio::signal::{self, unix::SignalKind};

mod actions;
mod daemon;
mod enumerate;
mod netlink;

use actions::{ModePermissions, ModprobeLoader, SysfsProbe};
use daemon::Daemon;
use netlink::UeventSocket;

/// Command-line options for the device daemon.
#[derive(Parser, Debug)]
#[command(
    name = "basalt-devd",
    version,
    about = "Keeps the basalt device tree in sync with the kernel."
)]
struct Args {
    /// Path to the basalt configuration file (default: $BASALT_CONFIG or /etc/basalt.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exit after the initial `/sys` scan instead of following uevents.
    #[arg(long)]
    coldplug_only: bool,
}

/// Single-threaded runtime: every tree mutation happens on this thread.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(BasaltConfig::resolve_path);
    let config = BasaltConfig::load_or_default(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let sysfs_root = config.sysfs_root();

    info!(
        "basalt-devd starting (config: {}, sysfs: {})",
        config.path.display(),
        sysfs_root.display()
    );

    // Subscribe before scanning so nothing that happens mid-scan is missed.
    let socket = if args.coldplug_only {
        None
    } else {
        Some(UeventSocket::open().context("open kernel uevent socket")?)
    };

    let mut daemon = Daemon::new(
        SysfsProbe::new(sysfs_root.clone()),
        ModprobeLoader::new(config.modprobe_binary(), Handle::current()),
        ModePermissions::new(config.dev_root(), config.devices.node_mode),
        sysfs_root.clone(),
    );

    let events = enumerate::scan(&sysfs_root)
        .with_context(|| format!("enumerate {}", sysfs_root.display()))?;
    daemon.coldplug(&events).context("coldplug")?;

    let Some(socket) = socket else {
        return Ok(());
    };

    let mut terminate =
        signal::unix::signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    // `biased` drains pending uevents before a shutdown signal is honoured.
    loop {
        select! {
            biased;
            datagram = socket.recv() => {
                let datagram = datagram.context("receive uevent")?;
                daemon.handle_datagram(&datagram).context("device tree")?;
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}
