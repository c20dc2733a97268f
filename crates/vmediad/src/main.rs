//! Virtual media daemon (vmediad).
//!
//! Presents a disk or ISO image to the host attached to the KVM appliance
//! as a USB mass-storage medium. The image may live on a connected peer,
//! behind an HTTP URL, or in the local images directory.
//!
//! Usage:
//!   vmediad [OPTIONS]
//!
//! The daemon runs:
//! 1. Peer server (Unix socket carrying JSON-RPC and disk channels)
//! 2. Per mount of a network image: the NBD bridge feeding `/dev/nbdN`

mod backend;
mod bridge;
mod config;
mod controller;
mod gadget;
mod http_range;
mod nbd;
mod remote;
mod rpc;
mod session;
mod storage;
mod transport;
mod upload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use vmedia_proto::defaults::*;

use crate::bridge::NbdBridgeLauncher;
use crate::config::Config;
use crate::controller::MountController;
use crate::session::SessionManager;

/// Virtual media daemon
#[derive(Parser, Debug)]
#[command(name = "vmediad", version, about = "Virtual media daemon")]
struct Args {
    /// Directory holding images mountable from local storage
    #[arg(long, default_value = DEFAULT_IMAGES_DIR)]
    images_dir: PathBuf,

    /// Configfs directory of the USB mass-storage function
    #[arg(long, default_value = DEFAULT_GADGET_FUNCTION_PATH)]
    gadget: PathBuf,

    /// Logical unit carrying the medium
    #[arg(long, default_value = DEFAULT_LUN)]
    lun: String,

    /// Kernel NBD device node
    #[arg(long, default_value = DEFAULT_NBD_DEVICE)]
    nbd_device: PathBuf,

    /// Socket connecting the NBD server and client
    #[arg(long, default_value = DEFAULT_NBD_SOCKET)]
    nbd_socket: PathBuf,

    /// Socket peers connect to
    #[arg(short = 's', long, default_value = DEFAULT_PEER_SOCKET)]
    socket: PathBuf,

    /// Remote read deadline in milliseconds
    #[arg(long, default_value_t = DEFAULT_REMOTE_READ_TIMEOUT_MS)]
    read_timeout_ms: u64,

    /// How long to wait for the NBD device after attach, in milliseconds
    #[arg(long, default_value_t = DEFAULT_DEVICE_READY_TIMEOUT_MS)]
    device_ready_timeout_ms: u64,

    /// HTTP request timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_HTTP_TIMEOUT_MS)]
    http_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            images_dir: self.images_dir,
            gadget_function_path: self.gadget,
            lun: self.lun,
            nbd_device: self.nbd_device,
            nbd_socket: self.nbd_socket,
            peer_socket: self.socket,
            remote_read_timeout: Duration::from_millis(self.read_timeout_ms),
            device_ready_timeout: Duration::from_millis(self.device_ready_timeout_ms),
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("vmediad v{} starting", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();

    let sessions = Arc::new(SessionManager::new());
    let export = Arc::new(NbdBridgeLauncher::new(
        config.nbd_device.clone(),
        config.nbd_socket.clone(),
        config.sysfs_block_dir.clone(),
        config.device_poll_interval,
    ));
    let controller = Arc::new(MountController::new(&config, export, sessions.clone()));

    if let Err(e) = controller.images().ensure_dir().await {
        error!("failed to create images directory {}: {}", config.images_dir.display(), e);
        std::process::exit(1);
    }

    // Spawn the peer server
    let shutdown = Arc::new(Notify::new());
    let peer_server = {
        let controller = controller.clone();
        let sessions = sessions.clone();
        let shutdown = shutdown.clone();
        let path = config.peer_socket.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::start_peer_server(&path, controller, sessions, shutdown).await {
                error!("peer server failed: {}", e);
            }
        })
    };

    info!("vmediad ready on {}", config.peer_socket.display());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        _ = wait_terminate() => {
            info!("SIGTERM received, shutting down");
        }
    }

    // ---------------------------------------------------------------
    // Graceful shutdown
    // ---------------------------------------------------------------
    shutdown.notify_one();
    if controller.get_state().await.is_some() {
        if let Err(e) = controller.unmount().await {
            warn!("unmount on shutdown failed: {}", e);
        }
    }
    let _ = peer_server.await;

    info!("vmediad stopped");
}

async fn wait_terminate() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
