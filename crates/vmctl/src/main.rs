//! Virtual media admin tool (vmctl).
//!
//! Talks to `vmediad` over its peer socket, the same way a remote console
//! does, and can itself act as the peer that holds an image.
//!
//! # Usage
//!
//! ```text
//! vmctl [OPTIONS] <COMMAND>
//!
//! Commands:
//!   state          Show what is mounted
//!   mount-storage  Mount an image from the images directory
//!   mount-http     Mount an image served over HTTP
//!   serve-file     Mount a local file and serve its reads until interrupted
//!   upload         Upload a local file into the images directory
//!   unmount        Unmount the current image
//!   list           List images in the images directory
//!   delete         Delete an image from the images directory
//!   space          Show images directory usage
//!   check-url      Check whether a URL can be mounted
//!   mode           Show or set the mass storage mode
//!
//! Options:
//!   -s, --socket <SOCKET>  Daemon peer socket [default: /var/run/vmediad.sock]
//!   -v, --verbose          Enable debug logging
//! ```

mod common;
mod media;
mod serve;
mod storage;
mod upload;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vmedia_proto::defaults::DEFAULT_PEER_SOCKET;
use vmedia_proto::media::VirtualMediaMode;

use crate::common::{exit_error, PeerClient};

/// Virtual media admin tool.
#[derive(Parser)]
#[command(name = "vmctl", version, about = "Virtual media admin tool")]
struct Cli {
    /// Daemon peer socket
    #[arg(short = 's', long, default_value = DEFAULT_PEER_SOCKET)]
    socket: PathBuf,

    /// Enable verbose/debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what is mounted
    State,
    /// Mount an image from the images directory
    MountStorage {
        filename: String,
        /// CDROM or Disk
        #[arg(short = 'm', long, default_value = "CDROM", value_parser = parse_mode)]
        mode: VirtualMediaMode,
    },
    /// Mount an image served over HTTP
    MountHttp {
        url: String,
        /// CDROM or Disk
        #[arg(short = 'm', long, default_value = "CDROM", value_parser = parse_mode)]
        mode: VirtualMediaMode,
    },
    /// Mount a local file and serve its reads until interrupted
    ServeFile {
        path: PathBuf,
        /// CDROM or Disk
        #[arg(short = 'm', long, default_value = "CDROM", value_parser = parse_mode)]
        mode: VirtualMediaMode,
    },
    /// Upload a local file into the images directory
    Upload {
        path: PathBuf,
        /// Name to store it under (defaults to the file name)
        #[arg(short = 'n', long)]
        name: Option<String>,
    },
    /// Unmount the current image
    Unmount,
    /// List images in the images directory
    List,
    /// Delete an image from the images directory
    Delete { filename: String },
    /// Show images directory usage
    Space,
    /// Check whether a URL can be mounted
    CheckUrl { url: String },
    /// Show or set the mass storage mode (cdrom or file)
    Mode { mode: Option<String> },
}

fn parse_mode(s: &str) -> Result<VirtualMediaMode, String> {
    s.parse().map_err(|e: vmedia_proto::VmError| e.to_string())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let (client, mut events) = match PeerClient::connect(&cli.socket).await {
        Ok(c) => c,
        Err(e) => exit_error(&e),
    };

    let result = match cli.command {
        Commands::State => media::state(&client).await,
        Commands::MountStorage { filename, mode } => media::mount_storage(&client, &filename, mode).await,
        Commands::MountHttp { url, mode } => media::mount_http(&client, &url, mode).await,
        Commands::ServeFile { path, mode } => serve::serve_file(client, events.disk, &path, mode).await,
        Commands::Upload { path, name } => {
            upload::upload_file(&client, &mut events.upload, &path, name.as_deref()).await
        }
        Commands::Unmount => media::unmount(&client).await,
        Commands::List => storage::list(&client).await,
        Commands::Delete { filename } => storage::delete(&client, &filename).await,
        Commands::Space => storage::space(&client).await,
        Commands::CheckUrl { url } => media::check_url(&client, &url).await,
        Commands::Mode { mode } => media::mode(&client, mode.as_deref()).await,
    };

    if let Err(e) = result {
        exit_error(&e);
    }
}
