//! Block device bridge.
//!
//! Serves the storage backend as an NBD export on one end of a local
//! socket and attaches the kernel NBD driver to the other end, so the
//! mounted image shows up as `/dev/nbdN`.
//!
//! Startup order is fixed: open the device, remove the stale socket, bind,
//! dial, accept. The accepted connection is therefore the one our own
//! client dialled. Teardown releases everything best effort.

use std::net::Shutdown;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmedia_proto::constants::EXPORT_NAME;
use vmedia_proto::error::{VmError, VmResult};

use crate::backend::StorageBackend;
use crate::nbd::kernel::NbdDevice;
use crate::nbd::{self, client, ExportOptions};

/// Something that can expose a [`StorageBackend`] as a block device node.
#[async_trait]
pub trait BlockExport: Send + Sync {
    /// Path the gadget LUN is pointed at once the export is ready.
    fn device_path(&self) -> &Path;

    async fn start(&self, backend: StorageBackend) -> VmResult<Box<dyn ExportHandle>>;

    /// Wait until the device node reports a usable size.
    async fn wait_ready(&self, timeout: Duration) -> VmResult<()>;
}

/// A running export. Closing it releases every resource it holds.
#[async_trait]
pub trait ExportHandle: Send + Sync {
    async fn close(self: Box<Self>);
}

/// Launches [`NbdBridge`]s on a fixed device and socket path.
pub struct NbdBridgeLauncher {
    device: PathBuf,
    socket: PathBuf,
    sysfs_block_dir: PathBuf,
    poll_interval: Duration,
}

impl NbdBridgeLauncher {
    pub fn new(device: PathBuf, socket: PathBuf, sysfs_block_dir: PathBuf, poll_interval: Duration) -> Self {
        Self {
            device,
            socket,
            sysfs_block_dir,
            poll_interval,
        }
    }

    /// `/sys/class/block/<dev>/size` for the configured device.
    fn size_attr(&self) -> PathBuf {
        let name = self
            .device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.sysfs_block_dir.join(name).join("size")
    }
}

#[async_trait]
impl BlockExport for NbdBridgeLauncher {
    fn device_path(&self) -> &Path {
        &self.device
    }

    async fn start(&self, backend: StorageBackend) -> VmResult<Box<dyn ExportHandle>> {
        let bridge = NbdBridge::start(&self.device, &self.socket, backend).await?;
        Ok(Box::new(bridge))
    }

    async fn wait_ready(&self, timeout: Duration) -> VmResult<()> {
        poll_device_ready(&self.size_attr(), timeout, self.poll_interval).await
    }
}

/// Poll a sysfs `size` attribute until it reports a non-zero sector count.
pub async fn poll_device_ready(size_attr: &Path, timeout: Duration, interval: Duration) -> VmResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(value) = tokio::fs::read_to_string(size_attr).await {
            if value.trim().parse::<u64>().is_ok_and(|sectors| sectors > 0) {
                debug!("{} ready: {} sectors", size_attr.display(), value.trim());
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("{} not ready after {:?}", size_attr.display(), timeout);
            return Err(VmError::DeviceNotReady);
        }
        tokio::time::sleep(interval).await;
    }
}

/// A running NBD server/client pair bound to one kernel device.
pub struct NbdBridge {
    device: Arc<NbdDevice>,
    socket: PathBuf,
    listener: Option<UnixListener>,
    server_conn: StdUnixStream,
    client_conn: StdUnixStream,
    shutdown: Arc<Notify>,
    server_task: JoinHandle<()>,
    client_task: JoinHandle<VmResult<()>>,
}

impl NbdBridge {
    pub async fn start(device: &Path, socket: &Path, backend: StorageBackend) -> VmResult<Self> {
        // (a) capability check, then open
        let device = Arc::new(NbdDevice::open(device)?);

        // (b) stale socket from a previous run
        match std::fs::remove_file(socket) {
            Ok(()) => debug!("removed stale socket {}", socket.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VmError::Socket(format!(
                    "failed to remove {}: {}",
                    socket.display(),
                    e
                )))
            }
        }

        // (c) listen, (d) dial, (e) accept
        let (socket_file, listener, client, server) = bind_loopback(socket).await?;

        // Keep a second handle to each end so close() can shut them down
        // while the tasks still own the originals.
        let (mut server, server_conn) = split_control(server)?;
        let (client, client_conn) = split_control(client)?;

        // (f) server loop
        let shutdown = Arc::new(Notify::new());
        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            let options = ExportOptions::default();
            tokio::select! {
                result = nbd::serve(&mut server, &options, &backend) => {
                    match result {
                        Ok(()) => debug!("NBD server finished"),
                        Err(e) => debug!("NBD server stopped: {}", e),
                    }
                }
                _ = server_shutdown.notified() => {
                    debug!("NBD server shutting down");
                }
            }
        });

        // (f) client loop
        let client_task = match client::connect(client, device.clone(), EXPORT_NAME).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("failed to attach {}: {}", device.path().display(), e);
                shutdown.notify_one();
                let _ = server_conn.shutdown(Shutdown::Both);
                let _ = client_conn.shutdown(Shutdown::Both);
                return Err(e);
            }
        };

        socket_file.keep();
        info!(
            "NBD bridge started: {} <-> {}",
            device.path().display(),
            socket.display()
        );
        Ok(Self {
            device,
            socket: socket.to_path_buf(),
            listener: Some(listener),
            server_conn,
            client_conn,
            shutdown,
            server_task,
            client_task,
        })
    }
}

/// Removes a bound socket path on drop unless told to keep it.
struct SocketFile<'a> {
    path: &'a Path,
    keep: bool,
}

impl SocketFile<'_> {
    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for SocketFile<'_> {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(self.path) {
            Ok(()) => debug!("removed {}", self.path.display()),
            Err(e) => debug!("remove {}: {}", self.path.display(), e),
        }
    }
}

/// Bind `socket`, dial it and accept our own connection.
///
/// Returns the listener with the client and server ends. The socket path is
/// removed again unless the returned [`SocketFile`] is kept.
async fn bind_loopback(socket: &Path) -> VmResult<(SocketFile<'_>, UnixListener, UnixStream, UnixStream)> {
    let listener = UnixListener::bind(socket)
        .map_err(|e| VmError::Socket(format!("failed to listen on {}: {}", socket.display(), e)))?;
    let socket_file = SocketFile {
        path: socket,
        keep: false,
    };
    let client = UnixStream::connect(socket)
        .await
        .map_err(|e| VmError::Socket(format!("failed to dial {}: {}", socket.display(), e)))?;
    let (server, _) = listener
        .accept()
        .await
        .map_err(|e| VmError::Socket(format!("failed to accept on {}: {}", socket.display(), e)))?;
    Ok((socket_file, listener, client, server))
}

/// Split a tokio stream into itself plus a std handle to the same socket.
fn split_control(stream: UnixStream) -> VmResult<(UnixStream, StdUnixStream)> {
    let std_stream = stream.into_std()?;
    let control = std_stream.try_clone()?;
    let stream = UnixStream::from_std(std_stream)?;
    Ok((stream, control))
}

#[async_trait]
impl ExportHandle for NbdBridge {
    async fn close(mut self: Box<Self>) {
        client::disconnect(&self.device);
        self.shutdown.notify_one();

        if let Err(e) = self.server_conn.shutdown(Shutdown::Both) {
            debug!("server connection shutdown: {}", e);
        }
        if let Err(e) = self.client_conn.shutdown(Shutdown::Both) {
            debug!("client connection shutdown: {}", e);
        }
        self.listener.take();
        if let Err(e) = std::fs::remove_file(&self.socket) {
            debug!("remove {}: {}", self.socket.display(), e);
        }

        // NBD_DO_IT returns once the socket is gone
        match tokio::time::timeout(Duration::from_secs(2), &mut self.client_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => debug!("NBD client exited: {}", e),
            Ok(Err(e)) => warn!("NBD client task failed: {}", e),
            Err(_) => warn!("NBD client did not exit, leaving it detached"),
        }
        self.server_task.abort();

        info!("NBD bridge stopped: {}", self.device.path().display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::RwLock;

    fn setup(name: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(&tmp).unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_start_without_device() {
        let tmp = setup("vmediad_test_bridge_no_device");
        let socket = tmp.join("nbd.socket");
        std::fs::write(&socket, b"stale").unwrap();

        let backend = StorageBackend::new(Arc::new(RwLock::new(None)));
        let err = NbdBridge::start(&tmp.join("nbd0"), &socket, backend)
            .await
            .err()
            .unwrap();
        assert_eq!(err, VmError::NoDevice);
        // Nothing was touched before the capability check failed
        assert!(socket.exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_loopback_socket_removed_unless_kept() {
        let tmp = setup("vmediad_test_bridge_socket_file");
        let socket = tmp.join("nbd.socket");

        let (socket_file, _listener, mut client, mut server) = bind_loopback(&socket).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(socket.exists());

        // A start that fails after binding drops the guard
        drop(socket_file);
        assert!(!socket.exists());

        let (socket_file, _listener, _client, _server) = bind_loopback(&socket).await.unwrap();
        socket_file.keep();
        assert!(socket.exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_no_socket() {
        let tmp = setup("vmediad_test_bridge_bind_fault");
        let socket = tmp.join("missing").join("nbd.socket");

        let err = bind_loopback(&socket).await.err().unwrap();
        assert!(matches!(err, VmError::Socket(_)));
        assert!(!socket.exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_wait_ready_polls_sysfs_size() {
        let tmp = setup("vmediad_test_bridge_ready");
        std::fs::create_dir_all(tmp.join("nbd0")).unwrap();
        let size = tmp.join("nbd0").join("size");
        std::fs::write(&size, "0\n").unwrap();

        let launcher = NbdBridgeLauncher::new(
            PathBuf::from("/dev/nbd0"),
            tmp.join("nbd.socket"),
            tmp.clone(),
            Duration::from_millis(10),
        );
        assert_eq!(launcher.device_path(), Path::new("/dev/nbd0"));

        let writer = {
            let size = size.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tokio::fs::write(&size, "1433600\n").await.unwrap();
            })
        };
        launcher.wait_ready(Duration::from_secs(2)).await.unwrap();
        writer.await.unwrap();

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let tmp = setup("vmediad_test_bridge_not_ready");
        let attr = tmp.join("size");
        std::fs::write(&attr, "0\n").unwrap();

        let err = poll_device_ready(&attr, Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, VmError::DeviceNotReady);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
