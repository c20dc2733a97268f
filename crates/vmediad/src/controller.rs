//! Mount controller.
//!
//! Owns the single [`VirtualMediaState`] and everything that has to live
//! exactly as long as it: the image reader and the block bridge. Mount and
//! unmount are serialized; readers only take the shared lock long enough
//! to copy out what they need.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::{
    StorageFileUpload, StorageFiles, StorageSpace, VirtualMediaMode, VirtualMediaSource,
    VirtualMediaState, VirtualMediaUrlInfo,
};

use crate::backend::{ImageReader, StorageBackend};
use crate::bridge::{BlockExport, ExportHandle};
use crate::config::Config;
use crate::gadget::MassStorageLun;
use crate::http_range::{self, RangeHttpReader};
use crate::remote::RemoteDiskReader;
use crate::session::{Session, SessionManager};
use crate::storage::{sanitize_filename, ImageStore};
use crate::upload::UploadManager;

/// What is mounted right now.
pub struct MountedMedia {
    pub state: VirtualMediaState,
    /// Present for network sources only.
    pub reader: Option<Arc<ImageReader>>,
    /// Session whose disk channel backs the image; it goes away with it.
    owner: Option<u64>,
    bridge: Option<Box<dyn ExportHandle>>,
}

impl MountedMedia {
    pub fn new(state: VirtualMediaState, reader: Option<Arc<ImageReader>>) -> Self {
        Self {
            state,
            reader,
            owner: None,
            bridge: None,
        }
    }

    fn owned_by(mut self, owner: Option<u64>) -> Self {
        self.owner = owner;
        self
    }
}

/// Mount state shared with the storage backend.
pub type SharedMedia = Arc<RwLock<Option<MountedMedia>>>;

#[derive(Debug, Clone, Copy)]
struct Timing {
    remote_read: Duration,
    device_ready: Duration,
    lun_detach: Duration,
    http: Duration,
}

pub struct MountController {
    media: SharedMedia,
    /// Serializes mount and unmount.
    ops: Mutex<()>,
    lun: MassStorageLun,
    images: ImageStore,
    uploads: UploadManager,
    export: Arc<dyn BlockExport>,
    sessions: Arc<SessionManager>,
    timing: Timing,
}

impl MountController {
    pub fn new(config: &Config, export: Arc<dyn BlockExport>, sessions: Arc<SessionManager>) -> Self {
        Self {
            media: Arc::new(RwLock::new(None)),
            ops: Mutex::new(()),
            lun: MassStorageLun::new(&config.gadget_function_path, &config.lun),
            images: ImageStore::new(config.images_dir.clone()),
            uploads: UploadManager::new(config.images_dir.clone(), config.upload_progress_interval),
            export,
            sessions,
            timing: Timing {
                remote_read: config.remote_read_timeout,
                device_ready: config.device_ready_timeout,
                lun_detach: config.lun_detach_delay,
                http: config.http_timeout,
            },
        }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    /// A backend reading through the current mount.
    pub fn backend(&self) -> StorageBackend {
        StorageBackend::new(self.media.clone())
    }

    pub async fn get_state(&self) -> Option<VirtualMediaState> {
        self.media.read().await.as_ref().map(|m| m.state.clone())
    }

    // ─── Mount ───────────────────────────────────────────────────────────────

    /// Mount an image held by the current peer session.
    ///
    /// `owner` is the id of the requesting session; the media is unmounted
    /// when that session closes.
    pub async fn mount_with_webrtc(
        &self,
        owner: Option<u64>,
        filename: &str,
        size: u64,
        mode: VirtualMediaMode,
    ) -> VmResult<()> {
        let _ops = self.ops.lock().await;
        self.ensure_unmounted().await?;

        let reader = RemoteDiskReader::new(self.sessions.clone(), size, self.timing.remote_read);
        let state = VirtualMediaState {
            source: VirtualMediaSource::WebRtc,
            mode,
            filename: Some(filename.to_string()),
            url: None,
            size,
        };
        self.mount_network(state, ImageReader::Remote(reader), owner).await
    }

    /// Mount a URL, learning its size with a range request first.
    pub async fn mount_with_http(&self, url: &str, mode: VirtualMediaMode) -> VmResult<()> {
        let _ops = self.ops.lock().await;
        self.ensure_unmounted().await?;

        let reader = RangeHttpReader::open(url, self.timing.http).await.map_err(|e| {
            warn!("failed to size {}: {}", url, e);
            e
        })?;
        let state = VirtualMediaState {
            source: VirtualMediaSource::Http,
            mode,
            filename: None,
            url: Some(url.to_string()),
            size: reader.size(),
        };
        self.mount_network(state, ImageReader::Http(reader), None).await
    }

    /// Mount a file from the images directory directly, without the bridge.
    pub async fn mount_with_storage(&self, filename: &str, mode: VirtualMediaMode) -> VmResult<()> {
        let _ops = self.ops.lock().await;
        self.ensure_unmounted().await?;

        let name = sanitize_filename(filename)?;
        let path = self.images.resolve(&name)?;
        let size = self.images.image_size(&name).await?;

        let state = VirtualMediaState {
            source: VirtualMediaSource::Storage,
            mode,
            filename: Some(name),
            url: None,
            size,
        };
        *self.media.write().await = Some(MountedMedia::new(state, None));

        if let Err(e) = self.present(&path.to_string_lossy(), mode).await {
            warn!("failed to mount {}: {}", path.display(), e);
            self.rollback().await;
            return Err(e);
        }
        info!("mounted {} ({} bytes, {})", path.display(), size, mode);
        Ok(())
    }

    async fn ensure_unmounted(&self) -> VmResult<()> {
        if self.media.read().await.is_some() {
            return Err(VmError::AlreadyMounted);
        }
        Ok(())
    }

    /// Publish the state, start the bridge and point the LUN at the device.
    /// Callers hold `ops`.
    async fn mount_network(
        &self,
        state: VirtualMediaState,
        reader: ImageReader,
        owner: Option<u64>,
    ) -> VmResult<()> {
        let source = state.source;
        let mode = state.mode;
        let size = state.size;
        {
            let mut media = self.media.write().await;
            if media.is_some() {
                return Err(VmError::AlreadyMounted);
            }
            *media = Some(MountedMedia::new(state, Some(Arc::new(reader))).owned_by(owner));
        }

        if let Err(e) = self.attach_bridge(mode).await {
            warn!("failed to mount {:?} media: {}", source, e);
            self.rollback().await;
            return Err(e);
        }
        info!(
            "mounted {:?} media at {} ({} bytes, {})",
            source,
            self.export.device_path().display(),
            size,
            mode
        );
        Ok(())
    }

    async fn attach_bridge(&self, mode: VirtualMediaMode) -> VmResult<()> {
        let handle = self.export.start(self.backend()).await?;
        let orphan = match self.media.write().await.as_mut() {
            Some(media) => {
                media.bridge = Some(handle);
                None
            }
            None => Some(handle),
        };
        if let Some(handle) = orphan {
            handle.close().await;
            return Err(VmError::NotMounted);
        }

        self.export.wait_ready(self.timing.device_ready).await?;
        let device = self.export.device_path().to_string_lossy().into_owned();
        self.present(&device, mode).await
    }

    /// Point the LUN at `path`, presenting it as `mode`.
    async fn present(&self, path: &str, mode: VirtualMediaMode) -> VmResult<()> {
        // The kernel refuses a mode change while a medium is attached
        self.lun.clear_backing_file().await?;
        self.lun.set_cdrom(mode.is_cdrom()).await?;
        self.lun.set_backing_file(path).await
    }

    /// Undo a half-finished mount. Callers hold `ops`.
    async fn rollback(&self) {
        if let Err(e) = self.lun.clear_backing_file().await {
            debug!("rollback: {}", e);
        }
        let media = self.media.write().await.take();
        if let Some(bridge) = media.and_then(|m| m.bridge) {
            bridge.close().await;
        }
    }

    // ─── Unmount ─────────────────────────────────────────────────────────────

    /// Detach the LUN, stop the bridge and forget the state.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    pub async fn unmount(&self) -> VmResult<()> {
        let _ops = self.ops.lock().await;
        self.unmount_locked().await
    }

    /// Callers hold `ops`.
    async fn unmount_locked(&self) -> VmResult<()> {
        let mut first_err = None;

        if let Ok(file) = self.lun.backing_file().await {
            debug!("detaching {:?} from the mass storage LUN", file);
        }
        if let Err(e) = self.lun.clear_backing_file().await {
            warn!("failed to detach mass storage image: {}", e);
            first_err.get_or_insert(e);
        }
        if !self.timing.lun_detach.is_zero() {
            tokio::time::sleep(self.timing.lun_detach).await;
        }

        let media = self.media.write().await.take();
        match media {
            Some(media) => {
                if let Some(bridge) = media.bridge {
                    bridge.close().await;
                }
                info!("unmounted {:?} media", media.state.source);
            }
            None => debug!("unmount: nothing mounted"),
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unmount peer-backed media when the session that mounted it goes away.
    pub async fn handle_session_closed(&self, session: &Session) {
        let _ops = self.ops.lock().await;
        let owned = self
            .media
            .read()
            .await
            .as_ref()
            .is_some_and(|m| m.owner == Some(session.id()));
        if !owned {
            return;
        }
        info!("session {} closed, unmounting its media", session.id());
        if let Err(e) = self.unmount_locked().await {
            warn!("unmount after session close failed: {}", e);
        }
    }

    // ─── LUN mode and storage ────────────────────────────────────────────────

    /// `"cdrom"` or `"file"`.
    pub async fn get_mass_storage_mode(&self) -> VmResult<&'static str> {
        Ok(if self.lun.cdrom().await? { "cdrom" } else { "file" })
    }

    /// Change how the LUN presents itself. Refused while media is mounted.
    pub async fn set_mass_storage_mode(&self, mode: &str) -> VmResult<&'static str> {
        let cdrom = match mode {
            "cdrom" => true,
            "file" => false,
            other => return Err(VmError::InvalidMode(other.to_string())),
        };
        let _ops = self.ops.lock().await;
        self.ensure_unmounted().await?;
        self.lun.set_cdrom(cdrom).await?;
        self.get_mass_storage_mode().await
    }

    pub async fn check_url(&self, url: &str) -> VirtualMediaUrlInfo {
        http_range::check_url(url, self.timing.http).await
    }

    pub async fn list_storage_files(&self) -> VmResult<StorageFiles> {
        self.images.list().await
    }

    pub async fn delete_storage_file(&self, filename: &str) -> VmResult<()> {
        self.images.delete(filename).await
    }

    pub async fn storage_space(&self) -> VmResult<StorageSpace> {
        self.images.space().await
    }

    pub async fn start_storage_file_upload(&self, filename: &str, size: u64) -> VmResult<StorageFileUpload> {
        self.uploads.start(filename, size).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::http_range::tests::spawn_image_server;
    use crate::nbd::{self, client, ExportOptions};
    use crate::session::tests::recording_sink;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;
    use vmedia_proto::constants::EXPORT_NAME;

    /// Where a [`LoopbackExport`] should fail, if anywhere.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Fault {
        None,
        Start,
        Ready,
    }

    /// Runs the NBD server in-process over a duplex pipe instead of a kernel
    /// device, negotiating the export the way the kernel client would.
    pub(crate) struct LoopbackExport {
        device: PathBuf,
        fault: Fault,
        pub started: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
    }

    impl LoopbackExport {
        pub(crate) fn new(device: PathBuf, fault: Fault) -> Self {
            Self {
                device,
                fault,
                started: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct LoopbackHandle {
        server: JoinHandle<()>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExportHandle for LoopbackHandle {
        async fn close(self: Box<Self>) {
            self.server.abort();
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BlockExport for LoopbackExport {
        fn device_path(&self) -> &Path {
            &self.device
        }

        async fn start(&self, backend: StorageBackend) -> VmResult<Box<dyn ExportHandle>> {
            if self.fault == Fault::Start {
                return Err(VmError::NoDevice);
            }
            let (mut client_end, mut server_end) = tokio::io::duplex(1 << 16);
            let server = tokio::spawn(async move {
                let _ = nbd::serve(&mut server_end, &ExportOptions::default(), &backend).await;
            });
            client::negotiate(&mut client_end, EXPORT_NAME).await?;
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(LoopbackHandle {
                server,
                closed: self.closed.clone(),
            }))
        }

        async fn wait_ready(&self, _timeout: Duration) -> VmResult<()> {
            match self.fault {
                Fault::Ready => Err(VmError::DeviceNotReady),
                _ => Ok(()),
            }
        }
    }

    struct Fixture {
        root: PathBuf,
        config: Config,
        export: Arc<LoopbackExport>,
        sessions: Arc<SessionManager>,
        controller: MountController,
    }

    impl Fixture {
        fn new(name: &str, fault: Fault) -> Self {
            let root = std::env::temp_dir().join(name);
            let _ = std::fs::remove_dir_all(&root);
            let config = Config::for_test(&root);
            std::fs::create_dir_all(&config.images_dir).unwrap();
            let lun_dir = config.gadget_function_path.join(&config.lun);
            std::fs::create_dir_all(&lun_dir).unwrap();
            std::fs::write(lun_dir.join("file"), "").unwrap();
            std::fs::write(lun_dir.join("cdrom"), "0").unwrap();

            let export = Arc::new(LoopbackExport::new(config.nbd_device.clone(), fault));
            let sessions = Arc::new(SessionManager::new());
            let controller = MountController::new(&config, export.clone(), sessions.clone());
            Self {
                root,
                config,
                export,
                sessions,
                controller,
            }
        }

        fn lun_attr(&self, name: &str) -> String {
            let path = self.config.gadget_function_path.join(&self.config.lun).join(name);
            std::fs::read_to_string(path).unwrap().trim().to_string()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn test_mount_storage_image() {
        let fx = Fixture::new("vmediad_test_ctl_storage", Fault::None);
        let image = fx.config.images_dir.join("disk.img");
        std::fs::File::create(&image)
            .unwrap()
            .set_len(100 * 1024 * 1024)
            .unwrap();

        fx.controller
            .mount_with_storage("disk.img", VirtualMediaMode::Disk)
            .await
            .unwrap();

        let state = fx.controller.get_state().await.unwrap();
        assert_eq!(state.source, VirtualMediaSource::Storage);
        assert_eq!(state.size, 104857600);
        assert_eq!(state.filename.as_deref(), Some("disk.img"));
        assert_eq!(fx.lun_attr("file"), image.to_string_lossy());
        assert_eq!(fx.lun_attr("cdrom"), "0");
        // No bridge for local files
        assert_eq!(fx.export.started.load(Ordering::SeqCst), 0);

        fx.controller.unmount().await.unwrap();
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.lun_attr("file"), "");
    }

    #[tokio::test]
    async fn test_mount_storage_rejects_bad_names() {
        let fx = Fixture::new("vmediad_test_ctl_storage_names", Fault::None);

        for name in ["../etc/passwd", "/etc/passwd", ""] {
            assert_eq!(
                fx.controller
                    .mount_with_storage(name, VirtualMediaMode::Cdrom)
                    .await,
                Err(VmError::InvalidFilename)
            );
        }
        assert!(matches!(
            fx.controller
                .mount_with_storage("missing.iso", VirtualMediaMode::Cdrom)
                .await,
            Err(VmError::FileNotFound(_))
        ));
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.lun_attr("file"), "");
    }

    #[tokio::test]
    async fn test_mount_webrtc_without_session() {
        let fx = Fixture::new("vmediad_test_ctl_webrtc", Fault::None);

        fx.controller
            .mount_with_webrtc(None, "remote.iso", 734003200, VirtualMediaMode::Cdrom)
            .await
            .unwrap();
        assert_eq!(fx.export.started.load(Ordering::SeqCst), 1);
        assert_eq!(fx.lun_attr("file"), fx.config.nbd_device.to_string_lossy());
        assert_eq!(fx.lun_attr("cdrom"), "1");

        let state = fx.controller.get_state().await.unwrap();
        assert_eq!(state.source, VirtualMediaSource::WebRtc);
        assert_eq!(state.size, 734003200);

        let mut buf = vec![0u8; 4096];
        assert_eq!(
            fx.controller.backend().read_at(&mut buf, 0).await,
            Err(VmError::NoActiveSession)
        );

        fx.controller.unmount().await.unwrap();
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.export.closed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.lun_attr("file"), "");
    }

    #[tokio::test]
    async fn test_second_mount_is_rejected() {
        let fx = Fixture::new("vmediad_test_ctl_double_http", Fault::None);
        let base = spawn_image_server(vec![1u8; 4096]).await;
        let first = format!("{}/image.iso", base);

        fx.controller
            .mount_with_http(&first, VirtualMediaMode::Cdrom)
            .await
            .unwrap();
        let before = fx.controller.get_state().await.unwrap();
        assert_eq!(before.size, 4096);
        assert_eq!(before.url.as_deref(), Some(first.as_str()));

        assert_eq!(
            fx.controller
                .mount_with_http(&format!("{}/plain.iso", base), VirtualMediaMode::Disk)
                .await,
            Err(VmError::AlreadyMounted)
        );
        assert_eq!(
            fx.controller
                .mount_with_webrtc(None, "x.iso", 10, VirtualMediaMode::Disk)
                .await,
            Err(VmError::AlreadyMounted)
        );
        assert_eq!(fx.controller.get_state().await.unwrap(), before);
        assert_eq!(fx.export.started.load(Ordering::SeqCst), 1);

        fx.controller.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_http_size_failure_leaves_nothing_mounted() {
        let fx = Fixture::new("vmediad_test_ctl_http_size", Fault::None);
        let base = spawn_image_server(vec![1u8; 4096]).await;

        assert_eq!(
            fx.controller
                .mount_with_http(&format!("{}/plain.iso", base), VirtualMediaMode::Cdrom)
                .await,
            Err(VmError::RangeUnsupported)
        );
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.export.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bridge_start_failure_rolls_back() {
        let fx = Fixture::new("vmediad_test_ctl_start_fault", Fault::Start);

        assert_eq!(
            fx.controller
                .mount_with_webrtc(None, "remote.iso", 4096, VirtualMediaMode::Cdrom)
                .await,
            Err(VmError::NoDevice)
        );
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.lun_attr("file"), "");
    }

    #[tokio::test]
    async fn test_device_not_ready_rolls_back() {
        let fx = Fixture::new("vmediad_test_ctl_ready_fault", Fault::Ready);

        assert_eq!(
            fx.controller
                .mount_with_webrtc(None, "remote.iso", 4096, VirtualMediaMode::Cdrom)
                .await,
            Err(VmError::DeviceNotReady)
        );
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.export.closed.load(Ordering::SeqCst), 1);
        // The gadget was never pointed at the device
        assert_eq!(fx.lun_attr("file"), "");
    }

    #[tokio::test]
    async fn test_unmount_when_nothing_mounted() {
        let fx = Fixture::new("vmediad_test_ctl_unmount_empty", Fault::None);
        fx.controller.unmount().await.unwrap();
        assert!(fx.controller.get_state().await.is_none());
    }

    #[tokio::test]
    async fn test_unmount_reports_lun_failure_but_clears_state() {
        let fx = Fixture::new("vmediad_test_ctl_unmount_lun_fault", Fault::None);
        fx.controller
            .mount_with_webrtc(None, "remote.iso", 4096, VirtualMediaMode::Disk)
            .await
            .unwrap();

        std::fs::remove_dir_all(&fx.config.gadget_function_path).unwrap();
        assert!(matches!(fx.controller.unmount().await, Err(VmError::Gadget(_))));
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.export.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_close_unmounts_webrtc_media() {
        let fx = Fixture::new("vmediad_test_ctl_session_close", Fault::None);
        let (rpc_a, _rx_a) = recording_sink();
        let (rpc_b, _rx_b) = recording_sink();
        let owner = fx.sessions.open(rpc_a);
        let bystander = fx.sessions.open(rpc_b);

        fx.controller
            .mount_with_webrtc(Some(owner.id()), "remote.iso", 4096, VirtualMediaMode::Cdrom)
            .await
            .unwrap();

        // Sessions that did not mount anything leave the media alone
        fx.sessions.close(&bystander);
        fx.controller.handle_session_closed(&bystander).await;
        assert!(fx.controller.get_state().await.is_some());

        fx.sessions.close(&owner);
        fx.controller.handle_session_closed(&owner).await;
        assert!(fx.controller.get_state().await.is_none());
        assert_eq!(fx.export.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closing_previous_owner_keeps_newer_mount() {
        let fx = Fixture::new("vmediad_test_ctl_stale_owner", Fault::None);
        let (rpc_a, _rx_a) = recording_sink();
        let (rpc_b, _rx_b) = recording_sink();
        let a = fx.sessions.open(rpc_a);

        fx.controller
            .mount_with_webrtc(Some(a.id()), "a.iso", 4096, VirtualMediaMode::Cdrom)
            .await
            .unwrap();
        fx.controller.unmount().await.unwrap();

        let b = fx.sessions.open(rpc_b);
        fx.controller
            .mount_with_webrtc(Some(b.id()), "b.iso", 4096, VirtualMediaMode::Disk)
            .await
            .unwrap();

        // A once owned a mount, but not this one
        fx.sessions.close(&a);
        fx.controller.handle_session_closed(&a).await;
        let state = fx.controller.get_state().await.unwrap();
        assert_eq!(state.filename.as_deref(), Some("b.iso"));
        assert_eq!(fx.lun_attr("file"), fx.config.nbd_device.to_string_lossy());

        fx.controller.handle_session_closed(&b).await;
        assert!(fx.controller.get_state().await.is_none());
    }

    #[tokio::test]
    async fn test_session_close_leaves_http_media() {
        let fx = Fixture::new("vmediad_test_ctl_session_close_http", Fault::None);
        let base = spawn_image_server(vec![1u8; 4096]).await;
        let (rpc, _rx) = recording_sink();
        let session = fx.sessions.open(rpc);

        fx.controller
            .mount_with_http(&format!("{}/image.iso", base), VirtualMediaMode::Cdrom)
            .await
            .unwrap();
        fx.controller.handle_session_closed(&session).await;
        assert!(fx.controller.get_state().await.is_some());

        fx.controller.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_mass_storage_mode() {
        let fx = Fixture::new("vmediad_test_ctl_mode", Fault::None);

        assert_eq!(fx.controller.get_mass_storage_mode().await.unwrap(), "file");
        assert_eq!(
            fx.controller.set_mass_storage_mode("cdrom").await.unwrap(),
            "cdrom"
        );
        assert_eq!(fx.lun_attr("cdrom"), "1");
        assert!(matches!(
            fx.controller.set_mass_storage_mode("floppy").await,
            Err(VmError::InvalidMode(_))
        ));
    }

    #[tokio::test]
    async fn test_mass_storage_mode_locked_while_mounted() {
        let fx = Fixture::new("vmediad_test_ctl_mode_mounted", Fault::None);
        fx.controller
            .mount_with_webrtc(None, "remote.iso", 4096, VirtualMediaMode::Cdrom)
            .await
            .unwrap();
        assert_eq!(fx.lun_attr("cdrom"), "1");

        assert_eq!(
            fx.controller.set_mass_storage_mode("file").await,
            Err(VmError::AlreadyMounted)
        );
        assert_eq!(fx.lun_attr("cdrom"), "1");
        assert_eq!(
            fx.controller.get_state().await.unwrap().mode,
            VirtualMediaMode::Cdrom
        );

        fx.controller.unmount().await.unwrap();
        assert_eq!(fx.controller.set_mass_storage_mode("file").await.unwrap(), "file");
        assert_eq!(fx.lun_attr("cdrom"), "0");
    }
}
