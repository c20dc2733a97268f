//! Daemon configuration.
//!
//! Built from the command line in `main`; every field has a default from
//! [`vmedia_proto::defaults`].

use std::path::PathBuf;
use std::time::Duration;

use vmedia_proto::defaults::*;

#[derive(Debug, Clone)]
pub struct Config {
    /// Images that can be mounted from local storage.
    pub images_dir: PathBuf,
    /// Configfs directory of the mass-storage function.
    pub gadget_function_path: PathBuf,
    pub lun: String,
    pub nbd_device: PathBuf,
    pub nbd_socket: PathBuf,
    pub peer_socket: PathBuf,
    pub sysfs_block_dir: PathBuf,
    pub remote_read_timeout: Duration,
    pub device_ready_timeout: Duration,
    pub device_poll_interval: Duration,
    pub lun_detach_delay: Duration,
    pub http_timeout: Duration,
    pub upload_progress_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            gadget_function_path: PathBuf::from(DEFAULT_GADGET_FUNCTION_PATH),
            lun: DEFAULT_LUN.to_string(),
            nbd_device: PathBuf::from(DEFAULT_NBD_DEVICE),
            nbd_socket: PathBuf::from(DEFAULT_NBD_SOCKET),
            peer_socket: PathBuf::from(DEFAULT_PEER_SOCKET),
            sysfs_block_dir: PathBuf::from(DEFAULT_SYSFS_BLOCK_DIR),
            remote_read_timeout: Duration::from_millis(DEFAULT_REMOTE_READ_TIMEOUT_MS),
            device_ready_timeout: Duration::from_millis(DEFAULT_DEVICE_READY_TIMEOUT_MS),
            device_poll_interval: Duration::from_millis(DEFAULT_DEVICE_POLL_INTERVAL_MS),
            lun_detach_delay: Duration::from_millis(DEFAULT_LUN_DETACH_DELAY_MS),
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            upload_progress_interval: Duration::from_millis(DEFAULT_UPLOAD_PROGRESS_INTERVAL_MS),
        }
    }
}

impl Config {
    /// A configuration rooted entirely under `root`, with no settle delays.
    #[cfg(test)]
    pub fn for_test(root: &std::path::Path) -> Self {
        Self {
            images_dir: root.join("images"),
            gadget_function_path: root.join("gadget"),
            nbd_device: root.join("nbd0"),
            nbd_socket: root.join("nbd.socket"),
            peer_socket: root.join("peer.sock"),
            sysfs_block_dir: root.join("sys"),
            remote_read_timeout: Duration::from_millis(500),
            device_ready_timeout: Duration::from_millis(500),
            device_poll_interval: Duration::from_millis(10),
            lun_detach_delay: Duration::ZERO,
            http_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.nbd_device, Path::new("/dev/nbd0"));
        assert_eq!(config.remote_read_timeout, Duration::from_secs(5));
        assert_eq!(config.lun, "lun.0");
        assert_eq!(config.upload_progress_interval, Duration::from_millis(200));

        let test = Config::for_test(Path::new("/tmp/x"));
        assert_eq!(test.images_dir, Path::new("/tmp/x/images"));
        assert_eq!(test.lun_detach_delay, Duration::ZERO);
    }
}
