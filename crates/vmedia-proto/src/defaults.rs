//! Tunable operational defaults for the virtual media daemon.
//!
//! Protocol-level constants (wire format, magic numbers) remain in
//! [`crate::constants`]. This module centralizes the configurable
//! defaults that can be overridden via CLI flags.

// ─── Filesystem locations ───────────────────────────────────────────────────

/// Directory holding images that can be mounted from local storage.
pub const DEFAULT_IMAGES_DIR: &str = "/userdata/jetkvm/images";

/// Configfs directory of the USB mass-storage function.
pub const DEFAULT_GADGET_FUNCTION_PATH: &str =
    "/sys/kernel/config/usb_gadget/jetkvm/functions/mass_storage.usb0";

/// Logical unit of the mass-storage function that carries the medium.
pub const DEFAULT_LUN: &str = "lun.0";

/// Kernel NBD device node used by the block bridge.
pub const DEFAULT_NBD_DEVICE: &str = "/dev/nbd0";

/// Unix socket connecting the two halves of the block bridge.
pub const DEFAULT_NBD_SOCKET: &str = "/var/run/nbd.socket";

/// Unix socket peers connect to.
pub const DEFAULT_PEER_SOCKET: &str = "/var/run/vmediad.sock";

/// Sysfs directory with per-block-device attributes.
pub const DEFAULT_SYSFS_BLOCK_DIR: &str = "/sys/class/block";

// ─── Timing ─────────────────────────────────────────────────────────────────

/// Deadline for a single remote read (5 s).
pub const DEFAULT_REMOTE_READ_TIMEOUT_MS: u64 = 5_000;

/// How long to wait for the kernel device to report a size after attach.
pub const DEFAULT_DEVICE_READY_TIMEOUT_MS: u64 = 5_000;

/// Interval between device size polls.
pub const DEFAULT_DEVICE_POLL_INTERVAL_MS: u64 = 50;

/// Pause between detaching the LUN and tearing down the block bridge.
pub const DEFAULT_LUN_DETACH_DELAY_MS: u64 = 500;

/// Timeout for a single HTTP range request.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Minimum gap between two upload progress reports.
pub const DEFAULT_UPLOAD_PROGRESS_INTERVAL_MS: u64 = 200;
