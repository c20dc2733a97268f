/// Virtual media error types.
///
/// One enum covers state, capability, transport and validation failures so
/// that the daemon, the block bridge and the RPC layer speak the same
/// language. Details that only matter for diagnosis are logged where the
/// failure happens; the variants carry just enough text for the caller.

use crate::constants::{NBD_EINVAL, NBD_EIO, NBD_EPERM, NBD_ESHUTDOWN};
use crate::rpc::{INTERNAL_ERROR, INVALID_PARAMS};

/// Unified error type for all virtual media operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    // State errors
    #[error("another virtual media is already mounted")]
    AlreadyMounted,
    #[error("image not mounted")]
    NotMounted,
    #[error("image not mounted from webrtc")]
    WrongSource,

    // Capability errors
    #[error("NBD device does not exist")]
    NoDevice,
    #[error("block device did not become ready")]
    DeviceNotReady,
    #[error("bridge socket error: {0}")]
    Socket(String),
    #[error("mass storage gadget error: {0}")]
    Gadget(String),

    // Transport errors
    #[error("no active session")]
    NoActiveSession,
    #[error("remote read timed out")]
    ReadTimeout,
    #[error("disk channel closed")]
    ChannelClosed,
    #[error("http error: {0}")]
    Http(String),
    #[error("server does not support range requests")]
    RangeUnsupported,

    // Validation errors
    #[error("invalid filename")]
    InvalidFilename,
    #[error("file does not exist: {0}")]
    FileNotFound(String),
    #[error("invalid mode: {0}")]
    InvalidMode(String),
    #[error("file already exists: {0}")]
    FileExists(String),
    #[error("unknown upload: {0}")]
    UnknownUpload(String),

    // Remote errors
    #[error("{message} (code {code})")]
    Rpc { code: i64, message: String },
    #[error("peer connection closed")]
    Disconnected,

    #[error("virtual media is read-only")]
    ReadOnly,
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl VmError {
    /// Map to the error code carried in an NBD simple reply.
    pub fn nbd_errno(&self) -> u32 {
        match self {
            Self::ReadOnly => NBD_EPERM,
            Self::Protocol(_) => NBD_EINVAL,
            Self::NotMounted | Self::NoActiveSession => NBD_ESHUTDOWN,
            _ => NBD_EIO,
        }
    }

    /// Map to the JSON-RPC error code reported for a failed call.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::Protocol(_) => INVALID_PARAMS,
            Self::Rpc { code, .. } => *code,
            _ => INTERNAL_ERROR,
        }
    }

    /// Whether the error was caused by the caller rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyMounted
                | Self::NotMounted
                | Self::InvalidFilename
                | Self::FileNotFound(_)
                | Self::InvalidMode(_)
                | Self::FileExists(_)
                | Self::UnknownUpload(_)
        )
    }
}

/// Result type alias for virtual media operations.
pub type VmResult<T> = Result<T, VmError>;

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        VmError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for VmError {
    fn from(e: serde_json::Error) -> Self {
        VmError::Protocol(e.to_string())
    }
}
