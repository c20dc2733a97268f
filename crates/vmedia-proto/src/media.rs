//! Virtual media data model and the remote-read wire messages.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::CHUNK_HEADER_LEN;
use crate::error::VmError;

/// Where the bytes of a mounted image come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VirtualMediaSource {
    /// A file held by the connected peer, fetched over the disk channel.
    #[serde(rename = "WebRTC")]
    WebRtc,
    /// A URL served by an HTTP server that honours range requests.
    #[serde(rename = "HTTP")]
    Http,
    /// A file in the local images directory.
    Storage,
}

/// How the gadget LUN presents the medium to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VirtualMediaMode {
    #[serde(rename = "CDROM")]
    Cdrom,
    Disk,
}

impl VirtualMediaMode {
    pub fn is_cdrom(self) -> bool {
        self == Self::Cdrom
    }
}

impl fmt::Display for VirtualMediaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cdrom => f.write_str("CDROM"),
            Self::Disk => f.write_str("Disk"),
        }
    }
}

impl FromStr for VirtualMediaMode {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CDROM" | "cdrom" => Ok(Self::Cdrom),
            "Disk" | "disk" => Ok(Self::Disk),
            other => Err(VmError::InvalidMode(other.to_string())),
        }
    }
}

/// The single source of truth for what is mounted.
///
/// Immutable once created; a different medium requires an unmount first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMediaState {
    pub source: VirtualMediaSource,
    pub mode: VirtualMediaMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub size: u64,
}

/// Half-open byte range `[start, end)` requested from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskReadRequest {
    pub start: u64,
    pub end: u64,
}

impl DiskReadRequest {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The 16-byte header in front of every chunk the peer sends back.
///
/// Layout: `u64 offset (big-endian) + u64 payload length (big-endian)`.
/// The offset echoes the position of the first payload byte, which is what
/// lets the daemon route a chunk to the read that asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub offset: u64,
    pub length: u64,
}

impl ChunkHeader {
    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..8].copy_from_slice(&self.offset.to_be_bytes());
        out[8..].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Split a chunk into its header and payload. Returns `None` if the
    /// message is shorter than the header.
    pub fn split(message: &[u8]) -> Option<(ChunkHeader, &[u8])> {
        if message.len() < CHUNK_HEADER_LEN {
            return None;
        }
        let (head, payload) = message.split_at(CHUNK_HEADER_LEN);
        let mut offset = [0u8; 8];
        let mut length = [0u8; 8];
        offset.copy_from_slice(&head[..8]);
        length.copy_from_slice(&head[8..]);
        Some((
            ChunkHeader {
                offset: u64::from_be_bytes(offset),
                length: u64::from_be_bytes(length),
            },
            payload,
        ))
    }

    /// Build a complete chunk message for `payload` starting at `offset`.
    pub fn frame_payload(offset: u64, payload: &[u8]) -> Vec<u8> {
        let header = ChunkHeader {
            offset,
            length: payload.len() as u64,
        };
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(payload);
        out
    }
}

// ─── Local image storage ────────────────────────────────────────────────────

/// An image file in the local images directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageFile {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFiles {
    pub files: Vec<StorageFile>,
}

/// Usage of the filesystem holding the images directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpace {
    pub bytes_used: u64,
    pub bytes_free: u64,
}

/// Answer to `startStorageFileUpload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageFileUpload {
    /// Bytes already on disk from an earlier attempt; the sender resumes here.
    pub already_uploaded_bytes: u64,
    /// Upload id to send in the `Open` frame of the upload channel.
    pub data_channel: String,
}

/// Progress report sent back on the upload channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub size: u64,
    pub already_uploaded_bytes: u64,
}

impl UploadProgress {
    pub fn is_complete(&self) -> bool {
        self.already_uploaded_bytes >= self.size
    }
}

/// Result of probing a URL before mounting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMediaUrlInfo {
    pub usable: bool,
    /// Only populated if `usable` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub size: u64,
}
