//! Storage backend served through the block bridge.
//!
//! The backend is stateless per call: every read looks up the current mount
//! under the shared lock, copies out what it needs, releases the lock and
//! only then performs the (possibly slow) remote fetch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use vmedia_proto::error::{VmError, VmResult};

use crate::controller::SharedMedia;
use crate::http_range::RangeHttpReader;
use crate::nbd::ExportBackend;
use crate::remote::RemoteDiskReader;

/// Where the bytes of a network-backed mount come from.
pub enum ImageReader {
    /// A peer-held file fetched over the disk channel (bounded by a deadline).
    Remote(RemoteDiskReader),
    /// A URL fetched with HTTP range requests.
    Http(RangeHttpReader),
}

impl ImageReader {
    pub async fn read_at(&self, offset: u64, len: u64) -> VmResult<Vec<u8>> {
        match self {
            Self::Remote(reader) => reader.read(offset, len).await,
            Self::Http(reader) => reader.read_at(offset, len).await,
        }
    }
}

/// Read-only view of whatever is currently mounted.
#[derive(Clone)]
pub struct StorageBackend {
    media: SharedMedia,
}

impl StorageBackend {
    pub fn new(media: SharedMedia) -> Self {
        Self { media }
    }

    /// Fill `buf` from `offset`, never reading past the image end.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> VmResult<usize> {
        let (size, reader) = {
            let media = self.media.read().await;
            let mounted = media.as_ref().ok_or(VmError::NotMounted)?;
            (mounted.state.size, mounted.reader.clone())
        };
        debug!("read size: {}, off: {}", buf.len(), offset);

        let len = (buf.len() as u64).min(size.saturating_sub(offset));
        if len == 0 {
            return Ok(0);
        }
        let reader: Arc<ImageReader> = reader.ok_or(VmError::WrongSource)?;

        let data = reader.read_at(offset, len).await?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    pub async fn write_at(&self, _buf: &[u8], _offset: u64) -> VmResult<usize> {
        Err(VmError::ReadOnly)
    }

    pub async fn size(&self) -> VmResult<u64> {
        let media = self.media.read().await;
        media
            .as_ref()
            .map(|m| m.state.size)
            .ok_or(VmError::NotMounted)
    }

    pub async fn sync(&self) -> VmResult<()> {
        Ok(())
    }
}

#[async_trait]
impl ExportBackend for StorageBackend {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> VmResult<usize> {
        StorageBackend::read_at(self, buf, offset).await
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> VmResult<usize> {
        StorageBackend::write_at(self, buf, offset).await
    }

    async fn size(&self) -> VmResult<u64> {
        StorageBackend::size(self).await
    }

    async fn sync(&self) -> VmResult<()> {
        StorageBackend::sync(self).await
    }
}
