//! Remote disk reads over a peer's disk channel.
//!
//! A read sends `{"start":..,"end":..}` as a text message and collects the
//! binary chunks the peer pushes back. Each chunk begins with a 16-byte
//! header whose first 8 bytes are the image offset of its first payload
//! byte. A chunk is appended only to a read whose next expected offset is
//! exactly that value, so the bytes a read returns always come from the
//! positions it asked for, even when ranges overlap. A second read of an
//! identical start offset waits for the first to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::{ChunkHeader, DiskReadRequest};

use crate::session::SessionManager;

/// A read waiting for its bytes.
struct PendingRead {
    id: u64,
    end: u64,
    buf: Vec<u8>,
    done: oneshot::Sender<Vec<u8>>,
}

impl PendingRead {
    /// Image offset of the next byte this read is waiting for.
    fn next_offset(&self, start: u64) -> u64 {
        start + self.buf.len() as u64
    }
}

/// In-flight reads on one disk channel, keyed by start offset.
pub struct PendingReads {
    reads: DashMap<u64, PendingRead>,
    freed: Notify,
    next_id: AtomicU64,
}

impl Default for PendingReads {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingReads {
    pub fn new() -> Self {
        Self {
            reads: DashMap::new(),
            freed: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Claim the completion slot for `[start, end)`.
    pub async fn register(self: &Arc<Self>, start: u64, end: u64) -> ReadTicket {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Entry::Vacant(slot) = self.reads.entry(start) {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let (done, rx) = oneshot::channel();
                slot.insert(PendingRead {
                    id,
                    end,
                    buf: Vec::new(),
                    done,
                });
                return ReadTicket {
                    reads: self.clone(),
                    start,
                    id,
                    rx: Some(rx),
                };
            }

            debug!("read at offset {} already in flight, waiting", start);
            freed.await;
        }
    }

    /// Strip the chunk header and append the payload to the owning read.
    pub fn deliver(&self, message: &[u8]) {
        let Some((header, payload)) = ChunkHeader::split(message) else {
            warn!("dropping short disk message ({} bytes)", message.len());
            return;
        };

        // Chunks arrive from a single reader task per channel, so the read
        // found here is still waiting for this offset when it is updated.
        let owner = self
            .reads
            .iter()
            .find(|r| r.next_offset(*r.key()) == header.offset && header.offset < r.end)
            .map(|r| *r.key());
        let Some(start) = owner else {
            warn!("dropping disk chunk for offset {} with no pending read", header.offset);
            return;
        };

        let complete = match self.reads.get_mut(&start) {
            Some(mut read) if read.next_offset(start) == header.offset => {
                let wanted = (read.end - start) as usize;
                let take = payload.len().min(wanted.saturating_sub(read.buf.len()));
                read.buf.extend_from_slice(&payload[..take]);
                read.buf.len() >= wanted
            }
            _ => false,
        };

        if complete {
            if let Some((_, read)) = self.reads.remove(&start) {
                let _ = read.done.send(read.buf);
            }
            self.freed.notify_waiters();
        }
    }

    /// Drop every pending read; their waiters observe a closed channel.
    pub fn fail_all(&self) {
        if !self.is_empty() {
            debug!("failing {} pending read(s)", self.len());
        }
        self.reads.clear();
        self.freed.notify_waiters();
    }

    fn release(&self, start: u64, id: u64) {
        if self.reads.remove_if(&start, |_, r| r.id == id).is_some() {
            self.freed.notify_waiters();
        }
    }
}

/// Handle on a registered read. Dropping it gives up the slot.
pub struct ReadTicket {
    reads: Arc<PendingReads>,
    start: u64,
    id: u64,
    rx: Option<oneshot::Receiver<Vec<u8>>>,
}

impl ReadTicket {
    pub async fn wait(mut self) -> VmResult<Vec<u8>> {
        let Some(rx) = self.rx.take() else {
            return Err(VmError::ChannelClosed);
        };
        rx.await.map_err(|_| VmError::ChannelClosed)
    }
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        self.reads.release(self.start, self.id);
    }
}

/// Reads byte ranges of an image held by the current peer session.
pub struct RemoteDiskReader {
    sessions: Arc<SessionManager>,
    image_size: u64,
    deadline: Duration,
}

impl RemoteDiskReader {
    pub fn new(sessions: Arc<SessionManager>, image_size: u64, deadline: Duration) -> Self {
        Self {
            sessions,
            image_size,
            deadline,
        }
    }

    /// Fetch `size` bytes at `offset`, clamped to the image size.
    ///
    /// Fails with [`VmError::ReadTimeout`] if the peer has not delivered the
    /// whole range before the deadline.
    pub async fn read(&self, offset: u64, size: u64) -> VmResult<Vec<u8>> {
        match tokio::time::timeout(self.deadline, self.fetch(offset, size)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "remote read of {} bytes at {} timed out after {:?}",
                    size, offset, self.deadline
                );
                Err(VmError::ReadTimeout)
            }
        }
    }

    async fn fetch(&self, offset: u64, size: u64) -> VmResult<Vec<u8>> {
        let channel = self
            .sessions
            .disk_channel()
            .ok_or(VmError::NoActiveSession)?;

        let end = offset.saturating_add(size).min(self.image_size);
        let request = DiskReadRequest { start: offset, end };
        let text = serde_json::to_string(&request)?;

        let ticket = channel.pending().register(request.start, request.end).await;
        debug!("reading from remote peer {}", text);
        channel.send_text(text).await?;
        ticket.wait().await
    }
}
