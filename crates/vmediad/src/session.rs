//! Peer sessions.
//!
//! A session is one connected peer. It always has an RPC channel and may
//! open a disk channel, over which it serves byte ranges of an image it
//! holds. Only the most recent session is current; a newer connection
//! replaces the older one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use vmedia_proto::error::VmResult;

use crate::remote::PendingReads;

/// Outbound half of one channel of a peer connection.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send_text(&self, text: String) -> VmResult<()>;
}

/// The disk channel of a session together with the reads waiting on it.
pub struct DiskChannel {
    sink: Arc<dyn ChannelSink>,
    pending: Arc<PendingReads>,
}

impl DiskChannel {
    pub fn new(sink: Arc<dyn ChannelSink>) -> Self {
        Self {
            sink,
            pending: Arc::new(PendingReads::new()),
        }
    }

    pub fn pending(&self) -> &Arc<PendingReads> {
        &self.pending
    }

    pub async fn send_text(&self, text: String) -> VmResult<()> {
        self.sink.send_text(text).await
    }

    /// Route an inbound binary message to the read that requested it.
    pub fn on_message(&self, data: &[u8]) {
        debug!("disk message, len: {}", data.len());
        self.pending.deliver(data);
    }

    /// Fail every read still waiting on this channel.
    pub fn close(&self) {
        self.pending.fail_all();
    }
}

/// One connected peer.
pub struct Session {
    id: u64,
    rpc: Arc<dyn ChannelSink>,
    disk: RwLock<Option<Arc<DiskChannel>>>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn rpc(&self) -> &Arc<dyn ChannelSink> {
        &self.rpc
    }

    pub fn open_disk(&self, sink: Arc<dyn ChannelSink>) -> Arc<DiskChannel> {
        let channel = Arc::new(DiskChannel::new(sink));
        if let Ok(mut disk) = self.disk.write() {
            if let Some(old) = disk.replace(channel.clone()) {
                old.close();
            }
        }
        debug!("session {} opened disk channel", self.id);
        channel
    }

    pub fn close_disk(&self) {
        let old = match self.disk.write() {
            Ok(mut disk) => disk.take(),
            Err(_) => None,
        };
        if let Some(old) = old {
            old.close();
            debug!("session {} closed disk channel", self.id);
        }
    }

    pub fn disk(&self) -> Option<Arc<DiskChannel>> {
        self.disk.read().ok().and_then(|d| d.clone())
    }
}

/// Tracks the current peer session.
#[derive(Default)]
pub struct SessionManager {
    current: RwLock<Option<Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected peer and make it current.
    pub fn open(&self, rpc: Arc<dyn ChannelSink>) -> Arc<Session> {
        let session = Arc::new(Session {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            rpc,
            disk: RwLock::new(None),
        });
        if let Ok(mut current) = self.current.write() {
            if let Some(old) = current.replace(session.clone()) {
                info!("session {} replaced by session {}", old.id, session.id);
            }
        }
        info!("session {} connected", session.id);
        session
    }

    /// Tear down a session's channels and forget it if it is current.
    pub fn close(&self, session: &Arc<Session>) {
        session.close_disk();
        if let Ok(mut current) = self.current.write() {
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, session)) {
                *current = None;
            }
        }
        info!("session {} disconnected", session.id);
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    /// Disk channel of the current session, if it opened one.
    pub fn disk_channel(&self) -> Option<Arc<DiskChannel>> {
        self.current().and_then(|s| s.disk())
    }
}
