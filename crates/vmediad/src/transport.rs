//! Peer transport.
//!
//! Peers connect to a Unix socket; each connection is one session carrying
//! the `rpc`, `disk` and `upload` channels as frames (see
//! [`vmedia_proto::frame`]). A connection runs at most one upload at a time.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::frame::{read_frame, write_frame, Channel, Frame, MessageKind};

use crate::controller::MountController;
use crate::rpc;
use crate::session::{ChannelSink, Session, SessionManager};
use crate::upload::ActiveUpload;

/// Outbound half of one channel, feeding the connection's writer task.
struct FrameSink {
    channel: Channel,
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl ChannelSink for FrameSink {
    async fn send_text(&self, text: String) -> VmResult<()> {
        self.tx
            .send(Frame::text(self.channel, text))
            .map_err(|_| VmError::ChannelClosed)
    }
}

/// Accept peers on `path` until `shutdown` fires.
pub async fn start_peer_server(
    path: &Path,
    controller: Arc<MountController>,
    sessions: Arc<SessionManager>,
    shutdown: Arc<Notify>,
) -> VmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(VmError::Socket(format!("failed to remove {}: {}", path.display(), e))),
    }
    let listener = UnixListener::bind(path)
        .map_err(|e| VmError::Socket(format!("failed to listen on {}: {}", path.display(), e)))?;
    info!("peer server listening on {}", path.display());

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let controller = controller.clone();
                        let sessions = sessions.clone();
                        tokio::spawn(async move {
                            handle_peer(stream, controller, sessions).await;
                        });
                    }
                    Err(e) => {
                        error!("peer accept error: {}", e);
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("peer server shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(path);
    Ok(())
}

/// Run one peer connection as a session until it closes.
pub async fn handle_peer<S>(stream: S, controller: Arc<MountController>, sessions: Arc<SessionManager>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("peer write failed: {}", e);
                break;
            }
        }
    });

    let rpc_sink = Arc::new(FrameSink {
        channel: Channel::Rpc,
        tx: tx.clone(),
    });
    let session = sessions.open(rpc_sink);
    let mut upload: Option<ActiveUpload> = None;

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("session {} read failed: {}", session.id(), e);
                break;
            }
        };
        on_frame(&controller, &session, &tx, &mut upload, frame).await;
    }

    if let Some(upload) = upload.take() {
        end_upload(upload).await;
    }
    sessions.close(&session);
    controller.handle_session_closed(&session).await;
    // The session's sinks still hold senders, so the writer never sees the
    // channel close on its own
    writer_task.abort();
}

async fn on_frame(
    controller: &Arc<MountController>,
    session: &Arc<Session>,
    tx: &mpsc::UnboundedSender<Frame>,
    upload: &mut Option<ActiveUpload>,
    frame: Frame,
) {
    match (frame.channel, frame.kind) {
        (Channel::Rpc, MessageKind::Text) => {
            let text = String::from_utf8_lossy(&frame.payload).into_owned();
            let controller = controller.clone();
            let session = session.clone();
            // Mounts can take seconds; keep reading disk chunks meanwhile
            tokio::spawn(async move {
                if let Some(response) = rpc::handle_message(&controller, &session, &text).await {
                    if let Err(e) = session.rpc().send_text(response).await {
                        debug!("session {} rpc reply dropped: {}", session.id(), e);
                    }
                }
            });
        }
        (Channel::Disk, MessageKind::Open) => {
            session.open_disk(Arc::new(FrameSink {
                channel: Channel::Disk,
                tx: tx.clone(),
            }));
        }
        (Channel::Disk, MessageKind::Binary) => match session.disk() {
            Some(disk) => disk.on_message(&frame.payload),
            None => warn!("session {} sent disk data without a disk channel", session.id()),
        },
        (Channel::Disk, MessageKind::Close) => session.close_disk(),
        (Channel::Upload, _) => on_upload_frame(controller, session, tx, upload, frame).await,
        (channel, kind) => {
            debug!("ignoring {:?} frame on {} channel", kind, channel.label());
        }
    }
}

async fn on_upload_frame(
    controller: &MountController,
    session: &Session,
    tx: &mpsc::UnboundedSender<Frame>,
    slot: &mut Option<ActiveUpload>,
    frame: Frame,
) {
    match frame.kind {
        MessageKind::Open => {
            if let Some(previous) = slot.take() {
                end_upload(previous).await;
            }
            let id = String::from_utf8_lossy(&frame.payload);
            match controller.uploads().claim(&id) {
                Ok(upload) => *slot = Some(upload),
                Err(e) => {
                    warn!("session {} upload channel refused: {}", session.id(), e);
                    let _ = tx.send(Frame::close(Channel::Upload));
                }
            }
        }
        MessageKind::Binary => {
            let Some(upload) = slot.as_mut() else {
                warn!("session {} sent upload data without an upload channel", session.id());
                return;
            };
            match upload.write(&frame.payload).await {
                Ok(None) => return,
                Ok(Some(progress)) => {
                    match serde_json::to_string(&progress) {
                        Ok(text) => {
                            let _ = tx.send(Frame::text(Channel::Upload, text));
                        }
                        Err(e) => error!("failed to encode upload progress: {}", e),
                    }
                    if !progress.is_complete() {
                        return;
                    }
                }
                Err(e) => error!("upload {} failed: {}", upload.id(), e),
            }
            // Complete, or the file is unusable
            if let Some(upload) = slot.take() {
                end_upload(upload).await;
            }
            let _ = tx.send(Frame::close(Channel::Upload));
        }
        MessageKind::Close => {
            if let Some(upload) = slot.take() {
                end_upload(upload).await;
            }
        }
        MessageKind::Text => debug!("ignoring text on upload channel"),
    }
}

async fn end_upload(upload: ActiveUpload) {
    let id = upload.id().to_string();
    if let Err(e) = upload.finish().await {
        error!("upload {} could not be finished: {}", id, e);
    }
}
