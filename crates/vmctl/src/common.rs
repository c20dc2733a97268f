//! Shared utilities for the vmctl CLI tool.
//!
//! Provides the peer connection to the daemon, JSON-RPC calls over it and
//! formatting helpers used across all subcommands.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::frame::{read_frame, write_frame, Channel, Frame, MessageKind};
use vmedia_proto::media::{ChunkHeader, DiskReadRequest, UploadProgress};
use vmedia_proto::rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Frames queued for the writer before senders have to wait.
const OUTBOUND_QUEUE: usize = 64;

type PendingCalls = DashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// Something the daemon said on the upload channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    Progress(UploadProgress),
    Closed,
}

/// Unsolicited traffic from the daemon.
pub struct PeerEvents {
    pub disk: mpsc::UnboundedReceiver<DiskReadRequest>,
    pub upload: mpsc::UnboundedReceiver<UploadEvent>,
}

/// One connection to the daemon, i.e. one session.
pub struct PeerClient {
    tx: mpsc::Sender<Frame>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
}

impl PeerClient {
    /// Connect to the daemon's peer socket.
    pub async fn connect(path: &Path) -> VmResult<(Self, PeerEvents)> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| VmError::Socket(format!("failed to connect to {}: {}", path.display(), e)))?;
        Ok(Self::over(stream))
    }

    /// Run the client over any duplex stream.
    pub fn over<S>(stream: S) -> (Self, PeerEvents)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("write to daemon failed: {}", e);
                    break;
                }
            }
        });

        let calls = pending.clone();
        tokio::spawn(async move {
            loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("read from daemon failed: {}", e);
                        break;
                    }
                };
                match (frame.channel, frame.kind) {
                    (Channel::Rpc, MessageKind::Text) => {
                        match serde_json::from_slice::<JsonRpcResponse>(&frame.payload) {
                            Ok(resp) => {
                                let waiter = resp.id.as_u64().and_then(|id| calls.remove(&id));
                                match waiter {
                                    Some((_, done)) => {
                                        let _ = done.send(resp);
                                    }
                                    None => debug!("unsolicited rpc response: {:?}", resp.id),
                                }
                            }
                            Err(e) => warn!("malformed rpc response: {}", e),
                        }
                    }
                    (Channel::Disk, MessageKind::Text) => {
                        match serde_json::from_slice::<DiskReadRequest>(&frame.payload) {
                            Ok(req) => {
                                let _ = disk_tx.send(req);
                            }
                            Err(e) => warn!("malformed disk request: {}", e),
                        }
                    }
                    (Channel::Upload, MessageKind::Text) => {
                        match serde_json::from_slice::<UploadProgress>(&frame.payload) {
                            Ok(progress) => {
                                let _ = upload_tx.send(UploadEvent::Progress(progress));
                            }
                            Err(e) => warn!("malformed upload progress: {}", e),
                        }
                    }
                    (Channel::Upload, MessageKind::Close) => {
                        let _ = upload_tx.send(UploadEvent::Closed);
                    }
                    (channel, kind) => debug!("ignoring {:?} on {}", kind, channel.label()),
                }
            }
            // Wake every caller still waiting
            calls.clear();
        });

        let client = Self {
            tx,
            pending,
            next_id: AtomicU64::new(1),
        };
        let events = PeerEvents {
            disk: disk_rx,
            upload: upload_rx,
        };
        (client, events)
    }

    /// Call `method` and wait for its result.
    pub async fn call(&self, method: &str, params: Value) -> VmResult<Value> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(VmError::Protocol(format!("params must be an object, got {}", other))),
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(method, params, id);
        let text = serde_json::to_string(&request)?;

        let (done, rx) = oneshot::channel();
        self.pending.insert(id, done);
        self.send(Frame::text(Channel::Rpc, text)).await?;

        let resp = rx.await.map_err(|_| VmError::Disconnected)?;
        match resp.error {
            Some(err) => Err(remote_error(err)),
            None => Ok(resp.result.unwrap_or(Value::Null)),
        }
    }

    pub async fn open_disk(&self) -> VmResult<()> {
        self.send(Frame::open(Channel::Disk)).await
    }

    /// Push `data` read at `offset` back to the daemon.
    pub async fn send_chunk(&self, offset: u64, data: &[u8]) -> VmResult<()> {
        self.send(Frame::binary(Channel::Disk, ChunkHeader::frame_payload(offset, data)))
            .await
    }

    pub async fn open_upload(&self, id: &str) -> VmResult<()> {
        self.send(Frame::open_upload(id)).await
    }

    pub async fn send_upload(&self, data: Vec<u8>) -> VmResult<()> {
        self.send(Frame::binary(Channel::Upload, data)).await
    }

    pub async fn close_upload(&self) -> VmResult<()> {
        self.send(Frame::close(Channel::Upload)).await
    }

    async fn send(&self, frame: Frame) -> VmResult<()> {
        self.tx.send(frame).await.map_err(|_| VmError::Disconnected)
    }
}

/// Turn a JSON-RPC error into the daemon-side message it carries.
fn remote_error(err: JsonRpcError) -> VmError {
    let message = match err.data {
        Some(Value::String(s)) => format!("{}: {}", err.message, s),
        Some(other) => format!("{}: {}", err.message, other),
        None => err.message,
    };
    VmError::Rpc {
        code: err.code,
        message,
    }
}

/// Format a byte count as a human-readable size string.
///
/// Examples: "1.0 GB", "512.0 MB", "4.0 TB"
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{}", msg);
}

/// Print an error and exit.
pub fn exit_error(err: &VmError) -> ! {
    eprintln!("Error: {}", err);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(734003200), "700.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[tokio::test]
    async fn test_call_and_disk_requests() {
        let (client_end, mut daemon) = tokio::io::duplex(1 << 16);
        let (client, mut events) = PeerClient::over(client_end);

        let call = tokio::spawn(async move {
            let result = client.call("ping", Value::Null).await;
            (client, result)
        });

        let frame = read_frame(&mut daemon).await.unwrap().unwrap();
        let req: JsonRpcRequest = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(req.method, "ping");
        let id = req.id.unwrap();

        let reply = JsonRpcResponse::success(id, json!("pong"));
        write_frame(&mut daemon, &Frame::text(Channel::Rpc, serde_json::to_string(&reply).unwrap()))
            .await
            .unwrap();
        let (client, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), json!("pong"));

        let disk = DiskReadRequest { start: 0, end: 512 };
        write_frame(&mut daemon, &Frame::text(Channel::Disk, serde_json::to_string(&disk).unwrap()))
            .await
            .unwrap();
        assert_eq!(events.disk.recv().await.unwrap(), disk);

        client.send_chunk(0, &[9u8; 512]).await.unwrap();
        let frame = read_frame(&mut daemon).await.unwrap().unwrap();
        assert_eq!(frame.kind, MessageKind::Binary);
        let (header, payload) = ChunkHeader::split(&frame.payload).unwrap();
        assert_eq!(header.offset, 0);
        assert_eq!(payload, &[9u8; 512]);
    }

    #[tokio::test]
    async fn test_call_error_and_disconnect() {
        let (client_end, mut daemon) = tokio::io::duplex(1 << 16);
        let (client, _events) = PeerClient::over(client_end);
        let client = Arc::new(client);

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("mountWithStorage", json!({"filename": "x"})).await });
        let frame = read_frame(&mut daemon).await.unwrap().unwrap();
        let req: JsonRpcRequest = serde_json::from_slice(&frame.payload).unwrap();
        let reply = JsonRpcResponse::failure(req.id.unwrap(), -32603, "Internal error", Some("file does not exist: x".into()));
        write_frame(&mut daemon, &Frame::text(Channel::Rpc, serde_json::to_string(&reply).unwrap()))
            .await
            .unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            VmError::Rpc {
                code: -32603,
                message: "Internal error: file does not exist: x".into()
            }
        );
        assert_eq!(err.rpc_code(), -32603);

        assert!(matches!(
            client.call("ping", json!([1])).await,
            Err(VmError::Protocol(_))
        ));

        let caller = client.clone();
        let call = tokio::spawn(async move { caller.call("ping", Value::Null).await });
        let _ = read_frame(&mut daemon).await.unwrap().unwrap();
        drop(daemon);
        assert_eq!(call.await.unwrap(), Err(VmError::Disconnected));
    }

    #[tokio::test]
    async fn test_upload_events() {
        let (client_end, mut daemon) = tokio::io::duplex(1 << 16);
        let (client, mut events) = PeerClient::over(client_end);

        client.open_upload("upload_7").await.unwrap();
        client.send_upload(b"data".to_vec()).await.unwrap();
        let open = read_frame(&mut daemon).await.unwrap().unwrap();
        assert_eq!(open, Frame::open_upload("upload_7"));
        let data = read_frame(&mut daemon).await.unwrap().unwrap();
        assert_eq!((data.channel, data.kind), (Channel::Upload, MessageKind::Binary));

        let progress = UploadProgress {
            size: 4,
            already_uploaded_bytes: 4,
        };
        write_frame(&mut daemon, &Frame::text(Channel::Upload, serde_json::to_string(&progress).unwrap()))
            .await
            .unwrap();
        write_frame(&mut daemon, &Frame::close(Channel::Upload)).await.unwrap();
        assert_eq!(events.upload.recv().await.unwrap(), UploadEvent::Progress(progress));
        assert_eq!(events.upload.recv().await.unwrap(), UploadEvent::Closed);
    }
}
