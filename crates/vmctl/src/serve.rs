//! `serve-file`: act as the peer holding an image.
//!
//! Mounts a local file through the daemon's peer-backed path, then answers
//! every disk read request from the file until interrupted.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::{DiskReadRequest, VirtualMediaMode};

use crate::common::{format_size, print_success, PeerClient};

/// Largest payload pushed in one chunk.
pub const CHUNK_LEN: usize = 64 * 1024;

pub async fn serve_file(
    client: PeerClient,
    mut disk_rx: mpsc::UnboundedReceiver<DiskReadRequest>,
    path: &Path,
    mode: VirtualMediaMode,
) -> VmResult<()> {
    let file = File::open(path).map_err(|e| VmError::Io(format!("failed to open {}: {}", path.display(), e)))?;
    let size = file
        .metadata()
        .map_err(|e| VmError::Io(format!("failed to stat {}: {}", path.display(), e)))?
        .len();
    let filename = file_name(path)?;

    let client = Arc::new(client);
    let file = Arc::new(file);
    client.open_disk().await?;
    client
        .call(
            "mountWithWebRTC",
            json!({"filename": filename, "size": size, "mode": mode}),
        )
        .await?;
    print_success(&format!(
        "Serving {} ({}) as {}, press Ctrl-C to stop",
        path.display(),
        format_size(size),
        mode
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            req = disk_rx.recv() => {
                let Some(req) = req else {
                    return Err(VmError::Disconnected);
                };
                let client = client.clone();
                let file = file.clone();
                tokio::spawn(async move {
                    if let Err(e) = answer(&client, file, req).await {
                        warn!("failed to serve {}..{}: {}", req.start, req.end, e);
                    }
                });
            }
        }
    }

    client.call("unmountImage", Value::Null).await?;
    print_success("Unmounted");
    Ok(())
}

/// Read `req` from `file` and push it back in order.
async fn answer(client: &PeerClient, file: Arc<File>, req: DiskReadRequest) -> VmResult<()> {
    debug!("disk read {}..{}", req.start, req.end);
    let data = tokio::task::spawn_blocking(move || read_range(&file, req))
        .await
        .map_err(|e| VmError::Io(e.to_string()))??;

    for (i, piece) in data.chunks(CHUNK_LEN).enumerate() {
        client.send_chunk(req.start + (i * CHUNK_LEN) as u64, piece).await?;
    }
    Ok(())
}

/// Final component of `path`, the name the daemon sees.
pub fn file_name(path: &Path) -> VmResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or(VmError::InvalidFilename)
}

fn read_range(file: &File, req: DiskReadRequest) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; req.len() as usize];
    file.read_exact_at(&mut buf, req.start)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmedia_proto::frame::{read_frame, MessageKind};
    use vmedia_proto::media::ChunkHeader;

    fn image_file(name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let path = std::env::temp_dir().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[test]
    fn test_read_range() {
        let (path, data) = image_file("vmctl_test_read_range.img", 4096);
        let file = File::open(&path).unwrap();
        let buf = read_range(&file, DiskReadRequest { start: 1000, end: 3000 }).unwrap();
        assert_eq!(buf, &data[1000..3000]);
        assert!(read_range(&file, DiskReadRequest { start: 4000, end: 5000 }).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_answer_splits_into_chunks() {
        let len = CHUNK_LEN * 2 + 100;
        let (path, data) = image_file("vmctl_test_answer.img", len);
        let file = Arc::new(File::open(&path).unwrap());

        let (client_end, mut daemon) = tokio::io::duplex(1 << 20);
        let (client, _events) = PeerClient::over(client_end);
        answer(&client, file, DiskReadRequest { start: 0, end: len as u64 })
            .await
            .unwrap();

        let mut received = Vec::new();
        let mut offsets = Vec::new();
        while received.len() < len {
            let frame = read_frame(&mut daemon).await.unwrap().unwrap();
            assert_eq!(frame.kind, MessageKind::Binary);
            let (header, payload) = ChunkHeader::split(&frame.payload).unwrap();
            offsets.push(header.offset);
            received.extend_from_slice(payload);
        }
        assert_eq!(offsets, vec![0, CHUNK_LEN as u64, 2 * CHUNK_LEN as u64]);
        assert_eq!(received, data);
        let _ = std::fs::remove_file(&path);
    }
}
