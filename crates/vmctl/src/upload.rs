//! `upload`: copy a local image into the daemon's images directory.
//!
//! Resumes after whatever an earlier, interrupted upload of the same name
//! left behind.

use std::io::SeekFrom;
use std::path::Path;

use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::debug;

use vmedia_proto::error::{VmError, VmResult};
use vmedia_proto::media::{StorageFileUpload, UploadProgress};

use crate::common::{format_size, print_success, PeerClient, UploadEvent};
use crate::serve::{file_name, CHUNK_LEN};

pub async fn upload_file(
    client: &PeerClient,
    events: &mut mpsc::UnboundedReceiver<UploadEvent>,
    path: &Path,
    name: Option<&str>,
) -> VmResult<()> {
    let mut file = File::open(path)
        .await
        .map_err(|e| VmError::Io(format!("failed to open {}: {}", path.display(), e)))?;
    let size = file.metadata().await?.len();
    let filename = match name {
        Some(name) => name.to_string(),
        None => file_name(path)?,
    };

    let value = client
        .call("startStorageFileUpload", json!({"filename": filename, "size": size}))
        .await?;
    let upload: StorageFileUpload = serde_json::from_value(value)?;
    if upload.already_uploaded_bytes > 0 {
        println!(
            "Resuming {} at {}",
            filename,
            format_size(upload.already_uploaded_bytes)
        );
    }

    client.open_upload(&upload.data_channel).await?;
    let sent = send_from(client, &mut file, upload.already_uploaded_bytes).await?;
    if sent == 0 {
        // Nothing left to send; closing lets the daemon finish the file
        client.close_upload().await?;
        print_success(&format!("Uploaded {} ({})", filename, format_size(size)));
        return Ok(());
    }

    let progress = wait_for_close(events).await?;
    match progress {
        Some(p) if p.is_complete() => {
            print_success(&format!("Uploaded {} ({})", filename, format_size(size)));
            Ok(())
        }
        Some(p) => Err(VmError::Io(format!(
            "upload stopped at {} of {}",
            format_size(p.already_uploaded_bytes),
            format_size(p.size)
        ))),
        None => Err(VmError::Io("upload ended without progress".to_string())),
    }
}

/// Stream `file` from `offset` to its end. Returns the bytes sent.
async fn send_from(client: &PeerClient, file: &mut File, offset: u64) -> VmResult<u64> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut sent = 0u64;
    loop {
        let mut buf = vec![0u8; CHUNK_LEN];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        buf.truncate(n);
        client.send_upload(buf).await?;
        sent += n as u64;
    }
    debug!("sent {} upload bytes from offset {}", sent, offset);
    Ok(sent)
}

/// Report progress until the daemon closes the upload channel. Returns the
/// last progress seen.
async fn wait_for_close(events: &mut mpsc::UnboundedReceiver<UploadEvent>) -> VmResult<Option<UploadProgress>> {
    let mut last = None;
    loop {
        match events.recv().await {
            Some(UploadEvent::Progress(p)) => {
                println!(
                    "{} / {}",
                    format_size(p.already_uploaded_bytes),
                    format_size(p.size)
                );
                last = Some(p);
            }
            Some(UploadEvent::Closed) => return Ok(last),
            None => return Err(VmError::Disconnected),
        }
    }
}
