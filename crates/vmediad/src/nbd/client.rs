//! Client half of the block bridge.
//!
//! Negotiation runs in userspace over the async stream; once the export is
//! selected the socket is handed to the kernel driver, which then owns the
//! transmission phase until it is disconnected.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmedia_proto::constants::*;
use vmedia_proto::error::{VmError, VmResult};

use super::kernel::NbdDevice;

/// Export parameters learned during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub size: u64,
    pub flags: u16,
    /// (minimum, preferred, maximum) if the server sent them.
    pub block_sizes: Option<(u32, u32, u32)>,
}

/// Run fixed newstyle negotiation and select `name` with NBD_OPT_GO.
pub async fn negotiate<S>(stream: &mut S, name: &str) -> VmResult<ExportInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if stream.read_u64().await? != NBDMAGIC {
        return Err(VmError::Protocol("bad server magic".into()));
    }
    if stream.read_u64().await? != IHAVEOPT {
        return Err(VmError::Protocol("server is not newstyle".into()));
    }
    let server_flags = stream.read_u16().await?;
    if server_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(VmError::Protocol("server is not fixed newstyle".into()));
    }
    let mut client_flags = NBD_FLAG_C_FIXED_NEWSTYLE;
    if server_flags & NBD_FLAG_NO_ZEROES != 0 {
        client_flags |= NBD_FLAG_C_NO_ZEROES;
    }
    stream.write_u32(client_flags).await?;

    // NBD_OPT_GO: name, then one info request for block sizes
    let mut data = Vec::with_capacity(4 + name.len() + 4);
    data.extend_from_slice(&(name.len() as u32).to_be_bytes());
    data.extend_from_slice(name.as_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
    stream.write_u64(IHAVEOPT).await?;
    stream.write_u32(NBD_OPT_GO).await?;
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(&data).await?;
    stream.flush().await?;

    let mut size = None;
    let mut flags = 0;
    let mut block_sizes = None;
    loop {
        if stream.read_u64().await? != NBD_OPT_REPLY_MAGIC {
            return Err(VmError::Protocol("bad option reply magic".into()));
        }
        let option = stream.read_u32().await?;
        let reply_type = stream.read_u32().await?;
        let len = stream.read_u32().await? as usize;
        if option != NBD_OPT_GO {
            return Err(VmError::Protocol(format!("reply for unexpected option {}", option)));
        }
        if len > NBD_MAX_EXPORT_NAME_LEN + 64 {
            return Err(VmError::Protocol(format!("option reply too large: {}", len)));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        if reply_type & NBD_REP_FLAG_ERROR != 0 {
            return Err(VmError::Protocol(format!(
                "export '{}' refused ({:#x}): {}",
                name,
                reply_type,
                String::from_utf8_lossy(&payload)
            )));
        }

        match reply_type {
            NBD_REP_ACK => break,
            NBD_REP_INFO if payload.len() >= 2 => {
                let info_type = u16::from_be_bytes([payload[0], payload[1]]);
                match info_type {
                    NBD_INFO_EXPORT if payload.len() >= 12 => {
                        size = Some(u64::from_be_bytes(payload[2..10].try_into().unwrap_or_default()));
                        flags = u16::from_be_bytes([payload[10], payload[11]]);
                    }
                    NBD_INFO_BLOCK_SIZE if payload.len() >= 14 => {
                        let word = |i: usize| {
                            u32::from_be_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]])
                        };
                        block_sizes = Some((word(2), word(6), word(10)));
                    }
                    _ => debug!("ignoring NBD info type {}", info_type),
                }
            }
            _ => debug!("ignoring NBD reply type {:#x}", reply_type),
        }
    }

    let size = size.ok_or_else(|| VmError::Protocol("server sent no export info".into()))?;
    Ok(ExportInfo {
        size,
        flags,
        block_sizes,
    })
}

/// Negotiate over `stream`, then attach it to `device`.
///
/// The returned task runs NBD_DO_IT on a blocking thread and completes when
/// the device is disconnected.
pub async fn connect(
    mut stream: UnixStream,
    device: Arc<NbdDevice>,
    name: &str,
) -> VmResult<JoinHandle<VmResult<()>>> {
    let info = negotiate(&mut stream, name).await?;
    info!(
        "NBD export '{}' negotiated: size={}, flags={:#x}",
        name, info.size, info.flags
    );

    let std_stream = stream.into_std()?;
    std_stream.set_nonblocking(false)?;
    device.configure(std_stream.as_raw_fd(), info.size, KERNEL_BLOCK_SIZE, info.flags)?;

    let handle = tokio::task::spawn_blocking(move || {
        // The socket must outlive NBD_DO_IT
        let _sock = std_stream;
        let result = device.do_it();
        match &result {
            Ok(()) => debug!("{} detached", device.path().display()),
            Err(e) => warn!("{} attach ended: {}", device.path().display(), e),
        }
        result
    });
    Ok(handle)
}

/// Ask the kernel to tear the device down; best effort.
pub fn disconnect(device: &NbdDevice) {
    if let Err(e) = device.disconnect() {
        debug!("{} disconnect: {}", device.path().display(), e);
    }
}
