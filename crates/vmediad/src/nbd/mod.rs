//! NBD (Network Block Device) export server and kernel client.
//!
//! The daemon exports the mounted image over a local socket and attaches
//! the kernel NBD driver to the other end, so the USB gadget can point at
//! a plain block device node.
//!
//! The server implements the NBD fixed newstyle negotiation protocol:
//! - Handshake with FIXED_NEWSTYLE + NO_ZEROES flags
//! - Option negotiation: LIST, INFO, GO, EXPORT_NAME, ABORT
//! - Transmission commands: READ, WRITE, DISC, FLUSH, TRIM
//!
//! Wire format reference: <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

pub mod client;
pub mod kernel;

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use vmedia_proto::constants::*;
use vmedia_proto::error::{VmError, VmResult};

/// Block storage the server exports.
#[async_trait]
pub trait ExportBackend: Send + Sync {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> VmResult<usize>;
    async fn write_at(&self, buf: &[u8], offset: u64) -> VmResult<usize>;
    async fn size(&self) -> VmResult<u64>;
    async fn sync(&self) -> VmResult<()>;
}

/// What the server advertises for its single export.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub name: String,
    pub description: String,
    pub read_only: bool,
    pub min_block_size: u32,
    pub preferred_block_size: u32,
    pub max_block_size: u32,
    pub multi_conn: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            name: EXPORT_NAME.to_string(),
            description: "Virtual media".to_string(),
            read_only: true,
            min_block_size: EXPORT_MIN_BLOCK_SIZE,
            preferred_block_size: EXPORT_PREFERRED_BLOCK_SIZE,
            max_block_size: EXPORT_MAX_BLOCK_SIZE,
            multi_conn: false,
        }
    }
}

impl ExportOptions {
    /// Get the transmission flags we advertise.
    fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        if self.multi_conn {
            flags |= NBD_FLAG_CAN_MULTI_CONN;
        }
        flags
    }

    /// An empty name selects the default export.
    fn matches(&self, name: &str) -> bool {
        name.is_empty() || name == self.name
    }
}

// ─── Per-Client Handler ─────────────────────────────────────────────────────

/// Serve one client connection from handshake through transmission.
///
/// Returns when the client disconnects, aborts negotiation or the stream
/// fails.
pub async fn serve<S>(
    stream: &mut S,
    options: &ExportOptions,
    backend: &dyn ExportBackend,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Phase 1: Fixed newstyle handshake
    let no_zeroes = handshake(stream).await?;

    // Phase 2: Option negotiation
    let size = match negotiate_options(stream, options, backend, no_zeroes).await? {
        Some(size) => size,
        None => return Ok(()),
    };
    debug!("NBD export '{}' (size={}) active", options.name, size);

    // Phase 3: Transmission
    transmission_loop(stream, options, backend).await
}

// ─── Phase 1: Handshake ─────────────────────────────────────────────────────

/// Send the fixed newstyle server greeting. Returns whether NO_ZEROES was negotiated.
async fn handshake<S>(stream: &mut S) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_flags: u16 = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
    stream.write_u64(NBDMAGIC).await?;
    stream.write_u64(IHAVEOPT).await?;
    stream.write_u16(server_flags).await?;
    stream.flush().await?;

    let client_flags = stream.read_u32().await?;
    if client_flags & NBD_FLAG_C_FIXED_NEWSTYLE == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client does not support fixed newstyle",
        ));
    }

    let no_zeroes = client_flags & NBD_FLAG_C_NO_ZEROES != 0;
    debug!("NBD handshake complete: no_zeroes={}", no_zeroes);
    Ok(no_zeroes)
}

// ─── Phase 2: Option Negotiation ────────────────────────────────────────────

/// Negotiate options until the client selects the export or aborts.
/// Returns the export size once selected, `None` on abort.
async fn negotiate_options<S>(
    stream: &mut S,
    options: &ExportOptions,
    backend: &dyn ExportBackend,
    no_zeroes: bool,
) -> io::Result<Option<u64>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let magic = stream.read_u64().await?;
        if magic != IHAVEOPT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad option magic: {:#x}", magic),
            ));
        }

        let option = stream.read_u32().await?;
        let data_len = stream.read_u32().await? as usize;
        if data_len > NBD_MAX_EXPORT_NAME_LEN + 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("option data too large: {}", data_len),
            ));
        }
        let mut data = vec![0u8; data_len];
        if data_len > 0 {
            stream.read_exact(&mut data).await?;
        }

        match option {
            NBD_OPT_EXPORT_NAME => {
                let name = String::from_utf8_lossy(&data).to_string();
                debug!("NBD_OPT_EXPORT_NAME: '{}'", name);

                let size = match resolve_export(options, backend, &name).await {
                    Ok(size) => size,
                    // For EXPORT_NAME, the only error path is to close the connection
                    Err(e) => {
                        return Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("export '{}' unavailable: {}", name, e),
                        ))
                    }
                };
                stream.write_u64(size).await?;
                stream.write_u16(options.transmission_flags()).await?;
                if !no_zeroes {
                    stream.write_all(&[0u8; 124]).await?;
                }
                stream.flush().await?;
                return Ok(Some(size));
            }

            NBD_OPT_GO | NBD_OPT_INFO => {
                let is_go = option == NBD_OPT_GO;
                let label = if is_go { "GO" } else { "INFO" };

                // u32 name_len + name + u16 nr_info_requests + info_request_types
                if data.len() < 6 {
                    send_opt_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                    continue;
                }
                let name_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                if 4 + name_len + 2 > data.len() {
                    send_opt_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                    continue;
                }
                let name = String::from_utf8_lossy(&data[4..4 + name_len]).to_string();
                debug!("NBD_OPT_{}: '{}'", label, name);

                let size = match resolve_export(options, backend, &name).await {
                    Ok(size) => size,
                    Err(e) => {
                        let msg = format!("export '{}' unavailable: {}", name, e);
                        send_opt_reply(stream, option, NBD_REP_ERR_UNKNOWN, msg.as_bytes())
                            .await?;
                        continue;
                    }
                };

                let mut info_data = Vec::with_capacity(12);
                info_data.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                info_data.extend_from_slice(&size.to_be_bytes());
                info_data.extend_from_slice(&options.transmission_flags().to_be_bytes());
                send_opt_reply(stream, option, NBD_REP_INFO, &info_data).await?;

                if !options.description.is_empty() {
                    let mut desc = Vec::with_capacity(2 + options.description.len());
                    desc.extend_from_slice(&NBD_INFO_DESCRIPTION.to_be_bytes());
                    desc.extend_from_slice(options.description.as_bytes());
                    send_opt_reply(stream, option, NBD_REP_INFO, &desc).await?;
                }

                let mut bs_data = Vec::with_capacity(14);
                bs_data.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
                bs_data.extend_from_slice(&options.min_block_size.to_be_bytes());
                bs_data.extend_from_slice(&options.preferred_block_size.to_be_bytes());
                bs_data.extend_from_slice(&options.max_block_size.to_be_bytes());
                send_opt_reply(stream, option, NBD_REP_INFO, &bs_data).await?;

                send_opt_reply(stream, option, NBD_REP_ACK, &[]).await?;

                if is_go {
                    return Ok(Some(size));
                }
            }

            NBD_OPT_LIST => {
                debug!("NBD_OPT_LIST");
                let mut entry = Vec::with_capacity(4 + options.name.len());
                entry.extend_from_slice(&(options.name.len() as u32).to_be_bytes());
                entry.extend_from_slice(options.name.as_bytes());
                send_opt_reply(stream, option, NBD_REP_SERVER, &entry).await?;
                send_opt_reply(stream, option, NBD_REP_ACK, &[]).await?;
            }

            NBD_OPT_ABORT => {
                debug!("NBD_OPT_ABORT");
                send_opt_reply(stream, option, NBD_REP_ACK, &[]).await?;
                return Ok(None);
            }

            _ => {
                debug!("unsupported NBD option: {}", option);
                send_opt_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
            }
        }
    }
}

/// Resolve an export name to the size of the mounted image.
async fn resolve_export(
    options: &ExportOptions,
    backend: &dyn ExportBackend,
    name: &str,
) -> VmResult<u64> {
    if !options.matches(name) {
        warn!("resolve_export: unknown export '{}'", name);
        return Err(VmError::Protocol(format!("unknown export '{}'", name)));
    }
    backend.size().await
}

/// Send an option reply.
async fn send_opt_reply<S>(stream: &mut S, option: u32, reply_type: u32, data: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u64(NBD_OPT_REPLY_MAGIC).await?;
    stream.write_u32(option).await?;
    stream.write_u32(reply_type).await?;
    stream.write_u32(data.len() as u32).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await
}

// ─── Phase 3: Transmission ──────────────────────────────────────────────────

/// Main I/O loop: read NBD requests, dispatch to the backend, send replies.
async fn transmission_loop<S>(
    stream: &mut S,
    options: &ExportOptions,
    backend: &dyn ExportBackend,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        // Request header (28 bytes)
        let magic = stream.read_u32().await?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad request magic: {:#x}", magic),
            ));
        }

        let _cmd_flags = stream.read_u16().await?;
        let cmd_type = stream.read_u16().await?;
        let cookie = stream.read_u64().await?;
        let offset = stream.read_u64().await?;
        let length = stream.read_u32().await?;

        match cmd_type {
            NBD_CMD_READ => {
                if length > NBD_MAX_PAYLOAD {
                    send_simple_reply(stream, cookie, NBD_EINVAL, None).await?;
                    continue;
                }
                let mut buf = vec![0u8; length as usize];
                match backend.read_at(&mut buf, offset).await {
                    // Short reads past the image end are zero-filled
                    Ok(_) => send_simple_reply(stream, cookie, NBD_OK, Some(&buf)).await?,
                    Err(e) => {
                        warn!("NBD read at {} ({} bytes) failed: {}", offset, length, e);
                        // No payload follows an error reply
                        send_simple_reply(stream, cookie, e.nbd_errno(), None).await?;
                    }
                }
            }

            NBD_CMD_WRITE => {
                if length > NBD_MAX_PAYLOAD {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "write payload too large",
                    ));
                }
                let mut payload = vec![0u8; length as usize];
                stream.read_exact(&mut payload).await?;

                let err_code = if options.read_only {
                    NBD_EPERM
                } else {
                    match backend.write_at(&payload, offset).await {
                        Ok(_) => NBD_OK,
                        Err(e) => e.nbd_errno(),
                    }
                };
                send_simple_reply(stream, cookie, err_code, None).await?;
            }

            NBD_CMD_DISC => {
                debug!("NBD disconnect");
                // No reply for DISC
                return Ok(());
            }

            NBD_CMD_FLUSH => {
                let err_code = match backend.sync().await {
                    Ok(()) => NBD_OK,
                    Err(e) => e.nbd_errno(),
                };
                send_simple_reply(stream, cookie, err_code, None).await?;
            }

            NBD_CMD_TRIM => {
                send_simple_reply(stream, cookie, NBD_EPERM, None).await?;
            }

            _ => {
                warn!("unsupported NBD command: {}", cmd_type);
                send_simple_reply(stream, cookie, NBD_ENOTSUP, None).await?;
            }
        }
    }
}

/// Send a simple reply.
async fn send_simple_reply<S>(
    stream: &mut S,
    cookie: u64,
    error: u32,
    data: Option<&[u8]>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_u32(NBD_SIMPLE_REPLY_MAGIC).await?;
    stream.write_u32(error).await?;
    stream.write_u64(cookie).await?;
    if let Some(d) = data {
        stream.write_all(d).await?;
    }
    stream.flush().await
}
