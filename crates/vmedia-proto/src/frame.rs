//! Framed peer transport.
//!
//! A peer connection carries several logical channels over one ordered,
//! reliable byte stream. Every message is one frame:
//!
//! ```text
//! [u8 channel][u8 kind][u32 length (big-endian)][payload]
//! ```
//!
//! `Open`/`Close` frames signal that the peer opened or closed the named
//! channel. They carry no payload, except that `Open` on the upload channel
//! carries the upload id returned by `startStorageFileUpload`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{DISK_CHANNEL_LABEL, MAX_FRAME_LEN, RPC_CHANNEL_LABEL, UPLOAD_CHANNEL_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Rpc,
    Disk,
    Upload,
}

impl Channel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Rpc => RPC_CHANNEL_LABEL,
            Self::Disk => DISK_CHANNEL_LABEL,
            Self::Upload => UPLOAD_CHANNEL_LABEL,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Rpc),
            1 => Some(Self::Disk),
            2 => Some(Self::Upload),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Rpc => 0,
            Self::Disk => 1,
            Self::Upload => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Open,
    Close,
}

impl MessageKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Text),
            1 => Some(Self::Binary),
            2 => Some(Self::Open),
            3 => Some(Self::Close),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
            Self::Open => 2,
            Self::Close => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            channel,
            kind: MessageKind::Text,
            payload: text.into().into_bytes(),
        }
    }

    pub fn binary(channel: Channel, payload: Vec<u8>) -> Self {
        Self {
            channel,
            kind: MessageKind::Binary,
            payload,
        }
    }

    pub fn open(channel: Channel) -> Self {
        Self {
            channel,
            kind: MessageKind::Open,
            payload: Vec::new(),
        }
    }

    /// Open the upload channel for the upload `id`.
    pub fn open_upload(id: &str) -> Self {
        Self {
            channel: Channel::Upload,
            kind: MessageKind::Open,
            payload: id.as_bytes().to_vec(),
        }
    }

    pub fn close(channel: Channel) -> Self {
        Self {
            channel,
            kind: MessageKind::Close,
            payload: Vec::new(),
        }
    }
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let channel = match reader.read_u8().await {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let kind = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;

    let channel = Channel::from_u8(channel).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown channel: {}", channel),
        )
    })?;
    let kind = MessageKind::from_u8(kind).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown message kind: {}", kind),
        )
    })?;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {}", len),
        ));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Some(Frame {
        channel,
        kind,
        payload,
    }))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    if frame.payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {}", frame.payload.len()),
        ));
    }
    let mut head = [0u8; 6];
    head[0] = frame.channel.to_u8();
    head[1] = frame.kind.to_u8();
    head[2..].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    writer.write_all(&head).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}
