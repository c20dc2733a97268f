//! # vmedia-proto
//!
//! Protocol types, constants, and data structures for the virtual media
//! control plane of the KVM appliance.
//!
//! This crate defines the NBD wire constants, the remote-read messages
//! exchanged with a peer that holds an image, the JSON-RPC envelope, the
//! framed peer-transport codec and the error type shared by `vmediad`
//! and `vmctl`.

pub mod constants;
pub mod defaults;
pub mod error;
pub mod frame;
pub mod media;
pub mod rpc;

// Re-export commonly used types at the crate root
pub use error::{VmError, VmResult};
pub use frame::{Channel, Frame, MessageKind};
pub use media::{
    ChunkHeader, DiskReadRequest, VirtualMediaMode, VirtualMediaSource, VirtualMediaState,
};
