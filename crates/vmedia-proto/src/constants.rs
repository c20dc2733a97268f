/// Virtual media protocol and wire constants.

// ─── Export identity ────────────────────────────────────────────────────────

/// Export name shared by the server and client halves of the block bridge.
pub const EXPORT_NAME: &str = "jetkvm";

/// Smallest transfer block advertised by the export.
pub const EXPORT_MIN_BLOCK_SIZE: u32 = 1024;
/// Preferred transfer block advertised by the export.
pub const EXPORT_PREFERRED_BLOCK_SIZE: u32 = 4 * 1024;
/// Largest transfer block advertised by the export.
pub const EXPORT_MAX_BLOCK_SIZE: u32 = 16 * 1024;

/// Block size the kernel NBD device is configured with.
pub const KERNEL_BLOCK_SIZE: u32 = 4 * 1024;

// ─── Remote-read protocol ───────────────────────────────────────────────────

/// Length of the header that prefixes every binary chunk sent by the peer.
pub const CHUNK_HEADER_LEN: usize = 16;

/// Data channel label used for disk traffic.
pub const DISK_CHANNEL_LABEL: &str = "disk";
/// Data channel label used for JSON-RPC traffic.
pub const RPC_CHANNEL_LABEL: &str = "rpc";
/// Data channel label used for image uploads.
pub const UPLOAD_CHANNEL_LABEL: &str = "upload";

// ─── Uploads ────────────────────────────────────────────────────────────────

/// Prefix of every upload id handed out by `startStorageFileUpload`.
pub const UPLOAD_ID_PREFIX: &str = "upload_";
/// Suffix of an image that is still being uploaded.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Maximum size of a single peer transport frame (16 MB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ─── NBD protocol ───────────────────────────────────────────────────────────

/// Initial server magic: ASCII "NBDMAGIC"
pub const NBDMAGIC: u64 = 0x4e42444d41474943;
/// Fixed newstyle negotiation magic: ASCII "IHAVEOPT"
pub const IHAVEOPT: u64 = 0x49484156454f5054;
/// Server option reply magic
pub const NBD_OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;
/// Transmission request magic
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Simple reply magic
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Handshake flags (server → client, 16-bit)
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
pub const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Client flags (client → server, 32-bit)
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 0x0001;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 0x0002;

// Transmission flags (sent with export info, 16-bit)
pub const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
pub const NBD_FLAG_READ_ONLY: u16 = 0x0002;
pub const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 0x0100;

// Option types (32-bit)
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;

// Option reply types (32-bit)
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_FLAG_ERROR: u32 = 0x80000000;
pub const NBD_REP_ERR_UNSUP: u32 = 0x80000001;
pub const NBD_REP_ERR_INVALID: u32 = 0x80000003;
pub const NBD_REP_ERR_UNKNOWN: u32 = 0x80000006;

// Info types for NBD_OPT_INFO / NBD_OPT_GO replies
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

// Command types (16-bit)
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;

// Error codes (32-bit)
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Maximum export name length
pub const NBD_MAX_EXPORT_NAME_LEN: usize = 4096;

/// Maximum NBD request payload (32 MB)
pub const NBD_MAX_PAYLOAD: u32 = 32 * 1024 * 1024;
