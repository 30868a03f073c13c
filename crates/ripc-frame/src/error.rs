/// Errors that can occur during wire encoding/decoding.
///
/// Decode errors are never retried by the codec: the caller treats them as
/// protocol errors, terminal for that connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The message header declares a length below the framing minimum.
    #[error("invalid message header (length {len}, minimum {min})")]
    InvalidHeader { len: usize, min: usize },

    /// The connection version in a ConnectRequest is not a known constant.
    #[error("unsupported connection version 0x{0:04x}")]
    UnsupportedConnectionVersion(u32),

    /// The ipc version in a ConnectAck is not a known constant.
    #[error("unsupported ipc version {0}")]
    UnsupportedIpcVersion(u32),

    /// The protocol type byte does not name a known protocol.
    #[error("unsupported protocol type {0}")]
    UnsupportedProtocolType(u8),

    /// The compression identifier does not name a known algorithm.
    #[error("unknown compression type {0}")]
    UnknownCompression(u16),

    /// A frame was structurally invalid.
    #[error("malformed {frame} frame: {reason}")]
    Malformed {
        frame: &'static str,
        reason: &'static str,
    },

    /// The payload exceeds what the framing can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
