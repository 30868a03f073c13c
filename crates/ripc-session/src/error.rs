use std::time::Duration;

/// Errors that can occur in channel and multiplexer operations.
///
/// Everything here is terminal for the channel it concerns: transient
/// conditions (would-block, partial writes, buffer pressure before the
/// retry) are expressed as status codes on the operations themselves, never
/// as errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] ripc_transport::TransportError),

    /// Wire-level protocol violation.
    #[error("frame error: {0}")]
    Frame(#[from] ripc_frame::FrameError),

    /// The remote refused the connection with a ConnectNak.
    #[error("connection refused by peer: {0}")]
    HandshakeRejected(String),

    /// The client-side version fallback sequence is exhausted.
    #[error("handshake failed: {0}")]
    NoSupportedProtocol(String),

    /// No inbound traffic within the negotiated ping timeout.
    #[error("ping timeout: no message received for {elapsed:?}")]
    PingTimeout { elapsed: Duration },

    /// The output buffer pool is exhausted, even after a flush-and-retry.
    #[error("no output buffers available")]
    NoBuffers,

    /// The connection dropped or failed mid-operation.
    #[error("channel down: {0}")]
    ChannelDown(String),

    /// The operation is not valid in the channel's current state.
    #[error("invalid channel state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, SessionError>;
