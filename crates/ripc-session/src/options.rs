//! Connection and bind configuration.
//!
//! Options are supplied once and are immutable after connect/bind; the
//! channel copies what it needs during negotiation.

use std::net::SocketAddr;
use std::time::Duration;

use ripc_frame::{CompressionType, ProtocolType};

/// Default ping timeout advertised in a ConnectRequest, seconds.
pub const DEFAULT_PING_TIMEOUT: u8 = 60;

/// Smallest ping timeout a server accepts by default, seconds.
pub const DEFAULT_MIN_PING_TIMEOUT: u8 = 20;

/// Default maximum user message size a server advertises.
pub const DEFAULT_MAX_USER_MSG_SIZE: u16 = 6144;

/// Default guaranteed output buffers for a point-to-point socket channel.
pub const SOCKET_GUARANTEED_OUTPUT_BUFFERS: usize = 50;

/// Default guaranteed output buffers for the sequenced-multicast variant.
pub const MULTICAST_GUARANTEED_OUTPUT_BUFFERS: usize = 16;

/// Transport flavor of a channel. Multicast differs only in defaults here;
/// sequencing semantics live outside this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionKind {
    #[default]
    Socket,
    SeqMulticast,
}

/// Client-side connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub address: SocketAddr,
    pub kind: ConnectionKind,
    pub protocol_type: ProtocolType,
    /// Compression the client is willing to use; the server decides.
    pub compression: CompressionType,
    /// Ping timeout the client proposes, seconds.
    pub ping_timeout: u8,
    /// Application-protocol version (not the wire version).
    pub major_version: u8,
    pub minor_version: u8,
    /// Extra identification appended to the library's own component string.
    pub component_version: Option<String>,
    /// Explicit guaranteed output buffer count; defaults per [`ConnectionKind`].
    pub guaranteed_output_buffers: Option<usize>,
    /// Drive the handshake internally until Active before returning.
    pub blocking: bool,
    /// Give-up deadline for blocking mode.
    pub blocking_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            kind: ConnectionKind::Socket,
            protocol_type: ProtocolType::Rwf,
            compression: CompressionType::None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            major_version: 14,
            minor_version: 1,
            component_version: None,
            guaranteed_output_buffers: None,
            blocking: false,
            blocking_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_protocol_type(mut self, protocol_type: ProtocolType) -> Self {
        self.protocol_type = protocol_type;
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_ping_timeout(mut self, seconds: u8) -> Self {
        self.ping_timeout = seconds;
        self
    }

    pub fn with_component_version(mut self, text: impl Into<String>) -> Self {
        self.component_version = Some(text.into());
        self
    }

    pub fn with_guaranteed_output_buffers(mut self, count: usize) -> Self {
        self.guaranteed_output_buffers = Some(count);
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// The guaranteed buffer count in effect: explicit, or the kind default.
    pub fn effective_guaranteed_buffers(&self) -> usize {
        self.guaranteed_output_buffers.unwrap_or(match self.kind {
            ConnectionKind::Socket => SOCKET_GUARANTEED_OUTPUT_BUFFERS,
            ConnectionKind::SeqMulticast => MULTICAST_GUARANTEED_OUTPUT_BUFFERS,
        })
    }
}

/// Server-side bind configuration.
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub address: SocketAddr,
    pub protocol_type: ProtocolType,
    /// Largest ping timeout granted to a client, seconds. Also the value
    /// advertised when the client asks for more.
    pub ping_timeout: u8,
    /// Smallest ping timeout granted to a client, seconds.
    pub min_ping_timeout: u8,
    pub max_user_msg_size: u16,
    /// Compression algorithms this server will accept from clients.
    pub supported_compression: Vec<CompressionType>,
    /// Level applied when a compressed session is negotiated.
    pub compression_level: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub component_version: Option<String>,
    pub guaranteed_output_buffers: usize,
}

impl BindOptions {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            protocol_type: ProtocolType::Rwf,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            min_ping_timeout: DEFAULT_MIN_PING_TIMEOUT,
            max_user_msg_size: DEFAULT_MAX_USER_MSG_SIZE,
            supported_compression: vec![CompressionType::None],
            compression_level: 0,
            major_version: 14,
            minor_version: 1,
            component_version: None,
            guaranteed_output_buffers: SOCKET_GUARANTEED_OUTPUT_BUFFERS,
        }
    }

    pub fn with_protocol_type(mut self, protocol_type: ProtocolType) -> Self {
        self.protocol_type = protocol_type;
        self
    }

    pub fn with_ping_timeout_range(mut self, min: u8, max: u8) -> Self {
        self.min_ping_timeout = min;
        self.ping_timeout = max;
        self
    }

    pub fn with_max_user_msg_size(mut self, size: u16) -> Self {
        self.max_user_msg_size = size;
        self
    }

    pub fn with_supported_compression(
        mut self,
        types: Vec<CompressionType>,
        level: u8,
    ) -> Self {
        self.supported_compression = types;
        self.compression_level = level;
        self
    }

    pub fn with_component_version(mut self, text: impl Into<String>) -> Self {
        self.component_version = Some(text.into());
        self
    }

    /// Clamp a client-proposed ping timeout into this server's range.
    pub fn clamp_ping_timeout(&self, requested: u8) -> u8 {
        requested.clamp(self.min_ping_timeout, self.ping_timeout)
    }
}
