//! RIPC wire codec.
//!
//! Byte-exact serialization and parsing for the RIPC session protocol:
//! - the three handshake frame kinds (ConnectRequest, ConnectAck,
//!   ConnectNak) plus the version-14 ClientKey leg
//! - the data-message header, heartbeat frame and fragmentation headers
//! - the logical-version ↔ wire-constant lookup tables driving negotiation
//!
//! All multi-byte integers are big-endian. Frames are transient values:
//! constructed, encoded or parsed, then discarded.

pub mod error;
pub mod handshake;
pub mod message;
pub mod version;

pub use error::{FrameError, Result};
pub use handshake::{
    decode_client_key, decode_connect_reply, decode_connect_request, encode_client_key,
    encode_connect_ack, encode_connect_nak, encode_connect_request, ClientKey, ConnectAck,
    ConnectNak, ConnectReply, ConnectRequest, KeyExchange, ACK_FIXED_HEADER, MAX_COMPONENT_LEN,
    NAK_FIXED_HEADER,
};
pub use message::{
    decode_message, encode_fragment, encode_fragment_header, encode_message, encode_ping,
    RipcMessage, HEADER_SIZE, PACKED_HEADER_SIZE,
};
pub use version::{CompressionType, ProtocolType, RipcVersion};
