//! Logical protocol versions and their wire-constant lookup tables.
//!
//! Every logical version has two *distinct* integer encodings: the
//! "connection version" sent in a ConnectRequest and the "ipc version"
//! echoed in a ConnectAck. The two numberings come from the authoritative
//! protocol reference and must never be confused or assumed equal.

use crate::error::{FrameError, Result};

/// A supported logical RIPC version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RipcVersion {
    V11,
    V12,
    V13,
    V14,
}

impl RipcVersion {
    /// The highest version this library speaks; client negotiation starts here.
    pub const CURRENT: RipcVersion = RipcVersion::V14;

    /// All supported versions, descending — the client fallback order.
    pub const ALL_DESCENDING: [RipcVersion; 4] = [
        RipcVersion::V14,
        RipcVersion::V13,
        RipcVersion::V12,
        RipcVersion::V11,
    ];

    /// The logical version number (11–14).
    pub fn number(self) -> u8 {
        match self {
            RipcVersion::V11 => 11,
            RipcVersion::V12 => 12,
            RipcVersion::V13 => 13,
            RipcVersion::V14 => 14,
        }
    }

    /// The 4-byte "connection version" constant carried in a ConnectRequest.
    pub fn connection_version(self) -> u32 {
        match self {
            RipcVersion::V11 => 0x0015,
            RipcVersion::V12 => 0x0016,
            RipcVersion::V13 => 0x0017,
            RipcVersion::V14 => 0x0018,
        }
    }

    /// The 4-byte "ipc version" constant carried in a ConnectAck.
    ///
    /// Note this is a different numbering than [`connection_version`]
    /// (6–9 versus 0x0015–0x0018) for the same logical versions.
    ///
    /// [`connection_version`]: Self::connection_version
    pub fn ipc_version(self) -> u32 {
        match self {
            RipcVersion::V11 => 6,
            RipcVersion::V12 => 7,
            RipcVersion::V13 => 8,
            RipcVersion::V14 => 9,
        }
    }

    /// Resolve a ConnectRequest connection-version constant.
    pub fn from_connection_version(wire: u32) -> Result<Self> {
        match wire {
            0x0015 => Ok(RipcVersion::V11),
            0x0016 => Ok(RipcVersion::V12),
            0x0017 => Ok(RipcVersion::V13),
            0x0018 => Ok(RipcVersion::V14),
            other => Err(FrameError::UnsupportedConnectionVersion(other)),
        }
    }

    /// Resolve a ConnectAck ipc-version constant.
    pub fn from_ipc_version(wire: u32) -> Result<Self> {
        match wire {
            6 => Ok(RipcVersion::V11),
            7 => Ok(RipcVersion::V12),
            8 => Ok(RipcVersion::V13),
            9 => Ok(RipcVersion::V14),
            other => Err(FrameError::UnsupportedIpcVersion(other)),
        }
    }

    /// The next lower supported version, or `None` when exhausted.
    pub fn fallback(self) -> Option<Self> {
        match self {
            RipcVersion::V14 => Some(RipcVersion::V13),
            RipcVersion::V13 => Some(RipcVersion::V12),
            RipcVersion::V12 => Some(RipcVersion::V11),
            RipcVersion::V11 => None,
        }
    }

    /// Whether the ConnectRequest layout carries a protocol-type byte.
    ///
    /// Version 11 predates the field; it can only carry the default RWF
    /// protocol, so a caller requesting any other type must not fall back
    /// this far.
    pub fn has_protocol_type(self) -> bool {
        self >= RipcVersion::V12
    }

    /// Whether handshake frames carry the component-version container.
    pub fn has_component_info(self) -> bool {
        self >= RipcVersion::V13
    }

    /// Whether the handshake includes the key-exchange leg.
    pub fn has_key_exchange(self) -> bool {
        self == RipcVersion::V14
    }

    /// Whether this version can represent the given protocol type.
    pub fn supports_protocol_type(self, protocol_type: ProtocolType) -> bool {
        self.has_protocol_type() || protocol_type == ProtocolType::Rwf
    }
}

impl std::fmt::Display for RipcVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Application payload protocol carried over the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolType {
    /// RWF, the default market-data wire format.
    #[default]
    Rwf,
    /// JSON payloads.
    Json,
}

impl ProtocolType {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolType::Rwf => 0,
            ProtocolType::Json => 2,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ProtocolType::Rwf),
            2 => Ok(ProtocolType::Json),
            other => Err(FrameError::UnsupportedProtocolType(other)),
        }
    }
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolType::Rwf => write!(f, "rwf"),
            ProtocolType::Json => write!(f, "json"),
        }
    }
}

/// Per-message compression negotiated during the handshake.
///
/// The codec only carries the identifier; applying the algorithm is the
/// payload layer's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Zlib,
    Lz4,
}

impl CompressionType {
    pub fn as_u16(self) -> u16 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zlib => 1,
            CompressionType::Lz4 => 2,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zlib),
            2 => Ok(CompressionType::Lz4),
            other => Err(FrameError::UnknownCompression(other)),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionType::None => write!(f, "none"),
            CompressionType::Zlib => write!(f, "zlib"),
            CompressionType::Lz4 => write!(f, "lz4"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_ipc_constants_are_distinct_numberings() {
        for v in RipcVersion::ALL_DESCENDING {
            assert_ne!(v.connection_version(), v.ipc_version());
            assert_eq!(RipcVersion::from_connection_version(v.connection_version()).unwrap(), v);
            assert_eq!(RipcVersion::from_ipc_version(v.ipc_version()).unwrap(), v);
        }
    }

    #[test]
    fn unknown_wire_constants_rejected() {
        assert!(matches!(
            RipcVersion::from_connection_version(0x0042),
            Err(FrameError::UnsupportedConnectionVersion(0x0042))
        ));
        assert!(matches!(
            RipcVersion::from_ipc_version(42),
            Err(FrameError::UnsupportedIpcVersion(42))
        ));
    }

    #[test]
    fn fallback_walks_descending_and_terminates() {
        let mut v = RipcVersion::CURRENT;
        let mut seen = vec![v];
        while let Some(next) = v.fallback() {
            seen.push(next);
            v = next;
        }
        assert_eq!(seen, RipcVersion::ALL_DESCENDING.to_vec());
    }

    #[test]
    fn version_11_only_speaks_rwf() {
        assert!(RipcVersion::V11.supports_protocol_type(ProtocolType::Rwf));
        assert!(!RipcVersion::V11.supports_protocol_type(ProtocolType::Json));
        assert!(RipcVersion::V12.supports_protocol_type(ProtocolType::Json));
    }

    #[test]
    fn feature_gates_match_versions() {
        assert!(!RipcVersion::V12.has_component_info());
        assert!(RipcVersion::V13.has_component_info());
        assert!(!RipcVersion::V13.has_key_exchange());
        assert!(RipcVersion::V14.has_key_exchange());
        assert!(!RipcVersion::V11.has_protocol_type());
    }

    #[test]
    fn protocol_and_compression_roundtrip() {
        for pt in [ProtocolType::Rwf, ProtocolType::Json] {
            assert_eq!(ProtocolType::from_u8(pt.as_u8()).unwrap(), pt);
        }
        for ct in [CompressionType::None, CompressionType::Zlib, CompressionType::Lz4] {
            assert_eq!(CompressionType::from_u16(ct.as_u16()).unwrap(), ct);
        }
        assert!(ProtocolType::from_u8(7).is_err());
        assert!(CompressionType::from_u16(9).is_err());
    }
}
