//! Handshake frame codec.
//!
//! Encodes and parses the frames exchanged while a connection is
//! established: ConnectRequest (client → server), ConnectAck / ConnectNak
//! (server → client) and the version-14 ClientKey reply (client → server).
//!
//! Layouts are version-parameterized and byte-exact: `message length`
//! always equals the number of bytes on the wire, decode functions return
//! `Ok(None)` until a complete frame is buffered, and any structural
//! violation is a hard error — the codec never resynchronizes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::version::{CompressionType, ProtocolType, RipcVersion};

/// Fixed portion of a ConnectAck, from message length through compression
/// level. Key-exchange and component containers are counted in the message
/// length but not here.
pub const ACK_FIXED_HEADER: u8 = 19;

/// Fixed portion of a ConnectNak, from message length through text length.
pub const NAK_FIXED_HEADER: u8 = 8;

/// Maximum component-version bytes on the wire.
pub const MAX_COMPONENT_LEN: usize = 255;

const FLAG_REPLY: u8 = 0x01;
const EXT_ACK: u8 = 0x01;
const EXT_NAK: u8 = 0x02;
const EXT_KEY_EXCHANGE: u8 = 0x08;
const REQUEST_KEY_EXCHANGE_FLAG: u8 = 0x08;

/// Client connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: RipcVersion,
    pub compression: CompressionType,
    pub ping_timeout: u8,
    pub protocol_type: ProtocolType,
    pub major_version: u8,
    pub minor_version: u8,
    pub hostname: String,
    pub ip_address: String,
    /// Component identification text; only carried for versions ≥ 13.
    pub component_version: Option<String>,
}

/// Server acceptance reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    pub version: RipcVersion,
    pub max_user_msg_size: u16,
    pub ping_timeout: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub compression: CompressionType,
    pub compression_level: u8,
    /// Key material for the encrypted-session exchange; version 14 only.
    pub key_exchange: Option<KeyExchange>,
    pub component_version: Option<String>,
}

/// Key-exchange block inside a version-14 ConnectAck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    pub encryption_type: u8,
    pub key: Bytes,
}

/// Server refusal reply. Terminal for the connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectNak {
    pub text: String,
}

/// Client key reply finishing a version-14 handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey {
    pub key: Bytes,
}

/// The two possible server replies to a ConnectRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    Ack(ConnectAck),
    Nak(ConnectNak),
}

/// Encode a ConnectRequest for its version's wire layout.
pub fn encode_connect_request(req: &ConnectRequest, dst: &mut BytesMut) -> Result<()> {
    let host = clamp(req.hostname.as_bytes(), MAX_COMPONENT_LEN);
    let ip = clamp(req.ip_address.as_bytes(), MAX_COMPONENT_LEN);
    let compression_len: usize = if req.compression == CompressionType::None {
        1
    } else {
        2
    };
    let protocol_len: usize = if req.version.has_protocol_type() { 1 } else { 0 };

    // msg len + flags + connection version + header flags + header len
    // + compression + ping + session flags + protocol + major/minor
    // + hostname + ip address
    let header_len = 2 + 1 + 4 + 1 + 1
        + compression_len
        + 1
        + 1
        + protocol_len
        + 2
        + 1
        + host.len()
        + 1
        + ip.len();
    if header_len > u8::MAX as usize {
        return Err(FrameError::Malformed {
            frame: "ConnectRequest",
            reason: "header exceeds 255 bytes",
        });
    }

    let component = if req.version.has_component_info() {
        Some(clamp(
            req.component_version.as_deref().unwrap_or("").as_bytes(),
            MAX_COMPONENT_LEN,
        ))
    } else {
        None
    };
    let message_len = header_len + component.map_or(0, |c| c.len() + 2);

    dst.reserve(message_len);
    dst.put_u16(message_len as u16);
    dst.put_u8(0x00);
    dst.put_u32(req.version.connection_version());
    dst.put_u8(if req.version.has_key_exchange() {
        REQUEST_KEY_EXCHANGE_FLAG
    } else {
        0x00
    });
    dst.put_u8(header_len as u8);
    if req.compression == CompressionType::None {
        dst.put_u8(0x00);
    } else {
        dst.put_u8(0x01);
        dst.put_u8(req.compression.as_u16() as u8);
    }
    dst.put_u8(req.ping_timeout);
    dst.put_u8(0x00); // session flags
    if req.version.has_protocol_type() {
        dst.put_u8(req.protocol_type.as_u8());
    }
    dst.put_u8(req.major_version);
    dst.put_u8(req.minor_version);
    dst.put_u8(host.len() as u8);
    dst.put_slice(host);
    dst.put_u8(ip.len() as u8);
    dst.put_slice(ip);
    if let Some(component) = component {
        dst.put_u8(component.len() as u8 + 1);
        dst.put_u8(component.len() as u8);
        dst.put_slice(component);
    }
    Ok(())
}

/// Parse a ConnectRequest, consuming it from `src`.
///
/// Returns `Ok(None)` until a complete frame is buffered. The version is
/// taken from the connection-version constant; an unknown constant is the
/// caller's cue to refuse the connection.
pub fn decode_connect_request(src: &mut BytesMut) -> Result<Option<ConnectRequest>> {
    let Some(frame) = take_frame(src, "ConnectRequest")? else {
        return Ok(None);
    };
    let mut cur = Cursor::new(&frame, "ConnectRequest");
    cur.skip(2)?; // message length, already validated by take_frame
    cur.u8()?; // flags
    let version = RipcVersion::from_connection_version(cur.u32()?)?;
    cur.u8()?; // header flags
    let header_len = cur.u8()? as usize;

    let compression = match cur.u8()? {
        0 => CompressionType::None,
        bitmap_len => {
            let bitmap = cur.bytes(bitmap_len as usize)?;
            CompressionType::from_u16(bitmap[0] as u16)?
        }
    };
    let ping_timeout = cur.u8()?;
    cur.u8()?; // session flags
    let protocol_type = if version.has_protocol_type() {
        ProtocolType::from_u8(cur.u8()?)?
    } else {
        ProtocolType::Rwf
    };
    let major_version = cur.u8()?;
    let minor_version = cur.u8()?;
    let hostname = cur.short_string()?;
    let ip_address = cur.short_string()?;

    if cur.consumed() != header_len {
        return Err(FrameError::Malformed {
            frame: "ConnectRequest",
            reason: "header length does not match fields consumed",
        });
    }

    let component_version = if version.has_component_info() {
        let container_len = cur.u8()? as usize;
        if container_len > 0 {
            Some(cur.short_string()?)
        } else {
            Some(String::new())
        }
    } else {
        None
    };
    cur.finish()?;

    Ok(Some(ConnectRequest {
        version,
        compression,
        ping_timeout,
        protocol_type,
        major_version,
        minor_version,
        hostname,
        ip_address,
        component_version,
    }))
}

/// Encode a ConnectAck for its version's wire layout.
pub fn encode_connect_ack(ack: &ConnectAck, dst: &mut BytesMut) -> Result<()> {
    if ack.key_exchange.is_some() != ack.version.has_key_exchange() {
        return Err(FrameError::Malformed {
            frame: "ConnectAck",
            reason: "key exchange block only valid for version 14",
        });
    }

    let key_len = ack
        .key_exchange
        .as_ref()
        .map_or(0, |k| 3 + k.key.len());
    let component = if ack.version.has_component_info() {
        Some(clamp(
            ack.component_version.as_deref().unwrap_or("").as_bytes(),
            MAX_COMPONENT_LEN,
        ))
    } else {
        None
    };
    let message_len =
        ACK_FIXED_HEADER as usize + key_len + component.map_or(0, |c| c.len() + 2);

    dst.reserve(message_len);
    dst.put_u16(message_len as u16);
    dst.put_u8(FLAG_REPLY);
    dst.put_u8(EXT_ACK);
    dst.put_u8(ACK_FIXED_HEADER);
    dst.put_u8(0x00); // unused
    dst.put_u32(ack.version.ipc_version());
    dst.put_u16(ack.max_user_msg_size);
    dst.put_u8(0x03); // session flags: pings both directions
    dst.put_u8(ack.ping_timeout);
    dst.put_u8(ack.major_version);
    dst.put_u8(ack.minor_version);
    dst.put_u16(ack.compression.as_u16());
    dst.put_u8(ack.compression_level);
    if let Some(key) = &ack.key_exchange {
        dst.put_u8(EXT_KEY_EXCHANGE);
        dst.put_u8(key.encryption_type);
        dst.put_u8(key.key.len() as u8);
        dst.put_slice(&key.key);
    }
    if let Some(component) = component {
        dst.put_u8(component.len() as u8 + 1);
        dst.put_u8(component.len() as u8);
        dst.put_slice(component);
    }
    Ok(())
}

/// Encode a ConnectNak. `text` is the logical refusal text; the trailing
/// NUL is added on the wire and counted in the text-length field.
pub fn encode_connect_nak(nak: &ConnectNak, dst: &mut BytesMut) -> Result<()> {
    let text = clamp(nak.text.as_bytes(), u16::MAX as usize - 1);
    let message_len = NAK_FIXED_HEADER as usize + text.len() + 1;

    dst.reserve(message_len);
    dst.put_u16(message_len as u16);
    dst.put_u8(FLAG_REPLY);
    dst.put_u8(EXT_NAK);
    dst.put_u8(NAK_FIXED_HEADER);
    dst.put_u8(0x00); // unused
    dst.put_u16(text.len() as u16 + 1);
    dst.put_slice(text);
    dst.put_u8(0x00); // trailing NUL
    Ok(())
}

/// Parse the server's reply to a ConnectRequest (Ack or Nak), consuming it.
pub fn decode_connect_reply(src: &mut BytesMut) -> Result<Option<ConnectReply>> {
    let Some(frame) = take_frame(src, "ConnectReply")? else {
        return Ok(None);
    };
    let mut cur = Cursor::new(&frame, "ConnectReply");
    cur.skip(2)?;
    if cur.u8()? != FLAG_REPLY {
        return Err(FrameError::Malformed {
            frame: "ConnectReply",
            reason: "unexpected flags byte",
        });
    }
    match cur.u8()? {
        EXT_ACK => decode_ack_body(cur).map(|ack| Some(ConnectReply::Ack(ack))),
        EXT_NAK => decode_nak_body(cur).map(|nak| Some(ConnectReply::Nak(nak))),
        _ => Err(FrameError::Malformed {
            frame: "ConnectReply",
            reason: "unknown extended header flags",
        }),
    }
}

fn decode_ack_body(mut cur: Cursor<'_>) -> Result<ConnectAck> {
    if cur.u8()? != ACK_FIXED_HEADER {
        return Err(FrameError::Malformed {
            frame: "ConnectAck",
            reason: "unexpected header length",
        });
    }
    cur.u8()?; // unused
    let version = RipcVersion::from_ipc_version(cur.u32()?)?;
    let max_user_msg_size = cur.u16()?;
    cur.u8()?; // session flags
    let ping_timeout = cur.u8()?;
    let major_version = cur.u8()?;
    let minor_version = cur.u8()?;
    let compression = CompressionType::from_u16(cur.u16()?)?;
    let compression_level = cur.u8()?;

    let key_exchange = if version.has_key_exchange() {
        if cur.u8()? != EXT_KEY_EXCHANGE {
            return Err(FrameError::Malformed {
                frame: "ConnectAck",
                reason: "missing key exchange flag",
            });
        }
        let encryption_type = cur.u8()?;
        let key_len = cur.u8()? as usize;
        Some(KeyExchange {
            encryption_type,
            key: Bytes::copy_from_slice(cur.bytes(key_len)?),
        })
    } else {
        None
    };

    let component_version = if version.has_component_info() {
        let container_len = cur.u8()? as usize;
        if container_len > 0 {
            Some(cur.short_string()?)
        } else {
            Some(String::new())
        }
    } else {
        None
    };
    cur.finish()?;

    Ok(ConnectAck {
        version,
        max_user_msg_size,
        ping_timeout,
        major_version,
        minor_version,
        compression,
        compression_level,
        key_exchange,
        component_version,
    })
}

fn decode_nak_body(mut cur: Cursor<'_>) -> Result<ConnectNak> {
    if cur.u8()? != NAK_FIXED_HEADER {
        return Err(FrameError::Malformed {
            frame: "ConnectNak",
            reason: "unexpected header length",
        });
    }
    cur.u8()?; // unused
    let text_len = cur.u16()? as usize;
    let raw = cur.bytes(text_len)?;
    // Strip the trailing NUL the wire carries.
    let logical = raw.strip_suffix(&[0]).ok_or(FrameError::Malformed {
        frame: "ConnectNak",
        reason: "text missing trailing NUL",
    })?;
    let text = String::from_utf8_lossy(logical).into_owned();
    cur.finish()?;
    Ok(ConnectNak { text })
}

/// Encode a version-14 ClientKey reply.
pub fn encode_client_key(key: &ClientKey, dst: &mut BytesMut) -> Result<()> {
    if key.key.len() > u8::MAX as usize {
        return Err(FrameError::Malformed {
            frame: "ClientKey",
            reason: "key exceeds 255 bytes",
        });
    }
    let message_len = 5 + key.key.len();
    dst.reserve(message_len);
    dst.put_u16(message_len as u16);
    dst.put_u8(FLAG_REPLY);
    dst.put_u8(EXT_KEY_EXCHANGE);
    dst.put_u8(key.key.len() as u8);
    dst.put_slice(&key.key);
    Ok(())
}

/// Parse a version-14 ClientKey reply, consuming it.
pub fn decode_client_key(src: &mut BytesMut) -> Result<Option<ClientKey>> {
    let Some(frame) = take_frame(src, "ClientKey")? else {
        return Ok(None);
    };
    let mut cur = Cursor::new(&frame, "ClientKey");
    cur.skip(2)?;
    if cur.u8()? != FLAG_REPLY || cur.u8()? != EXT_KEY_EXCHANGE {
        return Err(FrameError::Malformed {
            frame: "ClientKey",
            reason: "unexpected flags",
        });
    }
    let key_len = cur.u8()? as usize;
    let key = Bytes::copy_from_slice(cur.bytes(key_len)?);
    cur.finish()?;
    Ok(Some(ClientKey { key }))
}

/// Split one length-prefixed frame off the front of `src`, or `None` if a
/// complete frame is not buffered yet.
fn take_frame(src: &mut BytesMut, frame: &'static str) -> Result<Option<BytesMut>> {
    if src.len() < 2 {
        return Ok(None);
    }
    let message_len = u16::from_be_bytes([src[0], src[1]]) as usize;
    if message_len < 4 {
        return Err(FrameError::Malformed {
            frame,
            reason: "message length below framing minimum",
        });
    }
    if src.len() < message_len {
        return Ok(None);
    }
    Ok(Some(src.split_to(message_len)))
}

fn clamp(bytes: &[u8], max: usize) -> &[u8] {
    &bytes[..bytes.len().min(max)]
}

/// Bounds-checked reader over one frame's bytes.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    frame: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], frame: &'static str) -> Self {
        Self { buf, pos: 0, frame }
    }

    fn overrun(&self) -> FrameError {
        FrameError::Malformed {
            frame: self.frame,
            reason: "frame shorter than its fields",
        }
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or_else(|| self.overrun())?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(self.overrun());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// One-byte length-prefixed string.
    fn short_string(&mut self) -> Result<String> {
        let len = self.u8()? as usize;
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(FrameError::Malformed {
                frame: self.frame,
                reason: "trailing bytes after frame fields",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: RipcVersion) -> ConnectRequest {
        ConnectRequest {
            version,
            compression: CompressionType::None,
            ping_timeout: 60,
            protocol_type: ProtocolType::Rwf,
            major_version: 14,
            minor_version: 1,
            hostname: "md-host".to_string(),
            ip_address: "10.0.0.7".to_string(),
            component_version: Some("ripc 0.3.0".to_string()),
        }
    }

    fn ack(version: RipcVersion) -> ConnectAck {
        ConnectAck {
            version,
            max_user_msg_size: 6144,
            ping_timeout: 60,
            major_version: 14,
            minor_version: 1,
            compression: CompressionType::None,
            compression_level: 0,
            key_exchange: version.has_key_exchange().then(|| KeyExchange {
                encryption_type: 1,
                key: Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]),
            }),
            component_version: version.has_component_info().then(|| "ripc 0.3.0".to_string()),
        }
    }

    #[test]
    fn connect_request_roundtrips_every_version() {
        for version in RipcVersion::ALL_DESCENDING {
            let req = request(version);
            let mut wire = BytesMut::new();
            encode_connect_request(&req, &mut wire).unwrap();

            let declared = u16::from_be_bytes([wire[0], wire[1]]) as usize;
            assert_eq!(declared, wire.len(), "message length must equal bytes on the wire");

            let decoded = decode_connect_request(&mut wire).unwrap().unwrap();
            assert!(wire.is_empty(), "decode must consume the whole frame");
            assert_eq!(decoded.version, version);
            assert_eq!(decoded.ping_timeout, req.ping_timeout);
            assert_eq!(decoded.protocol_type, req.protocol_type);
            assert_eq!(decoded.major_version, req.major_version);
            assert_eq!(decoded.minor_version, req.minor_version);
            assert_eq!(decoded.hostname, req.hostname);
            assert_eq!(decoded.ip_address, req.ip_address);
            if version.has_component_info() {
                assert_eq!(decoded.component_version.as_deref(), Some("ripc 0.3.0"));
            } else {
                assert!(decoded.component_version.is_none());
            }
        }
    }

    #[test]
    fn connect_request_v14_wire_layout() {
        let req = request(RipcVersion::V14);
        let mut wire = BytesMut::new();
        encode_connect_request(&req, &mut wire).unwrap();

        assert_eq!(wire[2], 0x00, "flags");
        assert_eq!(
            u32::from_be_bytes([wire[3], wire[4], wire[5], wire[6]]),
            0x0018,
            "connection version constant"
        );
        assert_eq!(wire[7], 0x08, "key exchange header flag");
        let header_len = wire[8] as usize;
        assert_eq!(wire[9], 0x00, "compression bitmap size");
        assert_eq!(wire[10], 60, "ping timeout");
        assert_eq!(wire[11], 0x00, "session flags");
        assert_eq!(wire[12], 0, "protocol type rwf");
        // message length = header + component name + 2 container bytes
        let msg_len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        assert_eq!(msg_len, header_len + "ripc 0.3.0".len() + 2);
    }

    #[test]
    fn connect_request_v11_has_no_protocol_type_byte() {
        let v11 = request(RipcVersion::V11);
        let v12 = ConnectRequest {
            version: RipcVersion::V12,
            ..request(RipcVersion::V12)
        };
        let mut w11 = BytesMut::new();
        let mut w12 = BytesMut::new();
        encode_connect_request(&v11, &mut w11).unwrap();
        encode_connect_request(&v12, &mut w12).unwrap();
        // Same fields; v11 drops exactly the protocol-type byte. Neither
        // carries a component container.
        assert_eq!(w12.len(), w11.len() + 1);
        assert_eq!(w11[7], 0x00, "no key exchange flag below 14");
    }

    #[test]
    fn connect_request_with_requested_compression() {
        let req = ConnectRequest {
            compression: CompressionType::Zlib,
            ..request(RipcVersion::V14)
        };
        let mut wire = BytesMut::new();
        encode_connect_request(&req, &mut wire).unwrap();
        assert_eq!(wire[9], 0x01, "bitmap size");
        assert_eq!(wire[10], 0x01, "zlib bitmap entry");
        let decoded = decode_connect_request(&mut wire).unwrap().unwrap();
        assert_eq!(decoded.compression, CompressionType::Zlib);
    }

    #[test]
    fn component_version_truncated_to_wire_limit() {
        for input_len in [127usize, 128, 255, 256, 2048] {
            let text = "x".repeat(input_len);
            let req = ConnectRequest {
                component_version: Some(text.clone()),
                ..request(RipcVersion::V14)
            };
            let mut wire = BytesMut::new();
            encode_connect_request(&req, &mut wire).unwrap();
            let decoded = decode_connect_request(&mut wire).unwrap().unwrap();
            let observed = decoded.component_version.unwrap();
            let expected_len = input_len.min(MAX_COMPONENT_LEN);
            assert_eq!(observed.len(), expected_len);
            assert_eq!(observed, text[..expected_len]);
        }
    }

    #[test]
    fn connect_ack_roundtrips_every_version() {
        for version in RipcVersion::ALL_DESCENDING {
            let ack = ack(version);
            let mut wire = BytesMut::new();
            encode_connect_ack(&ack, &mut wire).unwrap();
            let declared = u16::from_be_bytes([wire[0], wire[1]]) as usize;
            assert_eq!(declared, wire.len());

            let reply = decode_connect_reply(&mut wire).unwrap().unwrap();
            assert!(wire.is_empty());
            let decoded = match reply {
                ConnectReply::Ack(a) => a,
                ConnectReply::Nak(_) => panic!("expected ack"),
            };
            assert_eq!(decoded, ack);
        }
    }

    #[test]
    fn ack_carries_negotiated_compression_exactly() {
        for (compression, level) in [
            (CompressionType::None, 0u8),
            (CompressionType::Zlib, 6),
            (CompressionType::Lz4, 0),
        ] {
            let ack = ConnectAck {
                compression,
                compression_level: level,
                ..ack(RipcVersion::V13)
            };
            let mut wire = BytesMut::new();
            encode_connect_ack(&ack, &mut wire).unwrap();
            match decode_connect_reply(&mut wire).unwrap().unwrap() {
                ConnectReply::Ack(a) => {
                    assert_eq!(a.compression, compression);
                    assert_eq!(a.compression_level, level);
                }
                ConnectReply::Nak(_) => panic!("expected ack"),
            }
        }
    }

    #[test]
    fn ack_key_exchange_only_on_v14() {
        let bad = ConnectAck {
            key_exchange: Some(KeyExchange {
                encryption_type: 1,
                key: Bytes::from_static(b"k"),
            }),
            ..ack(RipcVersion::V13)
        };
        let mut wire = BytesMut::new();
        assert!(encode_connect_ack(&bad, &mut wire).is_err());

        let missing = ConnectAck {
            key_exchange: None,
            ..ack(RipcVersion::V14)
        };
        assert!(encode_connect_ack(&missing, &mut wire).is_err());
    }

    #[test]
    fn nak_message_length_arithmetic() {
        let nak = ConnectNak {
            text: "connection refused: unsupported protocol type".to_string(),
        };
        let mut wire = BytesMut::new();
        encode_connect_nak(&nak, &mut wire).unwrap();

        let msg_len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
        let header_len = wire[4] as usize;
        assert_eq!(msg_len, header_len + nak.text.len() + 1, "header + text + NUL");
        assert_eq!(wire[wire.len() - 1], 0x00, "trailing NUL");
        assert_eq!(wire[3], 0x02, "nak extended flags");

        match decode_connect_reply(&mut wire).unwrap().unwrap() {
            ConnectReply::Nak(decoded) => assert_eq!(decoded.text, nak.text),
            ConnectReply::Ack(_) => panic!("expected nak"),
        }
    }

    #[test]
    fn incomplete_frames_return_none_without_consuming() {
        let req = request(RipcVersion::V14);
        let mut wire = BytesMut::new();
        encode_connect_request(&req, &mut wire).unwrap();
        let full_len = wire.len();

        let mut partial = BytesMut::from(&wire[..full_len - 3]);
        assert!(decode_connect_request(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full_len - 3);

        let mut one_byte = BytesMut::from(&wire[..1]);
        assert!(decode_connect_request(&mut one_byte).unwrap().is_none());
    }

    #[test]
    fn unknown_connection_version_rejected() {
        let req = request(RipcVersion::V14);
        let mut wire = BytesMut::new();
        encode_connect_request(&req, &mut wire).unwrap();
        // Corrupt the connection-version constant.
        wire[3..7].copy_from_slice(&0x0042u32.to_be_bytes());
        assert!(matches!(
            decode_connect_request(&mut wire),
            Err(FrameError::UnsupportedConnectionVersion(0x0042))
        ));
    }

    #[test]
    fn reply_with_unknown_extended_flags_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u16(5);
        wire.put_u8(FLAG_REPLY);
        wire.put_u8(0x7f);
        wire.put_u8(0);
        assert!(matches!(
            decode_connect_reply(&mut wire),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn truncated_ack_body_is_malformed_not_retried() {
        let ack = ack(RipcVersion::V13);
        let mut wire = BytesMut::new();
        encode_connect_ack(&ack, &mut wire).unwrap();
        // Shrink the declared length so the body is cut mid-fields.
        let short = (wire.len() as u16) - 6;
        wire[0..2].copy_from_slice(&short.to_be_bytes());
        assert!(matches!(
            decode_connect_reply(&mut wire),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn client_key_roundtrip() {
        let key = ClientKey {
            key: Bytes::from_static(&[9, 8, 7, 6, 5, 4, 3, 2]),
        };
        let mut wire = BytesMut::new();
        encode_client_key(&key, &mut wire).unwrap();
        assert_eq!(u16::from_be_bytes([wire[0], wire[1]]) as usize, wire.len());
        let decoded = decode_client_key(&mut wire).unwrap().unwrap();
        assert_eq!(decoded, key);
        assert!(wire.is_empty());
    }
}
