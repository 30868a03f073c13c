//! Data-message framing.
//!
//! Every message on an active channel is prefixed by the 3-byte RIPC
//! header: length (2B, counting the header itself) + flags (1B). A frame
//! whose length equals the bare header is a heartbeat and carries no
//! payload. Messages larger than the negotiated fragment size are split
//! across fragment frames keyed by a fragment id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::version::RipcVersion;

/// RIPC message header: length (2B) + flags (1B).
pub const HEADER_SIZE: usize = 3;

/// Bytes reserved ahead of each packed entry; the advertised fragment size
/// is the negotiated max user message size minus this.
pub const PACKED_HEADER_SIZE: usize = 2;

/// Header flag bits.
pub mod flags {
    /// An optional-flags byte follows the header.
    pub const HAS_OPTIONAL: u8 = 0x01;
    /// Frame carries data.
    pub const DATA: u8 = 0x02;
}

/// Optional-flags byte bits.
pub mod optional {
    /// First fragment: total message length and fragment id follow.
    pub const FRAGMENT_HEADER: u8 = 0x08;
    /// Continuation fragment: fragment id follows.
    pub const FRAGMENT: u8 = 0x04;
}

/// One decoded frame from an active channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RipcMessage {
    /// Heartbeat; no payload is ever delivered for this.
    Ping,
    /// A complete, unfragmented message payload.
    Data(Bytes),
    /// First fragment of a larger message.
    FragmentHeader {
        fragment_id: u16,
        total_len: u32,
        payload: Bytes,
    },
    /// Continuation fragment.
    Fragment { fragment_id: u16, payload: Bytes },
}

fn fragment_id_size(version: RipcVersion) -> usize {
    if version >= RipcVersion::V13 {
        2
    } else {
        1
    }
}

/// Encode a complete (unfragmented) data message.
pub fn encode_message(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let total = HEADER_SIZE + payload.len();
    if total > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u16::MAX as usize - HEADER_SIZE,
        });
    }
    dst.reserve(total);
    dst.put_u16(total as u16);
    dst.put_u8(flags::DATA);
    dst.put_slice(payload);
    Ok(())
}

/// Encode a heartbeat frame: a bare header, nothing else.
pub fn encode_ping(dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    dst.put_u16(HEADER_SIZE as u16);
    dst.put_u8(flags::DATA);
}

/// Encode the first fragment of a message of `total_len` bytes.
pub fn encode_fragment_header(
    version: RipcVersion,
    fragment_id: u16,
    total_len: u32,
    chunk: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    let overhead = HEADER_SIZE + 1 + 4 + fragment_id_size(version);
    encode_fragment_frame(version, optional::FRAGMENT_HEADER, overhead, chunk, dst, |dst| {
        dst.put_u32(total_len);
        put_fragment_id(version, fragment_id, dst);
    })
}

/// Encode a continuation fragment.
pub fn encode_fragment(
    version: RipcVersion,
    fragment_id: u16,
    chunk: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    let overhead = HEADER_SIZE + 1 + fragment_id_size(version);
    encode_fragment_frame(version, optional::FRAGMENT, overhead, chunk, dst, |dst| {
        put_fragment_id(version, fragment_id, dst);
    })
}

fn encode_fragment_frame(
    _version: RipcVersion,
    opt_flags: u8,
    overhead: usize,
    chunk: &[u8],
    dst: &mut BytesMut,
    put_fields: impl FnOnce(&mut BytesMut),
) -> Result<()> {
    let total = overhead + chunk.len();
    if total > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: chunk.len(),
            max: u16::MAX as usize - overhead,
        });
    }
    dst.reserve(total);
    dst.put_u16(total as u16);
    dst.put_u8(flags::DATA | flags::HAS_OPTIONAL);
    dst.put_u8(opt_flags);
    put_fields(dst);
    dst.put_slice(chunk);
    Ok(())
}

fn put_fragment_id(version: RipcVersion, fragment_id: u16, dst: &mut BytesMut) {
    if fragment_id_size(version) == 2 {
        dst.put_u16(fragment_id);
    } else {
        dst.put_u8(fragment_id as u8);
    }
}

/// Decode one frame from the front of `src`, or `None` if a complete frame
/// is not buffered yet.
pub fn decode_message(src: &mut BytesMut, version: RipcVersion) -> Result<Option<RipcMessage>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }
    let len = u16::from_be_bytes([src[0], src[1]]) as usize;
    if len < HEADER_SIZE {
        return Err(FrameError::InvalidHeader {
            len,
            min: HEADER_SIZE,
        });
    }
    if src.len() < len {
        return Ok(None);
    }

    let mut frame = src.split_to(len);
    let header_flags = frame[2];
    frame.advance(HEADER_SIZE);

    if len == HEADER_SIZE {
        return Ok(Some(RipcMessage::Ping));
    }

    if header_flags & flags::HAS_OPTIONAL == 0 {
        return Ok(Some(RipcMessage::Data(frame.freeze())));
    }

    let malformed = |reason| FrameError::Malformed {
        frame: "RipcMessage",
        reason,
    };
    if frame.is_empty() {
        return Err(malformed("missing optional flags byte"));
    }
    let opt = frame.get_u8();
    let id_size = fragment_id_size(version);

    if opt & optional::FRAGMENT_HEADER != 0 {
        if frame.len() < 4 + id_size {
            return Err(malformed("fragment header shorter than its fields"));
        }
        let total_len = frame.get_u32();
        let fragment_id = get_fragment_id(version, &mut frame);
        Ok(Some(RipcMessage::FragmentHeader {
            fragment_id,
            total_len,
            payload: frame.freeze(),
        }))
    } else if opt & optional::FRAGMENT != 0 {
        if frame.len() < id_size {
            return Err(malformed("fragment shorter than its fields"));
        }
        let fragment_id = get_fragment_id(version, &mut frame);
        Ok(Some(RipcMessage::Fragment {
            fragment_id,
            payload: frame.freeze(),
        }))
    } else {
        Err(malformed("unknown optional flags"))
    }
}

fn get_fragment_id(version: RipcVersion, frame: &mut BytesMut) -> u16 {
    if fragment_id_size(version) == 2 {
        frame.get_u16()
    } else {
        frame.get_u8() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_frame_is_exactly_three_bytes() {
        let mut wire = BytesMut::new();
        encode_ping(&mut wire);
        assert_eq!(wire.len(), 3);
        assert_eq!(&wire[..], &[0x00, 0x03, flags::DATA]);

        let msg = decode_message(&mut wire, RipcVersion::V14).unwrap().unwrap();
        assert_eq!(msg, RipcMessage::Ping);
        assert!(wire.is_empty());
    }

    #[test]
    fn data_message_roundtrip() {
        let mut wire = BytesMut::new();
        encode_message(b"quote update", &mut wire).unwrap();
        assert_eq!(
            u16::from_be_bytes([wire[0], wire[1]]) as usize,
            wire.len()
        );
        match decode_message(&mut wire, RipcVersion::V14).unwrap().unwrap() {
            RipcMessage::Data(payload) => assert_eq!(payload.as_ref(), b"quote update"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn sequential_messages_decode_in_order() {
        let mut wire = BytesMut::new();
        encode_message(b"one", &mut wire).unwrap();
        encode_ping(&mut wire);
        encode_message(b"two", &mut wire).unwrap();

        let first = decode_message(&mut wire, RipcVersion::V14).unwrap().unwrap();
        let second = decode_message(&mut wire, RipcVersion::V14).unwrap().unwrap();
        let third = decode_message(&mut wire, RipcVersion::V14).unwrap().unwrap();
        assert_eq!(first, RipcMessage::Data(Bytes::from_static(b"one")));
        assert_eq!(second, RipcMessage::Ping);
        assert_eq!(third, RipcMessage::Data(Bytes::from_static(b"two")));
        assert!(decode_message(&mut wire, RipcVersion::V14).unwrap().is_none());
    }

    #[test]
    fn fragments_roundtrip_with_wide_and_narrow_ids() {
        for version in [RipcVersion::V12, RipcVersion::V14] {
            let mut wire = BytesMut::new();
            encode_fragment_header(version, 7, 10, b"01234", &mut wire).unwrap();
            encode_fragment(version, 7, b"56789", &mut wire).unwrap();

            match decode_message(&mut wire, version).unwrap().unwrap() {
                RipcMessage::FragmentHeader {
                    fragment_id,
                    total_len,
                    payload,
                } => {
                    assert_eq!(fragment_id, 7);
                    assert_eq!(total_len, 10);
                    assert_eq!(payload.as_ref(), b"01234");
                }
                other => panic!("unexpected message: {other:?}"),
            }
            match decode_message(&mut wire, version).unwrap().unwrap() {
                RipcMessage::Fragment {
                    fragment_id,
                    payload,
                } => {
                    assert_eq!(fragment_id, 7);
                    assert_eq!(payload.as_ref(), b"56789");
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn narrow_fragment_id_frame_is_one_byte_shorter() {
        let mut narrow = BytesMut::new();
        let mut wide = BytesMut::new();
        encode_fragment(RipcVersion::V12, 3, b"x", &mut narrow).unwrap();
        encode_fragment(RipcVersion::V13, 3, b"x", &mut wide).unwrap();
        assert_eq!(wide.len(), narrow.len() + 1);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut wire = BytesMut::new();
        encode_message(b"partial", &mut wire).unwrap();
        let mut cut = BytesMut::from(&wire[..wire.len() - 2]);
        assert!(decode_message(&mut cut, RipcVersion::V14).unwrap().is_none());
        let mut tiny = BytesMut::from(&wire[..2]);
        assert!(decode_message(&mut tiny, RipcVersion::V14).unwrap().is_none());
    }

    #[test]
    fn header_length_below_minimum_is_an_error() {
        let mut wire = BytesMut::from(&[0x00, 0x02, 0x02][..]);
        assert!(matches!(
            decode_message(&mut wire, RipcVersion::V14),
            Err(FrameError::InvalidHeader { len: 2, min: 3 })
        ));
    }

    #[test]
    fn oversized_payload_rejected_on_encode() {
        let huge = vec![0u8; u16::MAX as usize];
        let mut wire = BytesMut::new();
        assert!(matches!(
            encode_message(&huge, &mut wire),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }
}
