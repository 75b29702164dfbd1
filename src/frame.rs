//! Wire frame codec for the gateway protocol.
//!
//! Fixed 44-byte header followed by an opaque body. All multi-byte
//! integers are little-endian, matching the brokerage wire format:
//!
//! ```text
//! ┌───────┬─────────────┬────────┬─────────┬────────┬──────────┬───────────┬─────────┐
//! │ magic │ protocol id │ format │ version │ serial │ body len │ integrity │ padding │
//! │ 2 B   │ 4 B u32 LE  │ 1 B    │ 1 B     │ 4 B LE │ 4 B LE   │ 20 B      │ 8 B     │
//! └───────┴─────────────┴────────┴─────────┴────────┴──────────┴───────────┴─────────┘
//! ```
//!
//! The 20-byte integrity region is written as zeros and never verified:
//! the gateway does not populate it, and inventing a checksum here would
//! break bit-exactness with the deployed wire format. This is a known
//! integrity gap, not an oversight.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{GatelinkError, Result};

/// Two-byte constant opening every frame.
pub const MAGIC: [u8; 2] = [0x47, 0x4C];

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 44;

const INTEGRITY_LEN: usize = 20;
const PADDING_LEN: usize = 8;

/// Serial number reserved for unsolicited pushes.
pub const PUSH_SERIAL: u32 = 0;

/// Format tag: structured binary body.
pub const FORMAT_BINARY: u8 = 0x01;
/// Format tag: plain (uninterpreted text) body.
pub const FORMAT_PLAIN: u8 = 0x02;

/// Protocol version this client speaks.
pub const VERSION: u8 = 0x01;

/// One decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol_id: u32,
    pub format_tag: u8,
    pub version: u8,
    pub serial: u32,
    pub body: Bytes,
}

impl Frame {
    /// Whether this frame is a server-initiated push rather than a
    /// response to a caller-issued request.
    pub fn is_push(&self) -> bool {
        self.serial == PUSH_SERIAL
    }
}

/// Encode a frame for the wire.
pub fn encode(protocol_id: u32, serial: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&MAGIC);
    buf.put_u32_le(protocol_id);
    buf.put_u8(FORMAT_BINARY);
    buf.put_u8(VERSION);
    buf.put_u32_le(serial);
    buf.put_u32_le(body.len() as u32);
    buf.extend_from_slice(&[0u8; INTEGRITY_LEN]);
    buf.extend_from_slice(&[0u8; PADDING_LEN]);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Try to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// caller keeps buffering, it is not an error. On success the consumed
/// bytes are advanced past. Errors are fatal to the connection:
/// [`GatelinkError::CorruptStream`] means frame alignment is lost,
/// [`GatelinkError::OversizedFrame`] is a protocol violation.
///
/// Pure: never blocks, never panics on arbitrary input.
pub fn decode(buf: &mut BytesMut, max_body_len: u32) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0..2] != MAGIC {
        return Err(GatelinkError::CorruptStream(format!(
            "bad magic {:02x}{:02x}",
            buf[0], buf[1]
        )));
    }
    let body_len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    if body_len > max_body_len {
        return Err(GatelinkError::OversizedFrame {
            declared: body_len,
            limit: max_body_len,
        });
    }
    if buf.len() < HEADER_LEN + body_len as usize {
        return Ok(None);
    }

    buf.advance(2);
    let protocol_id = buf.get_u32_le();
    let format_tag = buf.get_u8();
    let version = buf.get_u8();
    let serial = buf.get_u32_le();
    let declared_len = buf.get_u32_le();
    buf.advance(INTEGRITY_LEN + PADDING_LEN);
    let body = buf.split_to(declared_len as usize).freeze();

    Ok(Some(Frame {
        protocol_id,
        format_tag,
        version,
        serial,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(frame) = decode(&mut buf, 1024 * 1024)? {
            out.push(frame);
        }
        Ok(out)
    }

    #[test]
    fn round_trip() {
        let body = b"600519|quote".to_vec();
        let wire = encode(0x1001, 42, &body);
        let frames = decode_all(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!(f.protocol_id, 0x1001);
        assert_eq!(f.serial, 42);
        assert_eq!(f.body.as_ref(), body.as_slice());
        assert_eq!(f.version, VERSION);
        assert!(!f.is_push());
    }

    #[test]
    fn round_trip_empty_body() {
        let wire = encode(7, 1, &[]);
        assert_eq!(wire.len(), HEADER_LEN);
        let frames = decode_all(&wire).unwrap();
        assert_eq!(frames[0].body.len(), 0);
    }

    #[test]
    fn push_serial_is_push() {
        let wire = encode(0x2001, PUSH_SERIAL, b"AAA");
        let frames = decode_all(&wire).unwrap();
        assert!(frames[0].is_push());
    }

    #[test]
    fn truncated_input_is_incomplete_not_error() {
        let wire = encode(1, 1, b"hello");
        // Every strict prefix must report "need more bytes".
        for cut in 0..wire.len() {
            let mut buf = BytesMut::from(&wire[..cut]);
            assert!(decode(&mut buf, 1024).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn bad_magic_is_corrupt_stream() {
        let mut wire = BytesMut::from(encode(1, 1, b"x").as_ref());
        wire[0] = 0xFF;
        match decode(&mut wire, 1024) {
            Err(GatelinkError::CorruptStream(_)) => {}
            other => panic!("expected CorruptStream, got {other:?}"),
        }
    }

    #[test]
    fn oversized_body_rejected() {
        let wire = encode(1, 1, &vec![0u8; 100]);
        let mut buf = BytesMut::from(wire.as_ref());
        match decode(&mut buf, 99) {
            Err(GatelinkError::OversizedFrame { declared: 100, limit: 99 }) => {}
            other => panic!("expected OversizedFrame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_back_to_back_frames_and_keeps_remainder() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode(1, 10, b"first"));
        wire.extend_from_slice(&encode(2, 11, b"second"));
        let partial = encode(3, 12, b"third");
        wire.extend_from_slice(&partial[..HEADER_LEN + 2]);

        let mut got = Vec::new();
        while let Some(f) = decode(&mut wire, 1024).unwrap() {
            got.push(f);
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].body.as_ref(), b"first");
        assert_eq!(got[1].body.as_ref(), b"second");

        // Remainder completes once the rest arrives.
        wire.extend_from_slice(&partial[HEADER_LEN + 2..]);
        let f = decode(&mut wire, 1024).unwrap().unwrap();
        assert_eq!(f.body.as_ref(), b"third");
        assert!(wire.is_empty());
    }

    #[test]
    fn never_panics_on_arbitrary_bytes() {
        // A pile of junk inputs that previously tripped naive parsers.
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x47],
            vec![0x47, 0x4C],
            vec![0x47, 0x4C, 0xFF, 0xFF, 0xFF, 0xFF],
            {
                // Valid header claiming u32::MAX body.
                let mut v = encode(1, 1, b"").to_vec();
                v[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
                v
            },
        ];
        for case in cases {
            let mut buf = BytesMut::from(case.as_slice());
            let _ = decode(&mut buf, 1024);
        }
    }
}
