//! Wire format: segment framing and header encoding/decoding.
//!
//! Every datagram exchanged between peers carries exactly one [`Segment`]:
//! a fixed 12-byte header followed by up to [`MAX_PAYLOAD`] bytes of opaque
//! payload. No I/O happens here — pure data transformation.
//!
//! Wire format (all multi-byte fields big-endian):
//!
//! ```text
//!  0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                        Sequence Number                        |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                     Acknowledgment Number                     |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |         Connection ID         |         Not Used        |A|S|F|
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding is permissive: anything with a full header parses, and flag
//! validation is a separate explicit step so the dispatch layer can log
//! and drop protocol violations instead of erroring inside the codec.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header length on the wire.
pub const HEADER_LEN: usize = 12;

/// Maximum payload bytes per segment.
pub const MAX_PAYLOAD: usize = 512;

/// Maximum framed segment size (header + payload).
pub const MAX_PACKET: usize = HEADER_LEN + MAX_PAYLOAD;

/// Flag values for the low bits of the header's flags field.
///
/// Only these five combinations are legal on the wire; anything else is a
/// protocol violation (see [`Segment::has_valid_flags`]).
pub mod flags {
    /// Sender has no more data (teardown initiation).
    pub const FIN: u16 = 1;
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u16 = 2;
    /// Acknowledgment field is valid; also set on every data segment.
    pub const ACK: u16 = 4;
    /// Handshake reply.
    pub const SYN_ACK: u16 = SYN | ACK;
    /// Teardown reply.
    pub const FIN_ACK: u16 = FIN | ACK;
}

/// One protocol message: header fields in host byte order plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Sequence number of the first payload byte in this segment.
    pub seq: u32,
    /// Cumulative acknowledgment number.
    pub ack: u32,
    /// Connection id; 0 until the handshake assigns one.
    pub conn_id: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u16,
    /// Opaque payload, at most [`MAX_PAYLOAD`] bytes.
    pub payload: Bytes,
}

impl Segment {
    /// A header-only segment (every reply and control message).
    pub fn header_only(seq: u32, ack: u32, conn_id: u16, flags: u16) -> Self {
        Self {
            seq,
            ack,
            conn_id,
            flags,
            payload: Bytes::new(),
        }
    }

    /// A data-bearing segment.
    pub fn data(seq: u32, ack: u32, conn_id: u16, flags: u16, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Self {
            seq,
            ack,
            conn_id,
            flags,
            payload,
        }
    }

    /// Serialize to wire bytes: exactly `12 + payload.len()` bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.conn_id);
        buf.put_u16(self.flags);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a segment from a raw datagram.
    ///
    /// Fails only when `data` is shorter than the fixed header. Flag
    /// validity is deliberately not checked here — see the module docs.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            bail!(
                "segment too short: {} bytes (need at least {})",
                data.len(),
                HEADER_LEN
            );
        }
        let mut buf = data;
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let conn_id = buf.get_u16();
        let flags = buf.get_u16();
        Ok(Self {
            seq,
            ack,
            conn_id,
            flags,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Whether the flags field holds one of the five legal combinations.
    pub fn has_valid_flags(&self) -> bool {
        matches!(
            self.flags,
            flags::FIN | flags::SYN | flags::ACK | flags::SYN_ACK | flags::FIN_ACK
        )
    }

    /// Short flag mnemonic for trace lines.
    pub fn flags_name(&self) -> &'static str {
        match self.flags {
            flags::FIN => "FIN",
            flags::SYN => "SYN",
            flags::ACK => "ACK",
            flags::SYN_ACK => "SYNACK",
            flags::FIN_ACK => "FINACK",
            _ => "BAD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_only_roundtrip() {
        let seg = Segment::header_only(12345, 0, 0, flags::SYN);
        let bytes = seg.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        let parsed = Segment::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, seg);
    }

    #[test]
    fn test_data_roundtrip() {
        let seg = Segment::data(77, 4322, 3, flags::ACK, Bytes::from_static(b"hello world"));
        let parsed = Segment::from_bytes(&seg.to_bytes()).unwrap();
        assert_eq!(parsed.seq, 77);
        assert_eq!(parsed.ack, 4322);
        assert_eq!(parsed.conn_id, 3);
        assert_eq!(parsed.flags, flags::ACK);
        assert_eq!(&parsed.payload[..], b"hello world");
    }

    #[test]
    fn test_framed_size_is_header_plus_payload() {
        let seg = Segment::data(0, 0, 1, flags::ACK, Bytes::from(vec![0u8; MAX_PAYLOAD]));
        assert_eq!(seg.to_bytes().len(), MAX_PACKET);
    }

    #[test]
    fn test_fields_big_endian_on_wire() {
        let seg = Segment::header_only(0x0102_0304, 0x0506_0708, 0x090A, flags::ACK);
        let bytes = seg.to_bytes();
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[8..10], &[0x09, 0x0A]);
        assert_eq!(&bytes[10..12], &[0x00, 0x04]);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(Segment::from_bytes(&[0u8; HEADER_LEN - 1]).is_err());
        assert!(Segment::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_flag_validity() {
        for valid in [flags::FIN, flags::SYN, flags::ACK, flags::SYN_ACK, flags::FIN_ACK] {
            assert!(Segment::header_only(0, 0, 0, valid).has_valid_flags());
        }
        // FIN+SYN and FIN+SYN+ACK are not legal combinations.
        assert!(!Segment::header_only(0, 0, 0, 3).has_valid_flags());
        assert!(!Segment::header_only(0, 0, 0, 7).has_valid_flags());
        assert!(!Segment::header_only(0, 0, 0, 0).has_valid_flags());
        assert!(!Segment::header_only(0, 0, 0, 8).has_valid_flags());
    }

    #[test]
    fn test_decode_is_permissive_about_flags() {
        // Invalid flag values still parse; rejection is the caller's call.
        let seg = Segment::header_only(1, 2, 3, 7);
        let parsed = Segment::from_bytes(&seg.to_bytes()).unwrap();
        assert_eq!(parsed.flags, 7);
        assert!(!parsed.has_valid_flags());
    }
}
