//! Frame header encoding/decoding
//!
//! The frame format uses a 9-byte header:
//! - version: 1 byte (u8)
//! - request_id: 4 bytes (u32, big-endian)
//! - kind: 1 byte (u8)
//! - payload_length: 3 bytes (u24, big-endian, max 16MB)
//!
//! The kind byte is kept raw here. Mapping it onto [`MessageKind`] happens in
//! the codec so an unknown kind can be answered instead of tearing down the
//! connection.
//!
//! [`MessageKind`]: crate::message::MessageKind

use bytes::{Buf, BufMut, BytesMut};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size (16MB - 1, limited by 24-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Wire protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header containing routing and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version of the sender
    pub version: u8,
    /// Correlates a response with its request
    pub request_id: u32,
    /// Raw message kind byte
    pub kind: u8,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new header for the current protocol version
    pub fn new(request_id: u32, kind: u8, payload_length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id,
            kind,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.version);
        dst.put_u32(self.request_id);
        dst.put_u8(self.kind);
        // payload_length: 3 bytes big-endian (24-bit)
        dst.put_u8((self.payload_length >> 16) as u8);
        dst.put_u16(self.payload_length as u16);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < HEADER_SIZE {
            return None;
        }

        let version = src.get_u8();
        let request_id = src.get_u32();
        let kind = src.get_u8();
        let len_high = src.get_u8() as u32;
        let len_low = src.get_u16() as u32;

        Some(Self {
            version,
            request_id,
            kind,
            payload_length: (len_high << 16) | len_low,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader::new(42, 0x03, 12345);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_max_payload_length() {
        let header = FrameHeader::new(1, 0x01, MAX_PAYLOAD_SIZE as u32);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        header.encode(&mut buf);

        let decoded = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded.payload_length, MAX_PAYLOAD_SIZE as u32);
    }

    #[test]
    fn test_insufficient_bytes() {
        let mut buf = BytesMut::from(&[0u8; 8][..]);
        assert!(FrameHeader::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_unknown_kind_is_kept_raw() {
        let mut buf = BytesMut::from(&[1, 0, 0, 0, 7, 0xFE, 0, 0, 10][..]);
        let header = FrameHeader::decode(&mut buf).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.kind, 0xFE);
        assert_eq!(header.payload_length, 10);
    }
}
