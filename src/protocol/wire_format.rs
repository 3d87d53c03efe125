//! Wire format encoding and decoding.
//!
//! Implements the 8-byte AMQP frame header:
//! ```text
//! ┌──────────┬──────┬──────┬──────────┐
//! │ Size     │ DOFF │ Type │ Channel  │
//! │ 4 bytes  │1 byte│1 byte│ 2 bytes  │
//! │ uint32 BE│      │      │ uint16 BE│
//! └──────────┴──────┴──────┴──────────┘
//! ```
//!
//! `size` covers the whole frame including the header; `doff` is the
//! offset of the body in 4-byte words (minimum 2). All multi-byte
//! integers are Big Endian.
//!
//! Also implements the 8-byte protocol header `AMQP <id> 1 0 0` exchanged
//! before the SASL and AMQP phases.

use crate::error::{AmqpError, Result};

/// Frame header size in bytes (fixed, exactly 8).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Smallest max-frame-size a peer may advertise.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Default max-frame-size advertised in `open`.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65_536;

/// Default channel-max advertised in `open`.
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Protocol header size in bytes.
pub const PROTOCOL_HEADER_SIZE: usize = 8;

/// Frame type codes.
pub mod frame_type {
    /// AMQP performative frame.
    pub const AMQP: u8 = 0x00;
    /// SASL security frame.
    pub const SASL: u8 = 0x01;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including this header.
    pub size: u32,
    /// Data offset in 4-byte words.
    pub doff: u8,
    /// Frame type (see [`frame_type`]).
    pub frame_type: u8,
    /// Channel number (AMQP) or ignored (SASL).
    pub channel: u16,
}

impl FrameHeader {
    /// Create a header for a body of `body_len` bytes with no extended header.
    pub fn new(frame_type: u8, channel: u16, body_len: usize) -> Self {
        Self {
            size: (FRAME_HEADER_SIZE + body_len) as u32,
            doff: 2,
            frame_type,
            channel,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use amqpwire::protocol::{frame_type, FrameHeader};
    ///
    /// let header = FrameHeader::new(frame_type::AMQP, 1, 0);
    /// assert_eq!(header.encode(), [0, 0, 0, 8, 2, 0, 0, 1]);
    /// ```
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `FRAME_HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.size.to_be_bytes());
        buf[4] = self.doff;
        buf[5] = self.frame_type;
        buf[6..8].copy_from_slice(&self.channel.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            size: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            doff: buf[4],
            frame_type: buf[5],
            channel: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }

    /// Validate the header against the negotiated maximum frame size.
    ///
    /// Checks:
    /// - size does not exceed `max_frame_size` (`FrameSizeExceeded`)
    /// - size covers at least the header, doff is at least 2 and points
    ///   inside the frame (`MalformedEncoding`)
    /// - frame type is AMQP or SASL
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.size > max_frame_size {
            return Err(AmqpError::FrameSizeExceeded {
                size: self.size,
                max: max_frame_size,
            });
        }

        if (self.size as usize) < FRAME_HEADER_SIZE {
            return Err(AmqpError::MalformedEncoding(format!(
                "frame size {} smaller than header",
                self.size
            )));
        }

        if self.doff < 2 || self.body_offset() > self.size as usize {
            return Err(AmqpError::MalformedEncoding(format!(
                "invalid data offset {}",
                self.doff
            )));
        }

        if self.frame_type != frame_type::AMQP && self.frame_type != frame_type::SASL {
            return Err(AmqpError::MalformedEncoding(format!(
                "unknown frame type 0x{:02x}",
                self.frame_type
            )));
        }

        Ok(())
    }

    /// Offset of the frame body from the start of the frame.
    #[inline]
    pub fn body_offset(&self) -> usize {
        self.doff as usize * 4
    }

    /// Length of the frame body.
    #[inline]
    pub fn body_len(&self) -> usize {
        (self.size as usize).saturating_sub(self.body_offset())
    }

    #[inline]
    pub fn is_sasl(&self) -> bool {
        self.frame_type == frame_type::SASL
    }
}

/// Protocol id carried in the protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// Plain AMQP.
    Amqp = 0,
    /// TLS upgrade (not negotiated by this engine).
    Tls = 2,
    /// SASL security layer.
    Sasl = 3,
}

/// The 8-byte protocol header `AMQP <id> <major> <minor> <revision>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub id: ProtocolId,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl ProtocolHeader {
    /// AMQP 1.0.0 header for the given protocol id.
    pub const fn new(id: ProtocolId) -> Self {
        Self {
            id,
            major: 1,
            minor: 0,
            revision: 0,
        }
    }

    pub const fn amqp() -> Self {
        Self::new(ProtocolId::Amqp)
    }

    pub const fn sasl() -> Self {
        Self::new(ProtocolId::Sasl)
    }

    pub fn encode(&self) -> [u8; PROTOCOL_HEADER_SIZE] {
        [
            b'A',
            b'M',
            b'Q',
            b'P',
            self.id as u8,
            self.major,
            self.minor,
            self.revision,
        ]
    }

    /// Decode and check the `AMQP` magic and the 1.0.0 version.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PROTOCOL_HEADER_SIZE {
            return Err(AmqpError::MalformedEncoding(
                "protocol header too short".to_string(),
            ));
        }
        if &buf[0..4] != b"AMQP" {
            return Err(AmqpError::MalformedEncoding(format!(
                "bad protocol header magic {:?}",
                &buf[0..4]
            )));
        }
        let id = match buf[4] {
            0 => ProtocolId::Amqp,
            2 => ProtocolId::Tls,
            3 => ProtocolId::Sasl,
            other => {
                return Err(AmqpError::MalformedEncoding(format!(
                    "unknown protocol id {}",
                    other
                )))
            }
        };
        let header = Self {
            id,
            major: buf[5],
            minor: buf[6],
            revision: buf[7],
        };
        if (header.major, header.minor, header.revision) != (1, 0, 0) {
            return Err(AmqpError::Protocol(format!(
                "unsupported protocol version {}.{}.{}",
                header.major, header.minor, header.revision
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = FrameHeader::new(frame_type::AMQP, 7, 100);
        let decoded = FrameHeader::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
        assert_eq!(decoded.size, 108);
        assert_eq!(decoded.body_len(), 100);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = FrameHeader {
            size: 0x01020304,
            doff: 2,
            frame_type: frame_type::SASL,
            channel: 0x0506,
        };
        assert_eq!(header.encode(), [0x01, 0x02, 0x03, 0x04, 2, 1, 0x05, 0x06]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(FrameHeader::decode(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_validate_size_exceeded() {
        let header = FrameHeader::new(frame_type::AMQP, 0, 1000);
        let err = header.validate(512).unwrap_err();
        assert!(matches!(
            err,
            AmqpError::FrameSizeExceeded { size: 1008, max: 512 }
        ));
    }

    #[test]
    fn test_validate_bad_doff() {
        let mut header = FrameHeader::new(frame_type::AMQP, 0, 4);
        header.doff = 1;
        assert!(matches!(
            header.validate(512),
            Err(AmqpError::MalformedEncoding(_))
        ));

        header.doff = 10; // body offset 40 > size 12
        assert!(header.validate(512).is_err());
    }

    #[test]
    fn test_validate_undersized_frame() {
        let header = FrameHeader {
            size: 4,
            doff: 2,
            frame_type: frame_type::AMQP,
            channel: 0,
        };
        assert!(header.validate(512).is_err());
    }

    #[test]
    fn test_validate_unknown_type() {
        let mut header = FrameHeader::new(frame_type::AMQP, 0, 0);
        header.frame_type = 9;
        assert!(header.validate(512).is_err());
    }

    #[test]
    fn test_extended_header_offset() {
        let header = FrameHeader {
            size: 20,
            doff: 3,
            frame_type: frame_type::AMQP,
            channel: 0,
        };
        assert!(header.validate(512).is_ok());
        assert_eq!(header.body_offset(), 12);
        assert_eq!(header.body_len(), 8);
    }

    #[test]
    fn test_protocol_header_bytes() {
        assert_eq!(ProtocolHeader::sasl().encode(), *b"AMQP\x03\x01\x00\x00");
        assert_eq!(ProtocolHeader::amqp().encode(), *b"AMQP\x00\x01\x00\x00");
    }

    #[test]
    fn test_protocol_header_decode() {
        let header = ProtocolHeader::decode(b"AMQP\x03\x01\x00\x00").unwrap();
        assert_eq!(header.id, ProtocolId::Sasl);

        assert!(ProtocolHeader::decode(b"HTTP/1.1").is_err());
        assert!(ProtocolHeader::decode(b"AMQP\x00\x00\x09\x01").is_err());
    }
}
