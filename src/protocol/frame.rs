//! Frame struct and typed body decoding.
//!
//! A [`Frame`] is the raw unit read off the wire: an 8-byte header plus a
//! body (extended header already skipped). The body is decoded lazily into
//! an [`AmqpFrame`] or a [`SaslFrame`] depending on the frame type.
//!
//! # Example
//!
//! ```
//! use amqpwire::codec::EncodeOptions;
//! use amqpwire::protocol::{build_amqp_frame, End, FrameBuffer, Incoming, Performative};
//!
//! let bytes = build_amqp_frame(3, &Performative::End(End::default()), &[], &EncodeOptions::default()).unwrap();
//! let mut buffer = FrameBuffer::new();
//! let items = buffer.push(&bytes).unwrap();
//! let Incoming::Frame(frame) = &items[0] else { panic!() };
//! let amqp = frame.decode_amqp().unwrap();
//! assert_eq!(amqp.channel, 3);
//! assert!(matches!(amqp.performative, Some(Performative::End(_))));
//! ```

use bytes::{Bytes, BytesMut};

use super::performative::Performative;
use super::sasl::SaslFrame;
use super::wire_format::{frame_type, FrameHeader, FRAME_HEADER_SIZE};
use crate::codec::{Decoder, EncodeOptions, FromValue};
use crate::error::{AmqpError, Result};

/// A complete frame as read from the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Frame body (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

/// A decoded AMQP frame. `performative` is `None` for an empty
/// (heartbeat) frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpFrame {
    pub channel: u16,
    pub performative: Option<Performative>,
    /// Bytes following the performative (transfer payload).
    pub payload: Bytes,
}

impl AmqpFrame {
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.performative.is_none()
    }
}

impl Frame {
    pub fn new(header: FrameHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    #[inline]
    pub fn channel(&self) -> u16 {
        self.header.channel
    }

    #[inline]
    pub fn is_sasl(&self) -> bool {
        self.header.is_sasl()
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Decode the body as an AMQP performative plus optional payload.
    pub fn decode_amqp(&self) -> Result<AmqpFrame> {
        if self.header.frame_type != frame_type::AMQP {
            return Err(AmqpError::Protocol(format!(
                "expected AMQP frame, got type 0x{:02x}",
                self.header.frame_type
            )));
        }
        if self.body.is_empty() {
            return Ok(AmqpFrame {
                channel: self.header.channel,
                performative: None,
                payload: Bytes::new(),
            });
        }

        let mut decoder = Decoder::new(&self.body);
        let performative = Performative::from_value(decoder.read_value()?)?;
        let payload = self.body.slice(decoder.position()..);
        if !payload.is_empty() && !matches!(performative, Performative::Transfer(_)) {
            return Err(AmqpError::MalformedEncoding(format!(
                "{} frame carries {} trailing bytes",
                performative.name(),
                payload.len()
            )));
        }

        Ok(AmqpFrame {
            channel: self.header.channel,
            performative: Some(performative),
            payload,
        })
    }

    /// Decode the body as a SASL frame.
    pub fn decode_sasl(&self) -> Result<SaslFrame> {
        if !self.is_sasl() {
            return Err(AmqpError::Protocol(format!(
                "expected SASL frame, got type 0x{:02x}",
                self.header.frame_type
            )));
        }
        let mut decoder = Decoder::new(&self.body);
        let frame = SaslFrame::from_value(decoder.read_value()?)?;
        if decoder.remaining() != 0 {
            return Err(AmqpError::MalformedEncoding(format!(
                "{} frame carries {} trailing bytes",
                frame.name(),
                decoder.remaining()
            )));
        }
        Ok(frame)
    }
}

/// Encode a performative followed by its payload into a frame body.
pub fn encode_amqp_body(
    performative: &Performative,
    payload: &[u8],
    opts: &EncodeOptions,
) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + payload.len());
    performative.encode(&mut buf, opts)?;
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Build frame parts for scatter/gather I/O: the encoded header and the body.
pub fn build_frame_parts(frame_type: u8, channel: u16, body: Bytes) -> ([u8; FRAME_HEADER_SIZE], Bytes) {
    let header = FrameHeader::new(frame_type, channel, body.len());
    (header.encode(), body)
}

/// Build a complete AMQP frame as a single byte vector.
pub fn build_amqp_frame(
    channel: u16,
    performative: &Performative,
    payload: &[u8],
    opts: &EncodeOptions,
) -> Result<Vec<u8>> {
    let body = encode_amqp_body(performative, payload, opts)?;
    Ok(concat(build_frame_parts(frame_type::AMQP, channel, body)))
}

/// Build a complete SASL frame as a single byte vector.
pub fn build_sasl_frame(frame: &SaslFrame) -> Result<Vec<u8>> {
    let mut body = BytesMut::new();
    frame.encode(&mut body)?;
    Ok(concat(build_frame_parts(frame_type::SASL, 0, body.freeze())))
}

/// An empty AMQP frame on channel 0, used as a heartbeat.
pub fn heartbeat_frame() -> [u8; FRAME_HEADER_SIZE] {
    FrameHeader::new(frame_type::AMQP, 0, 0).encode()
}

fn concat((header, body): ([u8; FRAME_HEADER_SIZE], Bytes)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&body);
    buf
}
