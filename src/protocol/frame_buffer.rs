//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented input:
//! - `WaitingForProtocolHeader`: need the 8-byte `AMQP x 1 0 0` header
//! - `WaitingForHeader`: need the 8-byte frame header
//! - `WaitingForBody`: header validated, need `size - 8` more bytes
//!
//! The frame size is checked against the negotiated maximum as soon as the
//! header arrives, so an oversized frame is rejected before its body is
//! buffered or decoded.
//!
//! # Example
//!
//! ```ignore
//! use amqpwire::protocol::{FrameBuffer, Incoming};
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.expect_protocol_header();
//!
//! for item in buffer.push(&chunk)? {
//!     match item {
//!         Incoming::Header(h) => println!("peer speaks {:?}", h.id),
//!         Incoming::Frame(f) => println!("frame on channel {}", f.channel()),
//!     }
//! }
//! ```

use bytes::BytesMut;

use super::frame::Frame;
use super::wire_format::{
    FrameHeader, ProtocolHeader, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, PROTOCOL_HEADER_SIZE,
};
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a protocol header.
    WaitingForProtocolHeader,
    /// Waiting for a complete 8-byte frame header.
    WaitingForHeader,
    /// Header parsed, waiting for the rest of the frame.
    WaitingForBody { header: FrameHeader },
}

/// Item extracted from the byte stream.
#[derive(Debug, Clone)]
pub enum Incoming {
    Header(ProtocolHeader),
    Frame(Frame),
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Largest frame accepted.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer expecting frames of at most the default
    /// max-frame-size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Expect an 8-byte protocol header next.
    pub fn expect_protocol_header(&mut self) {
        self.state = State::WaitingForProtocolHeader;
    }

    /// Change the accepted frame size (after `open` negotiation).
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Push data into the buffer and extract all complete items.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// `FrameSizeExceeded` if a frame header declares a size above the
    /// maximum, `MalformedEncoding` for an invalid header.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Incoming>> {
        self.buffer.extend_from_slice(data);

        let mut items = Vec::new();
        while let Some(item) = self.next_item()? {
            let is_header = matches!(item, Incoming::Header(_));
            items.push(item);
            // Phase changes after a protocol header are driven by the caller.
            if is_header {
                break;
            }
        }
        Ok(items)
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract a single item. `Ok(None)` means more data is needed.
    pub fn next_item(&mut self) -> Result<Option<Incoming>> {
        match &self.state {
            State::WaitingForProtocolHeader => {
                if self.buffer.len() < PROTOCOL_HEADER_SIZE {
                    return Ok(None);
                }
                let header = ProtocolHeader::decode(&self.buffer[..PROTOCOL_HEADER_SIZE])?;
                let _ = self.buffer.split_to(PROTOCOL_HEADER_SIZE);
                self.state = State::WaitingForHeader;
                Ok(Some(Incoming::Header(header)))
            }

            State::WaitingForHeader => {
                let header = match FrameHeader::decode(&self.buffer) {
                    Some(header) => header,
                    None => return Ok(None),
                };
                header.validate(self.max_frame_size)?;
                self.state = State::WaitingForBody { header };
                self.next_item()
            }

            State::WaitingForBody { header } => {
                let size = header.size as usize;
                if self.buffer.len() < size {
                    return Ok(None);
                }
                let header = *header;
                let mut frame = self.buffer.split_to(size);
                let body = frame.split_off(header.body_offset()).freeze();
                self.state = State::WaitingForHeader;
                Ok(Some(Incoming::Frame(Frame::new(header, body))))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForProtocolHeader => "WaitingForProtocolHeader",
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
