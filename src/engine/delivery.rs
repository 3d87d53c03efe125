//! Delivery bookkeeping: queued outgoing transfers and incoming reassembly.

use bytes::{Bytes, BytesMut};

use crate::protocol::SequenceNo;

/// A complete incoming delivery, handed to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedDelivery {
    pub delivery_id: u32,
    pub tag: Bytes,
    /// Concatenated transfer payloads (the encoded message).
    pub payload: Bytes,
    /// True if the sender settled the delivery up front.
    pub settled: bool,
    pub message_format: u32,
}

/// An outgoing message waiting for credit, window or frame space.
#[derive(Debug, Clone)]
pub(crate) struct PendingTransfer {
    pub token: u64,
    pub tag: Bytes,
    pub payload: Bytes,
    pub settled: bool,
    pub message_format: u32,
    /// Bytes of `payload` already written in earlier frames.
    pub offset: usize,
    /// Assigned when the first frame goes out.
    pub delivery_id: Option<SequenceNo>,
}

impl PendingTransfer {
    pub fn new(token: u64, payload: Bytes, settled: bool) -> Self {
        Self {
            token,
            tag: Bytes::copy_from_slice(&token.to_be_bytes()),
            payload,
            settled,
            message_format: 0,
            offset: 0,
            delivery_id: None,
        }
    }

    /// True once the first frame has been sent; the delivery can no longer
    /// be withdrawn.
    #[inline]
    pub fn started(&self) -> bool {
        self.delivery_id.is_some()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }
}

/// A multi-frame delivery being reassembled.
#[derive(Debug)]
pub(crate) struct IncomingTransfer {
    pub delivery_id: SequenceNo,
    pub tag: Bytes,
    pub settled: bool,
    pub message_format: u32,
    buf: BytesMut,
}

impl IncomingTransfer {
    pub fn new(delivery_id: SequenceNo, tag: Bytes, settled: bool, message_format: u32) -> Self {
        Self {
            delivery_id,
            tag,
            settled,
            message_format,
            buf: BytesMut::new(),
        }
    }

    pub fn append(&mut self, payload: &[u8]) {
        self.buf.extend_from_slice(payload);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> ReceivedDelivery {
        ReceivedDelivery {
            delivery_id: self.delivery_id.get(),
            tag: self.tag,
            payload: self.buf.freeze(),
            settled: self.settled,
            message_format: self.message_format,
        }
    }
}
