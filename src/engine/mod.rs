//! Protocol engine - connection, session and link state machines.
//!
//! The engine is pure state: it consumes decoded frames and application
//! commands and produces outgoing frames plus [`EngineEvent`]s into an
//! [`Output`] queue. It never touches I/O or application code; the
//! connection pump owns it and drains the output after every step.
//!
//! Ownership is by index: the connection owns sessions keyed by local
//! channel, each session owns its links keyed by local handle.

mod connection;
mod delivery;
mod link;
mod session;

use std::collections::VecDeque;

use bytes::Bytes;

use crate::codec::EncodeOptions;
use crate::protocol::{ErrorCondition, Outcome, Performative};

pub(crate) use connection::{ConnectionEngine, ConnectionState};
pub use delivery::ReceivedDelivery;
pub use link::{CreditMode, LinkOptions};
pub use session::SessionOptions;

/// A frame the engine wants written.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outgoing {
    pub channel: u16,
    pub performative: Performative,
    pub payload: Bytes,
}

/// Something the pump must route to waiting application handles.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineEvent {
    /// Open exchange finished.
    Opened,
    /// Connection closed; carries the peer's error, if any.
    Closed(Option<ErrorCondition>),
    SessionBegun {
        channel: u16,
    },
    /// Session ended (locally requested or by the peer). `tokens` are the
    /// sends that can no longer complete.
    SessionEnded {
        channel: u16,
        error: Option<ErrorCondition>,
        tokens: Vec<u64>,
    },
    LinkAttached {
        channel: u16,
        handle: u32,
    },
    LinkDetached {
        channel: u16,
        handle: u32,
        error: Option<ErrorCondition>,
        tokens: Vec<u64>,
    },
    /// A complete incoming message.
    Delivery {
        channel: u16,
        handle: u32,
        delivery: ReceivedDelivery,
    },
    /// A sent delivery reached its final outcome.
    Settled {
        token: u64,
        outcome: Outcome,
    },
    /// A drain request completed: all credit was used or returned.
    Drained {
        channel: u16,
        handle: u32,
    },
}

/// Output queue shared by all engine layers during one step.
#[derive(Debug)]
pub(crate) struct Output {
    pub frames: VecDeque<Outgoing>,
    pub events: VecDeque<EngineEvent>,
    pub encode: EncodeOptions,
    /// Negotiated maximum frame size used for transfer fragmentation.
    pub max_frame_size: u32,
}

impl Output {
    pub fn new(encode: EncodeOptions, max_frame_size: u32) -> Self {
        Self {
            frames: VecDeque::new(),
            events: VecDeque::new(),
            encode,
            max_frame_size,
        }
    }

    pub fn frame(&mut self, channel: u16, performative: impl Into<Performative>) {
        self.frames.push_back(Outgoing {
            channel,
            performative: performative.into(),
            payload: Bytes::new(),
        });
    }

    pub fn frame_with_payload(
        &mut self,
        channel: u16,
        performative: impl Into<Performative>,
        payload: Bytes,
    ) {
        self.frames.push_back(Outgoing {
            channel,
            performative: performative.into(),
            payload,
        });
    }

    pub fn event(&mut self, event: EngineEvent) {
        self.events.push_back(event);
    }
}
