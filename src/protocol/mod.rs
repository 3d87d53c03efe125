//! Protocol module - framing, performatives and message format.
//!
//! - 8-byte frame header and protocol header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Typed performatives, SASL frames, delivery states and termini
//! - Message sections
//! - Serial number arithmetic

mod definitions;
mod delivery_state;
mod frame;
mod frame_buffer;
mod message;
mod performative;
mod sasl;
mod sequence;
mod terminus;
mod wire_format;

pub use definitions::{conditions, ErrorCondition, ReceiverSettleMode, Role, SenderSettleMode};
pub use delivery_state::{DeliveryState, Modified, Outcome};
pub use frame::{
    build_amqp_frame, build_frame_parts, build_sasl_frame, encode_amqp_body, heartbeat_frame,
    AmqpFrame, Frame,
};
pub use frame_buffer::{FrameBuffer, Incoming};
pub use message::{section, Annotations, Body, Header, Message, Properties};
pub use performative::{
    code, Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
pub use sasl::{SaslCode, SaslFrame, SaslInit, SaslMechanisms, SaslOutcome};
pub use sequence::SequenceNo;
pub use terminus::{Source, Target, TerminusDurability};
pub use wire_format::{
    frame_type, FrameHeader, ProtocolHeader, ProtocolId, DEFAULT_CHANNEL_MAX,
    DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, MIN_MAX_FRAME_SIZE, PROTOCOL_HEADER_SIZE,
};
