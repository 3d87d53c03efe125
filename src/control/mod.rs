//! Control module - everything that happens before the first AMQP frame.
//!
//! The handshake exchanges protocol headers and, when a SASL profile is
//! configured, runs the SASL layer in between. After the AMQP header is
//! agreed, the stream belongs to the connection pump.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use amqpwire::control::{handshake, Plain};
//! use amqpwire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//! handshake(&mut stream, &mut buffer, Some(Arc::new(Plain::new("guest", "guest"))), None).await?;
//! ```

mod handshake;
mod sasl;

pub use handshake::handshake;
pub(crate) use handshake::read_item;
pub use sasl::{
    Anonymous, External, Plain, SaslMechanism, SaslNegotiator, SaslProfile, SaslState,
};
