//! Codec module - the AMQP 1.0 type system.
//!
//! - [`Value`] - tagged union over every primitive, compound and described type
//! - [`Encoder`] / [`Decoder`] - streaming writer and slice reader
//! - [`FieldList`] / [`FieldReader`] - fixed-schema composite helpers
//!
//! # Design
//!
//! [`AmqpCodec`] is a marker struct with static methods, matching the way
//! frames and performatives call into the codec without carrying state.
//!
//! # Example
//!
//! ```
//! use amqpwire::codec::{AmqpCodec, Value};
//! use bytes::BytesMut;
//!
//! let mut buf = BytesMut::new();
//! AmqpCodec::encode(&Value::from("hello"), &mut buf).unwrap();
//! let (decoded, used) = AmqpCodec::decode(&buf).unwrap();
//! assert_eq!(decoded, Value::from("hello"));
//! assert_eq!(used, buf.len());
//! ```

mod decode;
mod encode;
mod fields;
pub mod format_code;
mod value;

use bytes::BytesMut;

pub use decode::{Decoder, MAX_NESTING_DEPTH};
pub use encode::{EncodeOptions, Encoder, IntWidth};
pub use fields::{fields_value, symbols_value, unwrap_described, FieldList, FieldReader, Fields, FromValue};
pub use value::{Described, Descriptor, Symbol, Value};

use crate::error::Result;

/// AMQP type codec.
pub struct AmqpCodec;

impl AmqpCodec {
    /// Append the encoding of `value` to `buf` using the most compact
    /// integer constructors.
    pub fn encode(value: &Value, buf: &mut BytesMut) -> Result<()> {
        Encoder::new(buf, IntWidth::Smallest).write_value(value)
    }

    /// Append the encoding of `value` with an explicit integer width.
    pub fn encode_with(value: &Value, buf: &mut BytesMut, width: IntWidth) -> Result<()> {
        Encoder::new(buf, width).write_value(value)
    }

    /// Decode one value from the start of `buf`, returning it with the
    /// number of bytes consumed. `buf` is never modified.
    pub fn decode(buf: &[u8]) -> Result<(Value, usize)> {
        let mut decoder = Decoder::new(buf);
        let value = decoder.read_value()?;
        Ok((value, decoder.position()))
    }
}
