//! Value encoder.
//!
//! Writes values into a `BytesMut`. Integer width is governed by
//! [`IntWidth`]: `Smallest` picks the compact constructors (`uint0`,
//! `smalluint`, ...), `Fixed` always emits the full-width constructor.
//! Compound types pick their 8-bit or 32-bit form from the encoded size.

use bytes::{BufMut, BytesMut};

use super::fields::FieldList;
use super::format_code as fc;
use super::value::{Descriptor, Value};
use crate::error::{AmqpError, Result};

/// Integer encoding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntWidth {
    /// Most compact constructor that can hold the value.
    #[default]
    Smallest,
    /// Full-width constructor regardless of value.
    Fixed,
}

/// Encoding options carried by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOptions {
    /// Width policy for integers not otherwise pinned.
    pub int_width: IntWidth,
    /// Force exact 32-bit encoding for handle, delivery-count and
    /// transfer-number fields (some peers reject compact forms there).
    pub fixed_width_fields: bool,
}

/// Streaming encoder over a byte buffer.
pub struct Encoder<'a> {
    buf: &'a mut BytesMut,
    width: IntWidth,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut BytesMut, width: IntWidth) -> Self {
        Self { buf, width }
    }

    /// Encode a value with the encoder's default integer width.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        self.write_value_with(value, self.width)
    }

    /// Encode a value with an explicit integer width.
    pub fn write_value_with(&mut self, value: &Value, width: IntWidth) -> Result<()> {
        let compact = width == IntWidth::Smallest;
        match value {
            Value::Null => self.buf.put_u8(fc::NULL),
            Value::Bool(true) => self.buf.put_u8(fc::BOOLEAN_TRUE),
            Value::Bool(false) => self.buf.put_u8(fc::BOOLEAN_FALSE),
            Value::Ubyte(v) => {
                self.buf.put_u8(fc::UBYTE);
                self.buf.put_u8(*v);
            }
            Value::Ushort(v) => {
                self.buf.put_u8(fc::USHORT);
                self.buf.put_u16(*v);
            }
            Value::Uint(v) => match *v {
                0 if compact => self.buf.put_u8(fc::UINT_0),
                1..=255 if compact => {
                    self.buf.put_u8(fc::SMALL_UINT);
                    self.buf.put_u8(*v as u8);
                }
                _ => {
                    self.buf.put_u8(fc::UINT);
                    self.buf.put_u32(*v);
                }
            },
            Value::Ulong(v) => match *v {
                0 if compact => self.buf.put_u8(fc::ULONG_0),
                1..=255 if compact => {
                    self.buf.put_u8(fc::SMALL_ULONG);
                    self.buf.put_u8(*v as u8);
                }
                _ => {
                    self.buf.put_u8(fc::ULONG);
                    self.buf.put_u64(*v);
                }
            },
            Value::Byte(v) => {
                self.buf.put_u8(fc::BYTE);
                self.buf.put_i8(*v);
            }
            Value::Short(v) => {
                self.buf.put_u8(fc::SHORT);
                self.buf.put_i16(*v);
            }
            Value::Int(v) => {
                if compact && i8::try_from(*v).is_ok() {
                    self.buf.put_u8(fc::SMALL_INT);
                    self.buf.put_i8(*v as i8);
                } else {
                    self.buf.put_u8(fc::INT);
                    self.buf.put_i32(*v);
                }
            }
            Value::Long(v) => {
                if compact && i8::try_from(*v).is_ok() {
                    self.buf.put_u8(fc::SMALL_LONG);
                    self.buf.put_i8(*v as i8);
                } else {
                    self.buf.put_u8(fc::LONG);
                    self.buf.put_i64(*v);
                }
            }
            Value::Binary(b) => self.write_variable(fc::VBIN8, fc::VBIN32, b),
            Value::String(s) => self.write_variable(fc::STR8, fc::STR32, s.as_bytes()),
            Value::Symbol(s) => self.write_variable(fc::SYM8, fc::SYM32, s.as_str().as_bytes()),
            Value::List(items) if items.is_empty() => self.buf.put_u8(fc::LIST0),
            Value::List(items) => {
                let mut body = BytesMut::new();
                let mut inner = Encoder::new(&mut body, width);
                for item in items {
                    inner.write_value(item)?;
                }
                self.write_compound(fc::LIST8, fc::LIST32, items.len(), &body);
            }
            Value::Map(entries) => {
                let mut body = BytesMut::new();
                let mut inner = Encoder::new(&mut body, width);
                for (k, v) in entries {
                    inner.write_value(k)?;
                    inner.write_value(v)?;
                }
                self.write_compound(fc::MAP8, fc::MAP32, entries.len() * 2, &body);
            }
            Value::Array(items) => self.write_array(items)?,
            Value::Described(d) => {
                self.buf.put_u8(fc::DESCRIBED);
                self.write_descriptor(&d.descriptor);
                self.write_value_with(&d.value, width)?;
            }
            // Remaining primitives have exactly one constructor.
            other => {
                let code = element_code(other, false);
                self.buf.put_u8(code);
                self.write_body(code, other)?;
            }
        }
        Ok(())
    }

    /// Encode a described list whose fields may pin their own width.
    /// Trailing null fields are omitted.
    pub fn write_composite(&mut self, code: u64, fields: &FieldList) -> Result<()> {
        self.buf.put_u8(fc::DESCRIBED);
        self.write_descriptor(&Descriptor::Code(code));

        let present = fields.encoded_len();
        if present == 0 {
            self.buf.put_u8(fc::LIST0);
            return Ok(());
        }

        let mut body = BytesMut::new();
        let mut inner = Encoder::new(&mut body, self.width);
        for (value, width) in fields.iter().take(present) {
            inner.write_value_with(value, width.unwrap_or(self.width))?;
        }
        self.write_compound(fc::LIST8, fc::LIST32, present, &body);
        Ok(())
    }

    fn write_descriptor(&mut self, descriptor: &Descriptor) {
        match descriptor {
            Descriptor::Code(code) => {
                if *code <= u8::MAX as u64 {
                    self.buf.put_u8(fc::SMALL_ULONG);
                    self.buf.put_u8(*code as u8);
                } else {
                    self.buf.put_u8(fc::ULONG);
                    self.buf.put_u64(*code);
                }
            }
            Descriptor::Symbol(s) => self.write_variable(fc::SYM8, fc::SYM32, s.as_str().as_bytes()),
        }
    }

    fn write_variable(&mut self, code8: u8, code32: u8, data: &[u8]) {
        if data.len() <= u8::MAX as usize {
            self.buf.put_u8(code8);
            self.buf.put_u8(data.len() as u8);
        } else {
            self.buf.put_u8(code32);
            self.buf.put_u32(data.len() as u32);
        }
        self.buf.extend_from_slice(data);
    }

    /// Size field covers the count plus body.
    fn write_compound(&mut self, code8: u8, code32: u8, count: usize, body: &[u8]) {
        if body.len() + 1 <= u8::MAX as usize && count <= u8::MAX as usize {
            self.buf.put_u8(code8);
            self.buf.put_u8((body.len() + 1) as u8);
            self.buf.put_u8(count as u8);
        } else {
            self.buf.put_u8(code32);
            self.buf.put_u32((body.len() + 4) as u32);
            self.buf.put_u32(count as u32);
        }
        self.buf.extend_from_slice(body);
    }

    fn write_array(&mut self, items: &[Value]) -> Result<()> {
        let mut body = BytesMut::new();
        {
            let mut inner = Encoder::new(&mut body, self.width);
            match items.first() {
                None => inner.buf.put_u8(fc::NULL),
                Some(first) => {
                    let (descriptor, code) = array_constructor(first, items)?;
                    if let Some(d) = &descriptor {
                        inner.buf.put_u8(fc::DESCRIBED);
                        inner.write_descriptor(d);
                    }
                    inner.buf.put_u8(code);
                    for item in items {
                        let element = match (&descriptor, item) {
                            (Some(_), Value::Described(d)) => &d.value,
                            _ => item,
                        };
                        inner.write_body(code, element)?;
                    }
                }
            }
        }
        self.write_compound(fc::ARRAY8, fc::ARRAY32, items.len(), &body);
        Ok(())
    }

    /// Write the body of `value` as encoded by constructor `code`.
    fn write_body(&mut self, code: u8, value: &Value) -> Result<()> {
        match (code, value) {
            (fc::NULL, Value::Null) => {}
            (fc::BOOLEAN, Value::Bool(b)) => self.buf.put_u8(*b as u8),
            (fc::UBYTE, Value::Ubyte(v)) => self.buf.put_u8(*v),
            (fc::USHORT, Value::Ushort(v)) => self.buf.put_u16(*v),
            (fc::UINT, Value::Uint(v)) => self.buf.put_u32(*v),
            (fc::ULONG, Value::Ulong(v)) => self.buf.put_u64(*v),
            (fc::BYTE, Value::Byte(v)) => self.buf.put_i8(*v),
            (fc::SHORT, Value::Short(v)) => self.buf.put_i16(*v),
            (fc::INT, Value::Int(v)) => self.buf.put_i32(*v),
            (fc::LONG, Value::Long(v)) => self.buf.put_i64(*v),
            (fc::FLOAT, Value::Float(v)) => self.buf.put_f32(*v),
            (fc::DOUBLE, Value::Double(v)) => self.buf.put_f64(*v),
            (fc::DECIMAL32, Value::Decimal32(v)) => self.buf.extend_from_slice(v),
            (fc::DECIMAL64, Value::Decimal64(v)) => self.buf.extend_from_slice(v),
            (fc::DECIMAL128, Value::Decimal128(v)) => self.buf.extend_from_slice(v),
            (fc::CHAR, Value::Char(c)) => self.buf.put_u32(*c as u32),
            (fc::TIMESTAMP, Value::Timestamp(t)) => self.buf.put_i64(*t),
            (fc::UUID, Value::Uuid(u)) => self.buf.extend_from_slice(u.as_bytes()),
            (fc::VBIN8, Value::Binary(b)) => self.put_len8(b)?,
            (fc::VBIN32, Value::Binary(b)) => self.put_len32(b),
            (fc::STR8, Value::String(s)) => self.put_len8(s.as_bytes())?,
            (fc::STR32, Value::String(s)) => self.put_len32(s.as_bytes()),
            (fc::SYM8, Value::Symbol(s)) => self.put_len8(s.as_str().as_bytes())?,
            (fc::SYM32, Value::Symbol(s)) => self.put_len32(s.as_str().as_bytes()),
            (fc::LIST32, Value::List(items)) => {
                let mut body = BytesMut::new();
                let mut inner = Encoder::new(&mut body, self.width);
                for item in items {
                    inner.write_value(item)?;
                }
                self.buf.put_u32((body.len() + 4) as u32);
                self.buf.put_u32(items.len() as u32);
                self.buf.extend_from_slice(&body);
            }
            (fc::MAP32, Value::Map(entries)) => {
                let mut body = BytesMut::new();
                let mut inner = Encoder::new(&mut body, self.width);
                for (k, v) in entries {
                    inner.write_value(k)?;
                    inner.write_value(v)?;
                }
                self.buf.put_u32((body.len() + 4) as u32);
                self.buf.put_u32((entries.len() * 2) as u32);
                self.buf.extend_from_slice(&body);
            }
            (fc::ARRAY32, Value::Array(items)) => {
                let mut nested = BytesMut::new();
                Encoder::new(&mut nested, self.width).write_array(items)?;
                // Re-frame the nested array as array32 without its constructor.
                let mut reframed = BytesMut::new();
                let (count, payload) = split_array(&nested)?;
                reframed.put_u32((payload.len() + 4) as u32);
                reframed.put_u32(count);
                reframed.extend_from_slice(payload);
                self.buf.extend_from_slice(&reframed);
            }
            (code, value) => {
                return Err(AmqpError::MalformedEncoding(format!(
                    "array element of type {} does not match constructor 0x{:02x}",
                    value.type_name(),
                    code
                )))
            }
        }
        Ok(())
    }

    fn put_len8(&mut self, data: &[u8]) -> Result<()> {
        let len = u8::try_from(data.len()).map_err(|_| {
            AmqpError::MalformedEncoding("array element exceeds 8-bit width".into())
        })?;
        self.buf.put_u8(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn put_len32(&mut self, data: &[u8]) {
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }
}

/// Split an encoded array (array8 or array32) into its element count and
/// the constructor + elements payload.
fn split_array(encoded: &[u8]) -> Result<(u32, &[u8])> {
    match encoded.first() {
        Some(&fc::ARRAY8) if encoded.len() >= 3 => Ok((encoded[2] as u32, &encoded[3..])),
        Some(&fc::ARRAY32) if encoded.len() >= 9 => {
            let count = u32::from_be_bytes([encoded[5], encoded[6], encoded[7], encoded[8]]);
            Ok((count, &encoded[9..]))
        }
        _ => Err(AmqpError::MalformedEncoding("invalid nested array".into())),
    }
}

/// Constructor shared by every element of an array.
fn array_constructor(first: &Value, items: &[Value]) -> Result<(Option<Descriptor>, u8)> {
    if let Value::Described(d) = first {
        let descriptor = d.descriptor.clone();
        let mut inner = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Described(e) if e.descriptor == descriptor => inner.push(e.value.clone()),
                other => {
                    return Err(AmqpError::MalformedEncoding(format!(
                        "heterogeneous array: described element mixed with {}",
                        other.type_name()
                    )))
                }
            }
        }
        let (_, code) = array_constructor(&inner[0], &inner)?;
        return Ok((Some(descriptor), code));
    }

    let wide = items.iter().any(|v| match v {
        Value::Binary(b) => b.len() > u8::MAX as usize,
        Value::String(s) => s.len() > u8::MAX as usize,
        Value::Symbol(s) => s.len() > u8::MAX as usize,
        _ => false,
    });
    let code = element_code(first, wide);
    for item in items {
        if std::mem::discriminant(item) != std::mem::discriminant(first) {
            return Err(AmqpError::MalformedEncoding(format!(
                "heterogeneous array: {} mixed with {}",
                first.type_name(),
                item.type_name()
            )));
        }
    }
    Ok((None, code))
}

/// Full-width constructor for a value when written as an array element.
fn element_code(value: &Value, wide: bool) -> u8 {
    match value {
        Value::Null => fc::NULL,
        Value::Bool(_) => fc::BOOLEAN,
        Value::Ubyte(_) => fc::UBYTE,
        Value::Ushort(_) => fc::USHORT,
        Value::Uint(_) => fc::UINT,
        Value::Ulong(_) => fc::ULONG,
        Value::Byte(_) => fc::BYTE,
        Value::Short(_) => fc::SHORT,
        Value::Int(_) => fc::INT,
        Value::Long(_) => fc::LONG,
        Value::Float(_) => fc::FLOAT,
        Value::Double(_) => fc::DOUBLE,
        Value::Decimal32(_) => fc::DECIMAL32,
        Value::Decimal64(_) => fc::DECIMAL64,
        Value::Decimal128(_) => fc::DECIMAL128,
        Value::Char(_) => fc::CHAR,
        Value::Timestamp(_) => fc::TIMESTAMP,
        Value::Uuid(_) => fc::UUID,
        Value::Binary(_) if wide => fc::VBIN32,
        Value::Binary(_) => fc::VBIN8,
        Value::String(_) if wide => fc::STR32,
        Value::String(_) => fc::STR8,
        Value::Symbol(_) if wide => fc::SYM32,
        Value::Symbol(_) => fc::SYM8,
        Value::List(_) => fc::LIST32,
        Value::Map(_) => fc::MAP32,
        Value::Array(_) => fc::ARRAY32,
        Value::Described(_) => fc::DESCRIBED,
    }
}
