//! Value decoder.
//!
//! Decoding works over a borrowed slice with a private cursor, so a failed
//! decode never consumes bytes the caller owns. Every declared size is
//! checked against the remaining input before it is trusted.

use bytes::Bytes;
use uuid::Uuid;

use super::format_code as fc;
use super::value::{Described, Descriptor, Symbol, Value};
use crate::error::{AmqpError, Result};

/// Maximum nesting of compound and described values.
pub const MAX_NESTING_DEPTH: usize = 512;

/// Arrays of zero-width elements (e.g. nulls) occupy no body bytes, so
/// their count cannot be checked against the input length.
const MAX_ZERO_WIDTH_ELEMENTS: usize = 65_536;

/// Cursor-based decoder over a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            depth: 0,
        }
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Decode the next value.
    pub fn read_value(&mut self) -> Result<Value> {
        let code = self.read_u8()?;
        if code == fc::DESCRIBED {
            return self.read_described();
        }
        self.read_body(code)
    }

    fn read_described(&mut self) -> Result<Value> {
        self.enter()?;
        let descriptor = self.read_descriptor()?;
        let value = self.read_value()?;
        self.depth -= 1;
        Ok(Value::Described(Box::new(Described { descriptor, value })))
    }

    fn read_descriptor(&mut self) -> Result<Descriptor> {
        match self.read_value()? {
            Value::Ulong(code) => Ok(Descriptor::Code(code)),
            Value::Symbol(s) => Ok(Descriptor::Symbol(s)),
            other => Err(malformed(format!(
                "descriptor must be ulong or symbol, got {}",
                other.type_name()
            ))),
        }
    }

    /// Decode the body for constructor `code`.
    fn read_body(&mut self, code: u8) -> Result<Value> {
        let value = match code {
            fc::NULL => Value::Null,
            fc::BOOLEAN_TRUE => Value::Bool(true),
            fc::BOOLEAN_FALSE => Value::Bool(false),
            fc::BOOLEAN => match self.read_u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(malformed(format!("invalid boolean byte 0x{:02x}", other))),
            },
            fc::UBYTE => Value::Ubyte(self.read_u8()?),
            fc::USHORT => Value::Ushort(u16::from_be_bytes(self.read_array()?)),
            fc::UINT => Value::Uint(u32::from_be_bytes(self.read_array()?)),
            fc::SMALL_UINT => Value::Uint(self.read_u8()? as u32),
            fc::UINT_0 => Value::Uint(0),
            fc::ULONG => Value::Ulong(u64::from_be_bytes(self.read_array()?)),
            fc::SMALL_ULONG => Value::Ulong(self.read_u8()? as u64),
            fc::ULONG_0 => Value::Ulong(0),
            fc::BYTE => Value::Byte(self.read_u8()? as i8),
            fc::SHORT => Value::Short(i16::from_be_bytes(self.read_array()?)),
            fc::INT => Value::Int(i32::from_be_bytes(self.read_array()?)),
            fc::SMALL_INT => Value::Int(self.read_u8()? as i8 as i32),
            fc::LONG => Value::Long(i64::from_be_bytes(self.read_array()?)),
            fc::SMALL_LONG => Value::Long(self.read_u8()? as i8 as i64),
            fc::FLOAT => Value::Float(f32::from_be_bytes(self.read_array()?)),
            fc::DOUBLE => Value::Double(f64::from_be_bytes(self.read_array()?)),
            fc::DECIMAL32 => Value::Decimal32(self.read_array()?),
            fc::DECIMAL64 => Value::Decimal64(self.read_array()?),
            fc::DECIMAL128 => Value::Decimal128(self.read_array()?),
            fc::CHAR => {
                let raw = u32::from_be_bytes(self.read_array()?);
                let c = char::from_u32(raw)
                    .ok_or_else(|| malformed(format!("invalid char 0x{:x}", raw)))?;
                Value::Char(c)
            }
            fc::TIMESTAMP => Value::Timestamp(i64::from_be_bytes(self.read_array()?)),
            fc::UUID => Value::Uuid(Uuid::from_bytes(self.read_array()?)),
            fc::VBIN8 => {
                let len = self.read_u8()? as usize;
                Value::Binary(Bytes::copy_from_slice(self.take(len)?))
            }
            fc::VBIN32 => {
                let len = self.read_u32()? as usize;
                Value::Binary(Bytes::copy_from_slice(self.take(len)?))
            }
            fc::STR8 => {
                let len = self.read_u8()? as usize;
                Value::String(self.read_utf8(len)?)
            }
            fc::STR32 => {
                let len = self.read_u32()? as usize;
                Value::String(self.read_utf8(len)?)
            }
            fc::SYM8 => {
                let len = self.read_u8()? as usize;
                Value::Symbol(Symbol::new(self.read_utf8(len)?))
            }
            fc::SYM32 => {
                let len = self.read_u32()? as usize;
                Value::Symbol(Symbol::new(self.read_utf8(len)?))
            }
            fc::LIST0 => Value::List(Vec::new()),
            fc::LIST8 | fc::LIST32 => {
                let (count, body) = self.read_compound_header(code == fc::LIST32)?;
                Value::List(self.read_items(count, body)?)
            }
            fc::MAP8 | fc::MAP32 => {
                let (count, body) = self.read_compound_header(code == fc::MAP32)?;
                if count % 2 != 0 {
                    return Err(malformed(format!("map with odd element count {}", count)));
                }
                let mut items = self.read_items(count, body)?.into_iter();
                let mut entries = Vec::with_capacity(count / 2);
                while let (Some(k), Some(v)) = (items.next(), items.next()) {
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            fc::ARRAY8 | fc::ARRAY32 => {
                let (count, body) = self.read_compound_header(code == fc::ARRAY32)?;
                Value::Array(self.read_array_elements(count, body)?)
            }
            other => return Err(malformed(format!("unknown format code 0x{:02x}", other))),
        };
        Ok(value)
    }

    /// Read size and count of a compound, returning the count and the body
    /// slice (which excludes the count field). The cursor moves past the body.
    fn read_compound_header(&mut self, wide: bool) -> Result<(usize, &'a [u8])> {
        let (size, count_width) = if wide {
            (self.read_u32()? as usize, 4)
        } else {
            (self.read_u8()? as usize, 1)
        };
        if size < count_width {
            return Err(malformed(format!(
                "compound size {} smaller than its count field",
                size
            )));
        }
        let region = self.take(size)?;
        let (count, body) = if wide {
            let count = u32::from_be_bytes([region[0], region[1], region[2], region[3]]);
            (count as usize, &region[4..])
        } else {
            (region[0] as usize, &region[1..])
        };
        Ok((count, body))
    }

    fn read_items(&mut self, count: usize, body: &'a [u8]) -> Result<Vec<Value>> {
        // Every encoded value occupies at least one byte.
        if count > body.len() {
            return Err(malformed(format!(
                "compound declares {} elements in {} bytes",
                count,
                body.len()
            )));
        }
        self.enter()?;
        let mut inner = Decoder {
            buf: body,
            pos: 0,
            depth: self.depth,
        };
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(inner.read_value()?);
        }
        if inner.remaining() != 0 {
            return Err(malformed(format!(
                "{} trailing bytes inside compound",
                inner.remaining()
            )));
        }
        self.depth -= 1;
        Ok(items)
    }

    fn read_array_elements(&mut self, count: usize, body: &'a [u8]) -> Result<Vec<Value>> {
        self.enter()?;
        let mut inner = Decoder {
            buf: body,
            pos: 0,
            depth: self.depth,
        };
        let mut code = inner.read_u8()?;
        let mut descriptor = None;
        if code == fc::DESCRIBED {
            descriptor = Some(inner.read_descriptor()?);
            code = inner.read_u8()?;
        }
        if fc::fixed_width(code) == Some(0) && count > MAX_ZERO_WIDTH_ELEMENTS {
            return Err(malformed(format!(
                "array of {} zero-width elements exceeds limit",
                count
            )));
        }
        if let Some(width) = fc::fixed_width(code) {
            if width > 0 && count.saturating_mul(width) > inner.remaining() {
                return Err(malformed(format!(
                    "array declares {} elements of {} bytes in {} bytes",
                    count,
                    width,
                    inner.remaining()
                )));
            }
        }

        let mut items = Vec::with_capacity(count.min(inner.remaining() + 1));
        for _ in 0..count {
            let element = inner.read_body(code)?;
            items.push(match &descriptor {
                Some(d) => Value::Described(Box::new(Described {
                    descriptor: d.clone(),
                    value: element,
                })),
                None => element,
            });
        }
        if inner.remaining() != 0 {
            return Err(malformed(format!(
                "{} trailing bytes inside array",
                inner.remaining()
            )));
        }
        self.depth -= 1;
        Ok(items)
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(malformed(format!(
                "nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(malformed(format!(
                "need {} bytes, only {} remaining",
                n,
                self.remaining()
            )));
        }
        let buf: &'a [u8] = self.buf;
        let slice = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| malformed(format!("invalid UTF-8: {}", e)))
    }
}

fn malformed(msg: String) -> AmqpError {
    AmqpError::MalformedEncoding(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<Value> {
        Decoder::new(bytes).read_value()
    }

    #[test]
    fn test_compact_forms_widen() {
        assert_eq!(decode(&[0x43]).unwrap(), Value::Uint(0));
        assert_eq!(decode(&[0x52, 9]).unwrap(), Value::Uint(9));
        assert_eq!(decode(&[0x44]).unwrap(), Value::Ulong(0));
        assert_eq!(decode(&[0x54, 0xfe]).unwrap(), Value::Int(-2));
        assert_eq!(decode(&[0x55, 0x80]).unwrap(), Value::Long(-128));
    }

    #[test]
    fn test_unknown_code_is_malformed() {
        let err = decode(&[0x3f]).unwrap_err();
        assert!(err.to_string().contains("unknown format code 0x3f"));
    }

    #[test]
    fn test_declared_size_past_buffer() {
        // str8 claiming 10 bytes with only 2 present
        let err = decode(&[0xa1, 10, b'h', b'i']).unwrap_err();
        assert!(matches!(err, AmqpError::MalformedEncoding(_)));

        // list32 claiming a huge size
        let err = decode(&[0xd0, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, AmqpError::MalformedEncoding(_)));
    }

    #[test]
    fn test_list_count_larger_than_body() {
        let err = decode(&[0xc0, 2, 5, 0x40]).unwrap_err();
        assert!(err.to_string().contains("declares 5 elements"));
    }

    #[test]
    fn test_trailing_bytes_in_list() {
        let err = decode(&[0xc0, 3, 1, 0x40, 0x40]).unwrap_err();
        assert!(err.to_string().contains("trailing bytes"));
    }

    #[test]
    fn test_map_with_odd_count() {
        let err = decode(&[0xc1, 2, 1, 0x40]).unwrap_err();
        assert!(err.to_string().contains("odd element count"));
    }

    #[test]
    fn test_described_value() {
        let value = decode(&[0x00, 0x53, 0x24, 0x45]).unwrap();
        match value {
            Value::Described(d) => {
                assert_eq!(d.descriptor, Descriptor::Code(0x24));
                assert_eq!(d.value, Value::List(vec![]));
            }
            other => panic!("expected described, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_descriptor_type() {
        let err = decode(&[0x00, 0xa1, 1, b'x', 0x40]).unwrap_err();
        assert!(err.to_string().contains("descriptor must be ulong or symbol"));
    }

    #[test]
    fn test_position_tracks_consumed_bytes() {
        let bytes = [0x52, 1, 0x41, 0xff];
        let mut decoder = Decoder::new(&bytes);
        decoder.read_value().unwrap();
        assert_eq!(decoder.position(), 2);
        decoder.read_value().unwrap();
        assert_eq!(decoder.position(), 3);
        assert!(decoder.read_value().is_err());
    }

    #[test]
    fn test_array_element_overflow() {
        // array8 of 50 uints in 6 bytes
        let err = decode(&[0xe0, 6, 50, 0x70, 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, AmqpError::MalformedEncoding(_)));
    }

    #[test]
    fn test_nesting_limit() {
        let mut bytes = Vec::new();
        for _ in 0..(MAX_NESTING_DEPTH + 10) {
            bytes.extend_from_slice(&[0x00, 0x53, 0x01]);
        }
        bytes.push(0x40);
        let err = decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("nesting deeper"));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = decode(&[0xa1, 2, 0xff, 0xfe]).unwrap_err();
        assert!(err.to_string().contains("invalid UTF-8"));
    }
}
