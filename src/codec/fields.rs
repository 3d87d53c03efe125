//! Composite field helpers.
//!
//! Performatives and message sections are described lists with a fixed
//! schema. [`FieldList`] collects fields for encoding (with optional
//! per-field integer width), [`FieldReader`] walks a decoded list in schema
//! order, yielding `Null` once the encoded fields run out.

use bytes::Bytes;

use super::encode::IntWidth;
use super::value::{Descriptor, Symbol, Value};
use crate::error::{AmqpError, Result};

/// Symbol-keyed map used for `properties` fields.
pub type Fields = Vec<(Symbol, Value)>;

/// Ordered list of composite fields awaiting encoding.
#[derive(Debug, Clone, Default)]
pub struct FieldList {
    fields: Vec<(Value, Option<IntWidth>)>,
}

impl FieldList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field using the encoder's default width.
    pub fn push(&mut self, value: impl Into<Value>) -> &mut Self {
        self.fields.push((value.into(), None));
        self
    }

    /// Append a field, pinning it to the fixed-width constructor when
    /// `exact` is set.
    pub fn push_exact(&mut self, value: impl Into<Value>, exact: bool) -> &mut Self {
        let width = if exact { Some(IntWidth::Fixed) } else { None };
        self.fields.push((value.into(), width));
        self
    }

    /// Number of fields that will be written (trailing nulls dropped).
    pub fn encoded_len(&self) -> usize {
        self.fields
            .iter()
            .rposition(|(v, _)| !v.is_null())
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, Option<IntWidth>)> {
        self.fields.iter().map(|(v, w)| (v, *w))
    }

    /// Convert into a described list value (widths are dropped).
    pub fn into_described(self, code: u64) -> Value {
        let len = self.encoded_len();
        let items = self.fields.into_iter().take(len).map(|(v, _)| v).collect();
        Value::described(code, Value::List(items))
    }
}

/// Reads composite fields in schema order.
pub struct FieldReader {
    name: &'static str,
    fields: std::vec::IntoIter<Value>,
    index: usize,
}

impl FieldReader {
    /// Unwrap a described list, checking the descriptor and the schema arity.
    pub fn new(value: Value, code: u64, name: &'static str, arity: usize) -> Result<Self> {
        let described = match value {
            Value::Described(d) => *d,
            other => {
                return Err(AmqpError::MalformedEncoding(format!(
                    "expected described {}, got {}",
                    name,
                    other.type_name()
                )))
            }
        };
        if !described.descriptor.matches(code, &format!("amqp:{}:list", name)) {
            return Err(AmqpError::MalformedEncoding(format!(
                "expected {} descriptor, got {:?}",
                name, described.descriptor
            )));
        }
        Self::from_list(described.value, name, arity)
    }

    /// Read fields from a bare list value.
    pub fn from_list(value: Value, name: &'static str, arity: usize) -> Result<Self> {
        let list = match value {
            Value::List(items) => items,
            other => {
                return Err(AmqpError::MalformedEncoding(format!(
                    "{} body must be a list, got {}",
                    name,
                    other.type_name()
                )))
            }
        };
        if list.len() > arity {
            return Err(AmqpError::MalformedEncoding(format!(
                "{} has {} fields, schema allows {}",
                name,
                list.len(),
                arity
            )));
        }
        Ok(Self {
            name,
            fields: list.into_iter(),
            index: 0,
        })
    }

    /// Next raw field; `Null` once the encoded list is exhausted.
    pub fn next_value(&mut self) -> Value {
        self.index += 1;
        self.fields.next().unwrap_or(Value::Null)
    }

    pub fn optional<T: FromValue>(&mut self) -> Result<Option<T>> {
        let index = self.index;
        match self.next_value() {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some).map_err(|e| self.field_error(index, e)),
        }
    }

    pub fn required<T: FromValue>(&mut self, field: &'static str) -> Result<T> {
        self.optional()?.ok_or_else(|| {
            AmqpError::MalformedEncoding(format!(
                "{}: mandatory field {} is missing",
                self.name, field
            ))
        })
    }

    pub fn or_default<T: FromValue>(&mut self, default: T) -> Result<T> {
        Ok(self.optional()?.unwrap_or(default))
    }

    fn field_error(&self, index: usize, err: AmqpError) -> AmqpError {
        AmqpError::MalformedEncoding(format!("{} field {}: {}", self.name, index, err))
    }
}

/// Conversion from a decoded value into a typed field.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

fn mismatch(expected: &str, got: &Value) -> AmqpError {
    AmqpError::MalformedEncoding(format!("expected {}, got {}", expected, got.type_name()))
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("boolean", &other)),
        }
    }
}

impl FromValue for u8 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Ubyte(v) => Ok(v),
            other => Err(mismatch("ubyte", &other)),
        }
    }
}

impl FromValue for u16 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Ushort(v) => Ok(v),
            Value::Ubyte(v) => Ok(v as u16),
            other => Err(mismatch("ushort", &other)),
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Uint(v) => Ok(v),
            Value::Ushort(v) => Ok(v as u32),
            Value::Ubyte(v) => Ok(v as u32),
            other => Err(mismatch("uint", &other)),
        }
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self> {
        value.as_u64().ok_or_else(|| mismatch("ulong", &value))
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl FromValue for Symbol {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Symbol(s) => Ok(s),
            other => Err(mismatch("symbol", &other)),
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Binary(b) => Ok(b),
            other => Err(mismatch("binary", &other)),
        }
    }
}

/// Timestamps arrive as milliseconds since the epoch.
impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Timestamp(t) | Value::Long(t) => Ok(t),
            other => Err(mismatch("timestamp", &other)),
        }
    }
}

/// Multiple-valued symbol fields may be a single symbol or an array.
impl FromValue for Vec<Symbol> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Symbol(s) => Ok(vec![s]),
            Value::Array(items) => items.into_iter().map(Symbol::from_value).collect(),
            other => Err(mismatch("symbol array", &other)),
        }
    }
}

impl FromValue for Fields {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((Symbol::from_value(k)?, v)))
                .collect(),
            other => Err(mismatch("fields map", &other)),
        }
    }
}

impl FromValue for Vec<Value> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => Ok(items),
            other => Err(mismatch("list", &other)),
        }
    }
}

/// Encode a symbol slice as an array (or null when empty).
pub fn symbols_value(symbols: &[Symbol]) -> Value {
    if symbols.is_empty() {
        Value::Null
    } else {
        Value::Array(symbols.iter().cloned().map(Value::Symbol).collect())
    }
}

/// Encode a fields map (or null when absent).
pub fn fields_value(fields: &Option<Fields>) -> Value {
    match fields {
        Some(f) => Value::Map(
            f.iter()
                .map(|(k, v)| (Value::Symbol(k.clone()), v.clone()))
                .collect(),
        ),
        None => Value::Null,
    }
}

/// Strip a described wrapper, returning the descriptor and inner value.
pub fn unwrap_described(value: Value) -> Result<(Descriptor, Value)> {
    match value {
        Value::Described(d) => Ok((d.descriptor, d.value)),
        other => Err(mismatch("described type", &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len_trims_trailing_nulls() {
        let mut list = FieldList::new();
        list.push(Value::Null).push(1u32).push(Value::Null).push(Value::Null);
        assert_eq!(list.encoded_len(), 2);
        assert_eq!(FieldList::new().encoded_len(), 0);
    }

    #[test]
    fn test_reader_defaults_missing_fields() {
        let value = Value::described(0x11u64, Value::List(vec![Value::Uint(5)]));
        let mut reader = FieldReader::new(value, 0x11, "begin", 8).unwrap();
        assert_eq!(reader.optional::<u32>().unwrap(), Some(5));
        assert_eq!(reader.optional::<u32>().unwrap(), None);
        assert_eq!(reader.or_default(7u32).unwrap(), 7);
    }

    #[test]
    fn test_reader_rejects_excess_arity() {
        let value = Value::described(0x17u64, Value::List(vec![Value::Null, Value::Null]));
        let err = FieldReader::new(value, 0x17, "end", 1).err().unwrap();
        assert!(err.to_string().contains("schema allows 1"));
    }

    #[test]
    fn test_reader_wrong_descriptor() {
        let value = Value::described(0x12u64, Value::List(vec![]));
        assert!(FieldReader::new(value, 0x10, "open", 10).is_err());
    }

    #[test]
    fn test_reader_symbolic_descriptor() {
        let value = Value::described(
            Descriptor::Symbol(Symbol::from("amqp:end:list")),
            Value::List(vec![]),
        );
        assert!(FieldReader::new(value, 0x17, "end", 1).is_ok());
    }

    #[test]
    fn test_required_missing() {
        let value = Value::described(0x10u64, Value::List(vec![]));
        let mut reader = FieldReader::new(value, 0x10, "open", 10).unwrap();
        let err = reader.required::<String>("container-id").unwrap_err();
        assert!(err.to_string().contains("container-id"));
    }

    #[test]
    fn test_type_mismatch_names_field() {
        let value = Value::described(0x10u64, Value::List(vec![Value::Uint(1)]));
        let mut reader = FieldReader::new(value, 0x10, "open", 10).unwrap();
        let err = reader.optional::<String>().unwrap_err();
        assert!(err.to_string().contains("open field 0"));
    }

    #[test]
    fn test_symbol_array_accepts_single() {
        let single = Vec::<Symbol>::from_value(Value::Symbol("PLAIN".into())).unwrap();
        assert_eq!(single, vec![Symbol::from("PLAIN")]);
    }
}
