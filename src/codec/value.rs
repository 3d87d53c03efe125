//! The AMQP value model.
//!
//! [`Value`] is a tagged union over every AMQP primitive plus the
//! list/map/array containers and described types. Maps keep wire order;
//! lookups return the first matching key.

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// Symbolic value (ASCII string from a constrained domain).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol from any string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the symbol text.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the symbol is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Descriptor of a described type: numeric code or symbolic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// 64-bit numeric code (domain-id << 32 | descriptor-id).
    Code(u64),
    /// Symbolic descriptor such as `amqp:open:list`.
    Symbol(Symbol),
}

impl Descriptor {
    /// True if this descriptor names the given code or symbol.
    pub fn matches(&self, code: u64, name: &str) -> bool {
        match self {
            Descriptor::Code(c) => *c == code,
            Descriptor::Symbol(s) => s.as_str() == name,
        }
    }
}

impl From<u64> for Descriptor {
    fn from(code: u64) -> Self {
        Descriptor::Code(code)
    }
}

/// A descriptor paired with the value it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Described {
    pub descriptor: Descriptor,
    pub value: Value,
}

impl Described {
    pub fn new(descriptor: impl Into<Descriptor>, value: Value) -> Self {
        Self {
            descriptor: descriptor.into(),
            value,
        }
    }
}

/// Any AMQP value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal32([u8; 4]),
    Decimal64([u8; 8]),
    Decimal128([u8; 16]),
    Char(char),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    Binary(Bytes),
    String(String),
    Symbol(Symbol),
    List(Vec<Value>),
    /// Ordered key/value pairs; duplicate keys are preserved.
    Map(Vec<(Value, Value)>),
    /// Homogeneous sequence; every element shares one constructor.
    Array(Vec<Value>),
    Described(Box<Described>),
}

impl Value {
    /// Build a described value.
    pub fn described(descriptor: impl Into<Descriptor>, value: Value) -> Self {
        Value::Described(Box::new(Described::new(descriptor, value)))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the AMQP type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Ubyte(_) => "ubyte",
            Value::Ushort(_) => "ushort",
            Value::Uint(_) => "uint",
            Value::Ulong(_) => "ulong",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Decimal32(_) => "decimal32",
            Value::Decimal64(_) => "decimal64",
            Value::Decimal128(_) => "decimal128",
            Value::Char(_) => "char",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Binary(_) => "binary",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
            Value::Described(_) => "described",
        }
    }

    /// Look up a map entry by key. The first matching key wins.
    pub fn map_get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Unsigned view of any unsigned integer variant.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Ubyte(v) => Some(v as u64),
            Value::Ushort(v) => Some(v as u64),
            Value::Uint(v) => Some(v as u64),
            Value::Ulong(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::Symbol(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Ubyte(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Ushort(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Ulong(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Symbol> for Value {
    fn from(v: Symbol) -> Self {
        Value::Symbol(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Binary(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_get_first_key_wins() {
        let map = Value::Map(vec![
            (Value::from("k"), Value::Int(1)),
            (Value::from("k"), Value::Int(2)),
        ]);
        assert_eq!(map.map_get(&Value::from("k")), Some(&Value::Int(1)));
        assert_eq!(map.map_get(&Value::from("missing")), None);
    }

    #[test]
    fn test_descriptor_matches() {
        assert!(Descriptor::Code(0x10).matches(0x10, "amqp:open:list"));
        assert!(Descriptor::Symbol("amqp:open:list".into()).matches(0x10, "amqp:open:list"));
        assert!(!Descriptor::Code(0x11).matches(0x10, "amqp:open:list"));
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<u32> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(7u32)), Value::Uint(7));
    }

    #[test]
    fn test_symbol_debug_and_display() {
        let s = Symbol::from("PLAIN");
        assert_eq!(s.to_string(), "PLAIN");
        assert_eq!(format!("{:?}", s), ":PLAIN");
    }
}
