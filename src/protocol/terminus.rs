//! Link termini: `source` and `target`.

use crate::codec::{fields_value, symbols_value, FieldList, FieldReader, Fields, FromValue, Symbol, Value};
use crate::error::Result;

pub const SOURCE_CODE: u64 = 0x28;
pub const TARGET_CODE: u64 = 0x29;

/// Terminus durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminusDurability {
    #[default]
    None = 0,
    Configuration = 1,
    UnsettledState = 2,
}

impl FromValue for TerminusDurability {
    fn from_value(value: Value) -> Result<Self> {
        Ok(match u32::from_value(value)? {
            1 => TerminusDurability::Configuration,
            2 => TerminusDurability::UnsettledState,
            _ => TerminusDurability::None,
        })
    }
}

/// Source of messages on a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Source {
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub expiry_policy: Option<Symbol>,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Fields>,
    pub distribution_mode: Option<Symbol>,
    pub filter: Option<Value>,
    pub default_outcome: Option<Value>,
    pub outcomes: Vec<Symbol>,
    pub capabilities: Vec<Symbol>,
}

impl Source {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        let mut f = FieldList::new();
        f.push(self.address.clone())
            .push(Value::Uint(self.durable as u32))
            .push(self.expiry_policy.clone())
            .push(Value::Uint(self.timeout))
            .push(self.dynamic)
            .push(fields_value(&self.dynamic_node_properties))
            .push(self.distribution_mode.clone())
            .push(self.filter.clone().unwrap_or(Value::Null))
            .push(self.default_outcome.clone().unwrap_or(Value::Null))
            .push(symbols_value(&self.outcomes))
            .push(symbols_value(&self.capabilities));
        f.into_described(SOURCE_CODE)
    }
}

impl FromValue for Source {
    fn from_value(value: Value) -> Result<Self> {
        let mut r = FieldReader::new(value, SOURCE_CODE, "source", 11)?;
        Ok(Self {
            address: r.optional()?,
            durable: r.or_default(TerminusDurability::None)?,
            expiry_policy: r.optional()?,
            timeout: r.or_default(0)?,
            dynamic: r.or_default(false)?,
            dynamic_node_properties: r.optional()?,
            distribution_mode: r.optional()?,
            filter: r.optional()?,
            default_outcome: r.optional()?,
            outcomes: r.or_default(Vec::new())?,
            capabilities: r.or_default(Vec::new())?,
        })
    }
}

/// Target of messages on a link.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Target {
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub expiry_policy: Option<Symbol>,
    pub timeout: u32,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Fields>,
    pub capabilities: Vec<Symbol>,
}

impl Target {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        let mut f = FieldList::new();
        f.push(self.address.clone())
            .push(Value::Uint(self.durable as u32))
            .push(self.expiry_policy.clone())
            .push(Value::Uint(self.timeout))
            .push(self.dynamic)
            .push(fields_value(&self.dynamic_node_properties))
            .push(symbols_value(&self.capabilities));
        f.into_described(TARGET_CODE)
    }
}

impl FromValue for Target {
    fn from_value(value: Value) -> Result<Self> {
        let mut r = FieldReader::new(value, TARGET_CODE, "target", 7)?;
        Ok(Self {
            address: r.optional()?,
            durable: r.or_default(TerminusDurability::None)?,
            expiry_policy: r.optional()?,
            timeout: r.or_default(0)?,
            dynamic: r.or_default(false)?,
            dynamic_node_properties: r.optional()?,
            capabilities: r.or_default(Vec::new())?,
        })
    }
}

impl From<&str> for Source {
    fn from(address: &str) -> Self {
        Source::new(address)
    }
}

impl From<&str> for Target {
    fn from(address: &str) -> Self {
        Target::new(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roundtrip() {
        let mut source = Source::new("queue/a");
        source.capabilities = vec![Symbol::from("topic")];
        source.durable = TerminusDurability::UnsettledState;
        let back = Source::from_value(source.to_value()).unwrap();
        assert_eq!(back, source);
    }

    #[test]
    fn test_target_defaults_for_missing_fields() {
        let value = Value::described(TARGET_CODE, Value::List(vec![Value::from("t")]));
        let target = Target::from_value(value).unwrap();
        assert_eq!(target.address.as_deref(), Some("t"));
        assert_eq!(target.timeout, 0);
        assert!(!target.dynamic);
    }
}
